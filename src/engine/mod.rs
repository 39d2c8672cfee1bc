//! Change engine: owns the change lifecycle.
//!
//! Every mutation flows through here: dry-runs build pending changes,
//! apply executes approved ones and captures revert handles, revert runs
//! the reverse operation inside the window. All writes go through the
//! store's narrow mutators; notifications are enqueued and never awaited on
//! the request path.

use crate::errors::{CoreError, CoreResult};
use crate::notify::{ChangeEvent, Notification, Notifier};
use crate::observability::MetricsRegistry;
use crate::policy::{self, Policy, PolicyContext};
use crate::providers::{AppTokenMinter, Provider, ProviderError, TargetKind};
use crate::risk;
use crate::store::Store;
use crate::tenants::check_ownership;
use crate::types::{new_change_id, ApprovalTokenKind, Change, ChangeStatus, ProviderKind};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub mod revert;

pub use revert::RevertAction;

/// Gated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Archive a repository.
    Archive,
    /// Unarchive a repository.
    Unarchive,
    /// Delete a branch.
    DeleteBranch,
    /// Close all open pull requests in a view.
    BulkClosePrs,
    /// Force-push a branch to a new head.
    ForcePush,
    /// Merge one branch into another.
    Merge,
    /// Delete a repository.
    DeleteRepository,
}

impl Operation {
    /// Wire representation, as stored in `summary_json.operation_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Unarchive => "unarchive",
            Self::DeleteBranch => "branch_delete",
            Self::BulkClosePrs => "bulk_close",
            Self::ForcePush => "force_push",
            Self::Merge => "merge",
            Self::DeleteRepository => "delete_repo",
        }
    }

    /// Whether the operation has an in-band reverse operation. Force pushes,
    /// merges and repository deletion flow through approval only; their
    /// post-hoc revert paths exist solely via webhook-captured state.
    pub fn is_reversible(&self) -> bool {
        matches!(
            self,
            Self::Archive | Self::Unarchive | Self::DeleteBranch | Self::BulkClosePrs
        )
    }

    /// The target grammar this operation requires.
    fn check_target(&self, target: &TargetKind) -> CoreResult<()> {
        let ok = matches!(
            (self, target),
            (Self::Archive, TargetKind::Repo { .. })
                | (Self::Unarchive, TargetKind::Repo { .. })
                | (Self::DeleteRepository, TargetKind::Repo { .. })
                | (Self::DeleteBranch, TargetKind::Branch { .. })
                | (Self::ForcePush, TargetKind::Branch { .. })
                | (Self::Merge, TargetKind::Merge { .. })
                | (Self::BulkClosePrs, TargetKind::Bulk { .. })
        );
        if ok {
            Ok(())
        } else {
            Err(CoreError::bad_request(format!(
                "operation {} does not accept target {}",
                self.as_str(),
                target
            )))
        }
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(Self::Archive),
            "unarchive" => Ok(Self::Unarchive),
            "branch_delete" | "delete_branch" => Ok(Self::DeleteBranch),
            "bulk_close" | "bulk_close_prs" => Ok(Self::BulkClosePrs),
            "force_push" => Ok(Self::ForcePush),
            "merge" => Ok(Self::Merge),
            "delete_repo" | "delete_repository" => Ok(Self::DeleteRepository),
            other => Err(CoreError::bad_request(format!("unknown operation: {other}"))),
        }
    }
}

/// Dry-run input.
#[derive(Debug, Clone)]
pub struct DryRunRequest {
    /// Target provider.
    pub provider: ProviderKind,
    /// Operation to gate.
    pub operation: Operation,
    /// Provider target grammar.
    pub target_id: String,
    /// Caller-supplied provider credential.
    pub credential: String,
    /// Owning tenant.
    pub caller_api_key: String,
    /// Free-text reason shown to approvers.
    pub reason: Option<String>,
    /// Caller-supplied policy blob; the configured default applies
    /// otherwise.
    pub policy: Option<Value>,
    /// Per-change custom notification URL.
    pub webhook_url: Option<String>,
    /// New head for force pushes.
    pub commit_sha: Option<String>,
    /// Merge commit message.
    pub commit_message: Option<String>,
}

/// Dry-run outcome.
#[derive(Debug, Clone)]
pub struct DryRunResult {
    /// Created change id.
    pub change_id: String,
    /// Always true under the blanket-approval policy.
    pub requires_approval: bool,
    /// One-time approval link, when approval is required.
    pub approve_url: Option<String>,
    /// Normalized risk score.
    pub risk_score: f64,
    /// Combined risk and policy reasons.
    pub reasons: Vec<String>,
    /// Preview shown to approvers.
    pub human_preview: String,
    /// Revert link, for reversible operations.
    pub revert_url: Option<String>,
    /// Revert window in hours, when reversible.
    pub revert_window_hours: Option<i64>,
    /// Approval deadline.
    pub expires_at: DateTime<Utc>,
    /// Whether the operation has an in-band reverse.
    pub is_reversible: bool,
    /// Affected record count for bulk views.
    pub records_affected: Option<i64>,
}

/// Apply outcome.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Change id.
    pub change_id: String,
    /// Post-apply status.
    pub status: ChangeStatus,
    /// Plaintext revert token, when the operation is revertable.
    pub revert_token: Option<String>,
    /// Revert link.
    pub revert_url: Option<String>,
    /// Revert deadline.
    pub revert_expires_at: Option<DateTime<Utc>>,
}

/// Revert outcome.
#[derive(Debug, Clone)]
pub struct RevertResult {
    /// Change id.
    pub change_id: String,
    /// Post-revert status.
    pub status: ChangeStatus,
}

/// Engine knobs lifted from configuration at boot.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Base URL for human approval links.
    pub app_base_url: String,
    /// Base URL for API revert links.
    pub api_base_url: String,
    /// Approval deadline for pending changes.
    pub approval_ttl: Duration,
    /// Revert window applied to every change.
    pub revert_window_hours: i64,
    /// API keys allowed to bypass the approval flag.
    pub admin_api_keys: Vec<String>,
    /// Default policy blob.
    pub default_policy_json: Option<String>,
}

impl EngineOptions {
    /// Lifts the engine knobs from the core configuration.
    pub fn from_config(config: &crate::config::CoreConfig) -> Self {
        Self {
            app_base_url: config.app_base_url.clone(),
            api_base_url: config.api_base_url.clone(),
            approval_ttl: Duration::seconds(
                crate::config::DEFAULT_APPROVAL_TTL.as_secs() as i64
            ),
            revert_window_hours: crate::config::DEFAULT_REVERT_WINDOW_HOURS,
            admin_api_keys: config.admin_api_keys.clone(),
            default_policy_json: config.default_policy_json.clone(),
        }
    }
}

enum PostExec {
    /// CLI/SDK poll path.
    Applied,
    /// Synchronous execution out of an approval.
    Executed,
}

/// The change engine.
pub struct ChangeEngine {
    store: Arc<dyn Store>,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    notifier: Notifier,
    metrics: Arc<MetricsRegistry>,
    minter: Option<Arc<AppTokenMinter>>,
    opts: EngineOptions,
}

impl std::fmt::Debug for ChangeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEngine")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ChangeEngine {
    /// Creates the engine.
    pub fn new(
        store: Arc<dyn Store>,
        providers: HashMap<ProviderKind, Arc<dyn Provider>>,
        notifier: Notifier,
        metrics: Arc<MetricsRegistry>,
        minter: Option<Arc<AppTokenMinter>>,
        opts: EngineOptions,
    ) -> Self {
        Self {
            store,
            providers,
            notifier,
            metrics,
            minter,
            opts,
        }
    }

    /// The store behind the engine (shared with the gateway and scheduler).
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// The notifier handle.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    fn provider(&self, kind: ProviderKind) -> CoreResult<Arc<dyn Provider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| CoreError::bad_request(format!("unsupported provider: {kind}")))
    }

    fn revert_url(&self, change_id: &str) -> String {
        format!("{}/webhooks/github/revert/{change_id}", self.opts.api_base_url)
    }

    fn default_policy(&self) -> Policy {
        self.opts
            .default_policy_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| Policy::from_value(&v))
            .unwrap_or_else(Policy::default_rules)
    }

    /// Evaluates and persists a dry-run: metadata, risk, policy, pending
    /// change, one-time approval token, notification.
    pub async fn dry_run(&self, req: DryRunRequest) -> CoreResult<DryRunResult> {
        let started = Instant::now();
        let provider = self.provider(req.provider)?;
        let target = TargetKind::parse(&req.target_id)?;
        req.operation.check_target(&target)?;

        let mut metadata = provider
            .get_metadata(&target, &req.credential)
            .await
            .map_err(ProviderError::into_core)?;
        let blocks = provider
            .get_children_count(&target, &req.credential)
            .await
            .map_err(ProviderError::into_core)?;

        // Mark irreversible operations so the risk table can see them; the
        // object kind alone does not distinguish archive from delete.
        match req.operation {
            Operation::ForcePush => metadata["operation_type"] = json!("force_push"),
            Operation::DeleteRepository => metadata["operation_type"] = json!("delete_repo"),
            _ => {}
        }
        if let Some(sha) = &req.commit_sha {
            metadata["commit_sha"] = json!(sha);
        }
        if let Some(message) = &req.commit_message {
            metadata["commit_message"] = json!(message);
        }

        let title = metadata
            .get("name")
            .or_else(|| metadata.get("title"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| req.target_id.clone());
        let last_edit = ["lastPushedAt", "lastCommitDate", "last_edited_time"]
            .iter()
            .find_map(|key| metadata.get(*key).and_then(Value::as_str))
            .and_then(crate::providers::github::parse_provider_timestamp);

        let now = Utc::now();
        let assessment = risk::compute_risk(req.provider, Some(&title), last_edit, &metadata, now);
        let normalized = risk::normalize(assessment.score);

        let policy = req
            .policy
            .as_ref()
            .and_then(Policy::from_value)
            .unwrap_or_else(|| self.default_policy());
        let ctx = PolicyContext {
            risk_score: normalized,
            title: Some(title.clone()),
            blocks_count: blocks,
            parent_type: metadata
                .get("parent_type")
                .and_then(Value::as_str)
                .map(String::from),
            edited_age_hours: risk::edited_age_hours(last_edit, now),
        };
        let (_policy_need, policy_hits) = policy::evaluate(&ctx, &policy);

        let mut reasons = assessment.reasons.clone();
        reasons.extend(policy_hits.iter().map(|h| format!("policy:{h}")));

        let is_reversible = req.operation.is_reversible();
        reasons.push(if is_reversible {
            "github:reversible_operation".to_string()
        } else {
            "github:irreversible_operation".to_string()
        });
        let default_branch = metadata.get("default_branch").and_then(Value::as_str);
        let touches_mainline = match &target {
            TargetKind::Repo { .. } => true,
            TargetKind::Branch { branch, .. } => {
                metadata.get("isDefault").and_then(Value::as_bool) == Some(true)
                    || default_branch == Some(branch.as_str())
            }
            TargetKind::Merge { .. } => {
                metadata.get("isTargetDefault").and_then(Value::as_bool) == Some(true)
            }
            TargetKind::Bulk { .. } => false,
        };
        if touches_mainline {
            reasons.push("github:main_branch_protection".to_string());
        }

        // Blanket policy: every operation pauses for a human, and every
        // executed operation gets the same bounded revert window.
        let requires_approval = true;
        let revert_window_hours = self.opts.revert_window_hours;

        let human_preview = risk::human_preview(
            req.operation.as_str(),
            Some(&title),
            last_edit,
            normalized,
            &reasons,
        );

        let change_id = new_change_id();
        let expires_at = now + self.opts.approval_ttl;
        let revert_expires_at = now + Duration::hours(revert_window_hours);
        let records_affected = match &target {
            TargetKind::Bulk { .. } => Some(blocks),
            _ => None,
        };

        let summary_json = json!({
            "operation_type": req.operation.as_str(),
            "provider": req.provider.to_string(),
            "target_id": req.target_id,
            "title": title,
            "risk_score": normalized,
            "reasons": reasons,
            "blocks": blocks,
            "last_edit": last_edit.map(|t| t.to_rfc3339()),
            "reason": req.reason.clone().unwrap_or_default(),
        });

        let change = Change {
            change_id: change_id.clone(),
            provider: req.provider,
            target_id: req.target_id.clone(),
            title: Some(title),
            status: ChangeStatus::Pending,
            risk_score: normalized,
            requires_approval,
            reasons: reasons.clone(),
            policy_json: policy.to_value(),
            summary_json,
            metadata,
            token: Some(req.credential.clone()),
            revert_token: None,
            created_at: now,
            expires_at,
            last_edited_time: last_edit,
            revert_window: Some(revert_window_hours),
            revert_expires_at: Some(revert_expires_at),
            api_key: Some(req.caller_api_key.clone()),
            webhook_url: req.webhook_url.clone(),
            human_preview: Some(human_preview.clone()),
            branch_head_sha: None,
            chat_message_id: None,
        };
        self.store.upsert_change(&change).await?;

        let approval_token = self
            .store
            .create_approval_token(&change_id, ApprovalTokenKind::Approve, self.opts.approval_ttl)
            .await?;
        let approve_url = format!(
            "{}/approvals/{change_id}?token={approval_token}",
            self.opts.app_base_url
        );
        let reject_url = format!(
            "{}/approvals/{change_id}/reject?token={approval_token}",
            self.opts.app_base_url
        );
        let revert_url = is_reversible.then(|| self.revert_url(&change_id));

        self.store
            .insert_audit(
                &change_id,
                "dry_run",
                &json!({ "summary": { "title": change.title, "blocks": blocks } }),
            )
            .await?;

        self.notifier.publish(Notification {
            event: ChangeEvent::DryRun,
            change: change.clone(),
            extras: json!({ "approve_url": approve_url, "reject_url": reject_url }),
            api_key: Some(req.caller_api_key.clone()),
        });

        self.metrics
            .record_request(&req.provider.to_string(), "dryrun");
        self.metrics
            .observe_latency("dryrun", started.elapsed().as_millis() as u64);
        info!(change_id, target = %req.target_id, risk = normalized, "dry-run created");

        Ok(DryRunResult {
            change_id,
            requires_approval,
            approve_url: Some(approve_url),
            risk_score: normalized,
            reasons,
            human_preview,
            revert_url,
            revert_window_hours: Some(revert_window_hours),
            expires_at,
            is_reversible,
            records_affected,
        })
    }

    /// Status poll for the CLI/SDK path. Ownership is enforced; the
    /// returned record never carries credentials.
    pub async fn get_change(&self, change_id: &str, caller_api_key: &str) -> CoreResult<Change> {
        let mut change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| CoreError::not_found("change not found"))?;
        check_ownership(&change, caller_api_key)?;
        change.token = None;
        change.revert_token = None;
        Ok(change)
    }

    /// Applies a change via the poll path. Idempotent for already-executed
    /// changes; expired changes fail `Gone`; unapproved changes fail
    /// `Forbidden` unless the caller passes the approval flag or is an
    /// admin.
    pub async fn apply(
        &self,
        change_id: &str,
        caller_api_key: &str,
        approval_flag: bool,
        credential_override: Option<&str>,
    ) -> CoreResult<ApplyResult> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| CoreError::not_found("change not found"))?;
        check_ownership(&change, caller_api_key)?;

        // Idempotent re-apply: hand back the prior revert handle, touch
        // nothing upstream.
        if matches!(change.status, ChangeStatus::Applied | ChangeStatus::Executed) {
            return Ok(ApplyResult {
                change_id: change.change_id.clone(),
                status: change.status,
                revert_token: change.revert_token.clone(),
                revert_url: change
                    .revert_token
                    .is_some()
                    .then(|| self.revert_url(&change.change_id)),
                revert_expires_at: change.revert_expires_at,
            });
        }

        match change.status {
            ChangeStatus::Pending | ChangeStatus::Approved => {}
            ChangeStatus::Expired => return Err(CoreError::gone("change expired")),
            other => {
                return Err(CoreError::conflict(format!(
                    "cannot apply: change is {other}"
                )))
            }
        }

        if Utc::now() > change.expires_at {
            self.store
                .set_change_status(&change.change_id, ChangeStatus::Expired)
                .await?;
            self.store
                .insert_audit(&change.change_id, "expired", &json!({}))
                .await?;
            return Err(CoreError::gone("approval window elapsed"));
        }

        let is_admin = self.opts.admin_api_keys.iter().any(|k| k == caller_api_key);
        if change.requires_approval && !approval_flag && !is_admin {
            return Err(CoreError::forbidden("approval required before apply"));
        }

        let credential = match credential_override {
            Some(c) => c.to_string(),
            None => change
                .token
                .clone()
                .ok_or_else(|| CoreError::bad_request("no credential available for apply"))?,
        };

        self.check_concurrency(&change, &credential).await?;
        self.execute(change, &credential, PostExec::Applied).await
    }

    /// Executes a change synchronously out of an approval decision. Called
    /// by the approval gateway after the one-time token was consumed.
    pub async fn execute_approved(&self, change_id: &str) -> CoreResult<ApplyResult> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| CoreError::not_found("change not found"))?;

        if matches!(change.status, ChangeStatus::Applied | ChangeStatus::Executed) {
            return Ok(ApplyResult {
                change_id: change.change_id.clone(),
                status: change.status,
                revert_token: change.revert_token.clone(),
                revert_url: Some(self.revert_url(&change.change_id)),
                revert_expires_at: change.revert_expires_at,
            });
        }

        let credential = match change.token.clone() {
            Some(token) => token,
            None => self.mint_app_credential(&change).await?,
        };
        self.execute(change, &credential, PostExec::Executed).await
    }

    /// Optimistic-concurrency check: where the provider supplied a
    /// last-modified token at dry-run time, a change since then fails
    /// `Conflict`.
    async fn check_concurrency(&self, change: &Change, credential: &str) -> CoreResult<()> {
        let captured = match change.last_edited_time {
            Some(ts) => ts,
            None => return Ok(()),
        };
        let provider = self.provider(change.provider)?;
        let target = TargetKind::parse(&change.target_id)?;
        let metadata = provider
            .get_metadata(&target, credential)
            .await
            .map_err(ProviderError::into_core)?;
        let current = ["lastPushedAt", "lastCommitDate", "last_edited_time"]
            .iter()
            .find_map(|key| metadata.get(*key).and_then(Value::as_str))
            .and_then(crate::providers::github::parse_provider_timestamp);

        match current {
            Some(current) if current != captured => Err(CoreError::conflict(
                "target changed since dry-run; re-run the dry-run",
            )),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        change: Change,
        credential: &str,
        post: PostExec,
    ) -> CoreResult<ApplyResult> {
        let started = Instant::now();
        let provider = self.provider(change.provider)?;
        let target = TargetKind::parse(&change.target_id)?;
        let operation: Operation = change
            .summary_json
            .get("operation_type")
            .and_then(Value::as_str)
            .unwrap_or("archive")
            .parse()?;

        let mut summary = change.summary_json.clone();
        let outcome = self
            .run_mutator(&*provider, operation, &target, &change, credential, &mut summary)
            .await;

        let revert_action = match outcome {
            Ok(action) => action,
            Err(e) => return self.fail_execution(&change, e).await,
        };

        if let Some(action) = &revert_action {
            summary["revert_action"] = action.to_value();
        }
        self.store
            .update_summary_json(&change.change_id, &summary)
            .await?;

        // Fresh one-time revert capability, bounded by the revert window.
        let mut revert_token_plain = None;
        if revert_action.is_some() {
            let plain = format!("rvk_{}", Uuid::new_v4().simple());
            self.store
                .set_revert_token(&change.change_id, &plain)
                .await?;
            let revert_ttl = change
                .revert_expires_at
                .map(|deadline| deadline - Utc::now())
                .filter(|ttl| *ttl > Duration::zero())
                .unwrap_or_else(|| Duration::hours(self.opts.revert_window_hours));
            self.store
                .insert_approval_token(
                    &plain,
                    &change.change_id,
                    ApprovalTokenKind::Revert,
                    revert_ttl,
                )
                .await?;
            revert_token_plain = Some(plain);
        }

        let (status, event, audit_event) = match post {
            PostExec::Applied => (ChangeStatus::Applied, ChangeEvent::Applied, "applied"),
            PostExec::Executed => (
                ChangeStatus::Executed,
                ChangeEvent::ExecutedWithRevert,
                "executed",
            ),
        };
        self.store
            .set_change_status(&change.change_id, status)
            .await?;
        self.store
            .insert_audit(&change.change_id, audit_event, &json!({}))
            .await?;
        self.metrics.record_change_status(status.as_str());
        self.metrics
            .observe_latency("apply", started.elapsed().as_millis() as u64);

        let mut notified = change.clone();
        notified.status = status;
        notified.summary_json = summary;
        notified.revert_token = revert_token_plain.clone();
        let extras = json!({
            "revert_url": revert_token_plain.is_some().then(|| self.revert_url(&change.change_id)),
            "revert_window_hours": change.revert_window,
        });
        self.notifier.publish(Notification {
            event,
            change: notified,
            extras,
            api_key: change.api_key.clone(),
        });

        info!(change_id = %change.change_id, status = %status, "change executed");
        Ok(ApplyResult {
            change_id: change.change_id.clone(),
            status,
            revert_url: revert_token_plain
                .is_some()
                .then(|| self.revert_url(&change.change_id)),
            revert_token: revert_token_plain,
            revert_expires_at: change.revert_expires_at,
        })
    }

    async fn run_mutator(
        &self,
        provider: &dyn Provider,
        operation: Operation,
        target: &TargetKind,
        change: &Change,
        credential: &str,
        summary: &mut Value,
    ) -> Result<Option<RevertAction>, ProviderError> {
        let (owner, repo) = target.owner_repo();
        let (owner, repo) = (owner.to_string(), repo.to_string());

        match operation {
            Operation::Archive => {
                provider.archive(target, credential).await?;
                Ok(Some(RevertAction::RepositoryUnarchive { owner, repo }))
            }
            Operation::Unarchive => {
                provider.unarchive(target, credential).await?;
                Ok(Some(RevertAction::RepositoryArchive { owner, repo }))
            }
            Operation::DeleteBranch => {
                let sha = provider.delete_branch(target, credential).await?;
                summary["github_restore_sha"] = json!(sha);
                Ok(Some(RevertAction::BranchRestore {
                    owner,
                    repo,
                    branch: target.branch().unwrap_or_default().to_string(),
                    sha: Some(sha),
                }))
            }
            Operation::BulkClosePrs => {
                let numbers = provider.bulk_close_prs(target, credential, None).await?;
                summary["closed_pr_numbers"] = json!(numbers);
                Ok(Some(RevertAction::BulkReopen {
                    owner,
                    repo,
                    pr_numbers: numbers,
                }))
            }
            Operation::ForcePush => {
                let new_sha = change
                    .metadata
                    .get("commit_sha")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProviderError::Other("force push requires a commit_sha".into())
                    })?;
                let outcome = provider.force_push(target, credential, new_sha).await?;
                summary["before_sha"] = json!(outcome.previous_sha);
                summary["after_sha"] = json!(outcome.new_sha);
                // Revertable only because the previous head was captured.
                Ok(Some(RevertAction::ForcePushRevert {
                    owner,
                    repo,
                    branch: target.branch().unwrap_or_default().to_string(),
                    before_sha: Some(outcome.previous_sha),
                }))
            }
            Operation::Merge => {
                let message = change.metadata.get("commit_message").and_then(Value::as_str);
                let outcome = provider.merge(target, credential, message).await?;
                summary["merge_sha"] = json!(outcome.merge_sha);
                let branch = match target {
                    TargetKind::Merge { target, .. } => target.clone(),
                    _ => String::new(),
                };
                Ok(Some(RevertAction::MergeRevert {
                    owner,
                    repo,
                    branch,
                    merge_commit_sha: outcome.merge_sha,
                }))
            }
            Operation::DeleteRepository => {
                provider.delete_repository(target, credential).await?;
                Ok(None)
            }
        }
    }

    /// Adapter failure handling: transient failures leave the change
    /// untouched for a retry; definitive upstream failures are terminal.
    async fn fail_execution(
        &self,
        change: &Change,
        error: ProviderError,
    ) -> CoreResult<ApplyResult> {
        match &error {
            ProviderError::Transient(_) | ProviderError::RateLimit { .. } => {
                warn!(change_id = %change.change_id, error = %error, "apply failed transiently");
                Err(error.into_core())
            }
            _ => {
                self.store
                    .set_change_status(&change.change_id, ChangeStatus::Failed)
                    .await?;
                self.store
                    .insert_audit(
                        &change.change_id,
                        "failed",
                        &json!({ "phase": "apply", "error": error.to_string() }),
                    )
                    .await?;
                self.metrics.record_change_status("failed");
                Err(error.into_core())
            }
        }
    }

    async fn mint_app_credential(&self, change: &Change) -> CoreResult<String> {
        let minter = self
            .minter
            .as_ref()
            .ok_or_else(|| CoreError::bad_request("no credential available for this change"))?;

        let installation_id = match change
            .summary_json
            .get("installation_id")
            .and_then(Value::as_i64)
        {
            Some(id) => id,
            None => {
                let (owner, repo) = TargetKind::parse(&change.target_id)
                    .map(|t| {
                        let (o, r) = t.owner_repo();
                        (o.to_string(), r.to_string())
                    })
                    .unwrap_or_default();
                let full_name = format!("{owner}/{repo}");
                self.store
                    .find_installation_by_repo(&full_name)
                    .await?
                    .map(|i| i.installation_id)
                    .ok_or_else(|| {
                        CoreError::bad_request("no App installation covers this repository")
                    })?
            }
        };

        let token = minter
            .installation_token(installation_id)
            .await
            .map_err(ProviderError::into_core)?;
        Ok(token.token)
    }

    /// Reverts a change by its revert token. Idempotent when the change is
    /// already reverted; fails `Gone` past the revert deadline.
    pub async fn revert(
        &self,
        revert_token: &str,
        caller_api_key: &str,
        credential_override: Option<&str>,
    ) -> CoreResult<RevertResult> {
        let change = self
            .store
            .get_change_by_revert_token(revert_token)
            .await?
            .ok_or_else(|| CoreError::not_found("change not found"))?;
        check_ownership(&change, caller_api_key)?;
        self.revert_loaded(change, credential_override).await
    }

    /// Reverts an already-loaded change. The approval gateway uses this
    /// after a one-time revert token was consumed (the token itself is the
    /// capability, so no tenant check happens here).
    pub async fn revert_loaded(
        &self,
        change: Change,
        credential_override: Option<&str>,
    ) -> CoreResult<RevertResult> {
        let started = Instant::now();

        if change.status == ChangeStatus::Reverted {
            return Ok(RevertResult {
                change_id: change.change_id,
                status: ChangeStatus::Reverted,
            });
        }
        if !matches!(change.status, ChangeStatus::Executed | ChangeStatus::Applied) {
            return Err(CoreError::conflict(format!(
                "cannot revert: change is {}",
                change.status
            )));
        }
        if let Some(deadline) = change.revert_expires_at {
            if Utc::now() > deadline {
                return Err(CoreError::gone("revert window elapsed"));
            }
        }

        let mut action = RevertAction::from_summary(&change.summary_json)
            .ok_or_else(|| CoreError::bad_request("no revert action available"))?;

        let credential = match credential_override {
            Some(c) => c.to_string(),
            None => match change.token.clone() {
                Some(token) => token,
                None => self.mint_app_credential(&change).await?,
            },
        };

        let provider = self.provider(change.provider)?;

        // Resolve the restore SHA up front: a change we cannot restore is a
        // validation failure, not an upstream one, and must not go terminal.
        if matches!(&action, RevertAction::BranchRestore { sha: None, .. }) {
            let resolved = revert::resolve_restore_sha(
                &action,
                &change.summary_json,
                change.branch_head_sha.as_deref(),
                &*self.store,
                &*provider,
                &credential,
            )
            .await?;
            if let RevertAction::BranchRestore { sha, .. } = &mut action {
                *sha = Some(resolved);
            }
        }
        if let Err(e) = self
            .run_revert(&*provider, &action, &change, &credential)
            .await
        {
            return match &e {
                ProviderError::Transient(_) | ProviderError::RateLimit { .. } => {
                    warn!(change_id = %change.change_id, error = %e, "revert failed transiently");
                    Err(e.into_core())
                }
                _ => {
                    self.store
                        .set_change_status(&change.change_id, ChangeStatus::Failed)
                        .await?;
                    self.store
                        .insert_audit(
                            &change.change_id,
                            "failed",
                            &json!({ "phase": "revert", "error": e.to_string() }),
                        )
                        .await?;
                    self.metrics.record_change_status("failed");
                    Err(e.into_core())
                }
            };
        }

        self.store
            .set_change_status(&change.change_id, ChangeStatus::Reverted)
            .await?;
        self.store
            .insert_audit(&change.change_id, "reverted", &json!({}))
            .await?;
        self.metrics.record_change_status("reverted");
        self.metrics
            .observe_latency("revert", started.elapsed().as_millis() as u64);

        let mut notified = change.clone();
        notified.status = ChangeStatus::Reverted;
        let extras = if matches!(action, RevertAction::MergeRevert { .. }) {
            json!({ "note": "merge reverted with a counter-commit; Git history still contains the merge" })
        } else {
            json!({})
        };
        self.notifier.publish(Notification {
            event: ChangeEvent::Reverted,
            change: notified,
            extras,
            api_key: change.api_key.clone(),
        });

        info!(change_id = %change.change_id, "change reverted");
        Ok(RevertResult {
            change_id: change.change_id,
            status: ChangeStatus::Reverted,
        })
    }

    async fn run_revert(
        &self,
        provider: &dyn Provider,
        action: &RevertAction,
        change: &Change,
        credential: &str,
    ) -> Result<(), ProviderError> {
        let (owner, repo) = action.owner_repo();
        let repo_target = TargetKind::Repo {
            owner: owner.to_string(),
            repo: repo.to_string(),
        };

        match action {
            RevertAction::BranchRestore { branch, sha, .. } => {
                let sha = sha.as_deref().ok_or_else(|| {
                    ProviderError::Other("branch restore requires a resolved SHA".into())
                })?;
                let target = TargetKind::Branch {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    branch: branch.clone(),
                };
                provider.restore_branch(&target, credential, sha).await
            }
            RevertAction::ForcePushRevert {
                branch, before_sha, ..
            } => {
                let before = before_sha
                    .as_deref()
                    .or_else(|| {
                        change
                            .summary_json
                            .pointer("/payload/before")
                            .and_then(Value::as_str)
                    })
                    .ok_or_else(|| {
                        ProviderError::Other("force-push revert requires the previous SHA".into())
                    })?;
                let target = TargetKind::Branch {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    branch: branch.clone(),
                };
                provider.revert_force_push(&target, credential, before).await
            }
            RevertAction::MergeRevert {
                branch,
                merge_commit_sha,
                ..
            } => {
                let sha = merge_commit_sha.as_deref().ok_or_else(|| {
                    ProviderError::Other("merge revert requires the merge commit SHA".into())
                })?;
                let target = TargetKind::Branch {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    branch: branch.clone(),
                };
                provider.create_counter_commit(&target, credential, sha).await
            }
            RevertAction::RepositoryUnarchive { .. } => {
                provider.unarchive(&repo_target, credential).await
            }
            RevertAction::RepositoryArchive { .. } => {
                provider.archive(&repo_target, credential).await
            }
            RevertAction::BulkReopen { pr_numbers, .. } => {
                provider
                    .bulk_reopen(&repo_target, credential, pr_numbers)
                    .await
            }
            RevertAction::SecretDelete { secret_name, .. } => {
                provider
                    .delete_secret(&repo_target, credential, secret_name)
                    .await
            }
            RevertAction::VisibilityRevert { private, .. } => {
                provider
                    .set_visibility(&repo_target, credential, *private)
                    .await
            }
            RevertAction::BranchProtectionRestore {
                branch, protection, ..
            } => {
                provider
                    .put_branch_protection(&repo_target, credential, branch, protection)
                    .await
            }
            RevertAction::WorkflowRestore {
                path,
                content,
                prior_sha,
                ..
            } => {
                provider
                    .put_workflow_file(
                        &repo_target,
                        credential,
                        path,
                        content,
                        "Restore workflow to prior state",
                        prior_sha.as_deref(),
                    )
                    .await
            }
        }
    }
}
