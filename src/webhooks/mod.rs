//! Webhook ingress: authenticates upstream events, correlates them with
//! in-flight changes, and records out-of-band mutations with revert
//! handles ("reactive governance").
//!
//! Every inbound event is authenticated by constant-time comparison of an
//! HMAC-SHA256 over the raw body. Chat-platform callbacks additionally
//! enforce a ±5-minute timestamp window against replay.

use crate::engine::RevertAction;
use crate::errors::{CoreError, CoreResult};
use crate::notify::{ChangeEvent, Notification, Notifier};
use crate::observability::MetricsRegistry;
use crate::providers::{AppTokenMinter, Provider, TargetKind};
use crate::risk;
use crate::store::{CorrelationQuery, Store};
use crate::types::{
    new_change_id, ApprovalTokenKind, Change, ChangeStatus, InstallationRecord, ProviderKind,
};
use chrono::{Duration, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Correlation lookback for matching events to in-flight changes.
const CORRELATION_WINDOW_MINUTES: i64 = 5;

/// Timestamp tolerance for signed chat callbacks.
const CHAT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// The all-zero SHA upstream sends for created refs.
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Verifies provider webhook signatures (`X-Hub-Signature-256` style).
pub struct SignatureVerifier {
    secret: SecretString,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier over the shared secret.
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Verifies `sha256=<hex>` over the raw body, constant-time.
    pub fn verify(&self, body: &[u8], signature_header: Option<&str>) -> CoreResult<()> {
        let header = signature_header
            .ok_or_else(|| CoreError::unauthorized("missing webhook signature"))?;
        let hex_digest = header
            .strip_prefix("sha256=")
            .ok_or_else(|| CoreError::unauthorized("malformed webhook signature"))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        if constant_time_eq(expected.as_bytes(), hex_digest.as_bytes()) {
            Ok(())
        } else {
            Err(CoreError::unauthorized("invalid webhook signature"))
        }
    }
}

/// Verifies signed chat-platform requests (`v0=` signature over
/// `v0:timestamp:body`) with replay protection.
pub struct ChatRequestVerifier {
    signing_secret: SecretString,
}

impl std::fmt::Debug for ChatRequestVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequestVerifier")
            .field("signing_secret", &"[REDACTED]")
            .finish()
    }
}

impl ChatRequestVerifier {
    /// Creates a verifier over the signing secret.
    pub fn new(signing_secret: SecretString) -> Self {
        Self { signing_secret }
    }

    /// Verifies signature and timestamp window.
    pub fn verify(&self, timestamp: &str, signature: &str, body: &[u8]) -> CoreResult<()> {
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| CoreError::unauthorized("invalid request timestamp"))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if (now - ts).abs() > CHAT_TIMESTAMP_TOLERANCE_SECS {
            return Err(CoreError::unauthorized("request timestamp outside window"));
        }

        let mut base = format!("v0:{timestamp}:").into_bytes();
        base.extend_from_slice(body);
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(&base);
        let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            Ok(())
        } else {
            Err(CoreError::unauthorized("invalid request signature"))
        }
    }
}

/// What the ingress did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Dropped: bot loop, empty push, or uninteresting event.
    Ignored {
        /// Why the event was dropped.
        reason: &'static str,
    },
    /// A pending change already covers this operation; consumed silently.
    CorrelatedPending {
        /// The in-flight change.
        change_id: String,
    },
    /// An approved/executed change was enriched with the revert descriptor.
    CorrelatedExecuted {
        /// The updated change.
        change_id: String,
    },
    /// A new post-hoc change was recorded.
    Recorded {
        /// The new change.
        change_id: String,
        /// Raw risk score (0–10).
        risk_score: f64,
        /// Whether the high-risk alert fired.
        high_risk: bool,
    },
    /// An installation lifecycle event was processed.
    Installation {
        /// What happened.
        action: String,
        /// Installation id.
        installation_id: i64,
    },
}

/// Derives the revert descriptor an observed event permits, if any.
pub fn create_revert_action(event_type: &str, payload: &Value) -> Option<RevertAction> {
    let owner = payload
        .pointer("/repository/owner/login")
        .and_then(Value::as_str)?
        .to_string();
    let repo = payload
        .pointer("/repository/name")
        .and_then(Value::as_str)?
        .to_string();

    match event_type {
        "push" if payload.get("forced").and_then(Value::as_bool) == Some(true) => {
            Some(RevertAction::ForcePushRevert {
                owner,
                repo,
                branch: payload
                    .get("ref")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim_start_matches("refs/heads/")
                    .to_string(),
                before_sha: payload
                    .get("before")
                    .and_then(Value::as_str)
                    .filter(|s| *s != ZERO_SHA)
                    .map(String::from),
            })
        }
        "delete" if payload.get("ref_type").and_then(Value::as_str) == Some("branch") => {
            Some(RevertAction::BranchRestore {
                owner,
                repo,
                branch: payload
                    .get("ref")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                // Populated later from stored push records or the event feed.
                sha: None,
            })
        }
        "pull_request" => {
            let merged = payload
                .pointer("/pull_request/merged")
                .and_then(Value::as_bool)
                == Some(true);
            if payload.get("action").and_then(Value::as_str) == Some("closed") && merged {
                Some(RevertAction::MergeRevert {
                    owner,
                    repo,
                    branch: payload
                        .pointer("/pull_request/base/ref")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    merge_commit_sha: payload
                        .pointer("/pull_request/merge_commit_sha")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            } else {
                None
            }
        }
        "repository" => match payload.get("action").and_then(Value::as_str) {
            Some("archived") => Some(RevertAction::RepositoryUnarchive { owner, repo }),
            // Repository deletion is irreversible; no descriptor.
            _ => None,
        },
        _ => None,
    }
}

fn action_type(event_type: &str, payload: &Value) -> String {
    if payload.get("forced").and_then(Value::as_bool) == Some(true) {
        return "github_force_push".to_string();
    }
    if event_type == "delete" {
        let ref_type = payload
            .get("ref_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return format!("github_delete_{ref_type}");
    }
    if event_type == "pull_request"
        && payload.get("action").and_then(Value::as_str) == Some("closed")
        && payload.pointer("/pull_request/merged").and_then(Value::as_bool) == Some(true)
    {
        return "github_merge".to_string();
    }
    format!("github_{event_type}")
}

/// The webhook ingress.
pub struct WebhookIngress {
    store: Arc<dyn Store>,
    notifier: Notifier,
    metrics: Arc<MetricsRegistry>,
    provider: Arc<dyn Provider>,
    minter: Option<Arc<AppTokenMinter>>,
    bot_logins: Vec<String>,
    api_base_url: String,
    revert_window_hours: i64,
}

impl std::fmt::Debug for WebhookIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIngress")
            .field("bot_logins", &self.bot_logins)
            .finish_non_exhaustive()
    }
}

impl WebhookIngress {
    /// Creates the ingress.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Notifier,
        metrics: Arc<MetricsRegistry>,
        provider: Arc<dyn Provider>,
        minter: Option<Arc<AppTokenMinter>>,
        bot_logins: Vec<String>,
        api_base_url: String,
        revert_window_hours: i64,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
            provider,
            minter,
            bot_logins,
            api_base_url,
            revert_window_hours,
        }
    }

    /// Handles one authenticated event.
    pub async fn handle_event(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> CoreResult<Disposition> {
        self.metrics.record_request("github", "webhook");

        if event_type == "installation" || event_type == "installation_repositories" {
            return self.handle_installation(payload).await;
        }

        let repo_full_name = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown/unknown")
            .to_string();
        let sender_login = payload
            .pointer("/sender/login")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        // Our own bot's mutations (reverts) must not open new changes.
        if self.bot_logins.iter().any(|b| b == sender_login) {
            debug!(repo = %repo_full_name, "ignoring event from own bot identity");
            return Ok(Disposition::Ignored { reason: "bot_loop" });
        }

        if event_type == "push" {
            let commits = payload
                .get("commits")
                .and_then(Value::as_array)
                .map(|c| c.len())
                .unwrap_or(0);
            let deleted = payload.get("deleted").and_then(Value::as_bool) == Some(true);
            if commits == 0 && !deleted {
                // Branch creation: capture the head SHA for a future
                // delete-revert, then drop.
                self.record_branch_creation(&repo_full_name, payload).await?;
                return Ok(Disposition::Ignored {
                    reason: "branch_creation",
                });
            }
            if commits == 0 && deleted {
                // The delete event covers this.
                return Ok(Disposition::Ignored { reason: "empty_push" });
            }
        }

        let assessment = risk::score_webhook_event(event_type, payload);
        let action = action_type(event_type, payload);

        if matches!(action.as_str(), "github_merge" | "github_force_push") {
            if let Some(disposition) = self
                .correlate(&repo_full_name, &action, event_type, payload)
                .await?
            {
                return Ok(disposition);
            }
        }

        self.record_uncorrelated(event_type, payload, &repo_full_name, &action, assessment)
            .await
    }

    /// Correlation window: a matching pending change means the CLI path
    /// already notified; a matching approved/executed change gets enriched
    /// with the revert descriptor the payload carries.
    async fn correlate(
        &self,
        repo_full_name: &str,
        action: &str,
        event_type: &str,
        payload: &Value,
    ) -> CoreResult<Option<Disposition>> {
        let operation_pattern = match action {
            "github_merge" => "merge",
            "github_force_push" => "force_push",
            other => other,
        };
        let since = Utc::now() - Duration::minutes(CORRELATION_WINDOW_MINUTES);

        let pending = self
            .store
            .find_correlated_change(&CorrelationQuery {
                repo_full_name: repo_full_name.to_string(),
                operation_type: operation_pattern.to_string(),
                statuses: vec![ChangeStatus::Pending],
                since,
            })
            .await?;
        if let Some(change) = pending {
            info!(change_id = %change.change_id, "webhook correlated with pending change; skipping");
            return Ok(Some(Disposition::CorrelatedPending {
                change_id: change.change_id,
            }));
        }

        let executed = self
            .store
            .find_correlated_change(&CorrelationQuery {
                repo_full_name: repo_full_name.to_string(),
                operation_type: operation_pattern.to_string(),
                statuses: vec![ChangeStatus::Approved, ChangeStatus::Executed],
                since,
            })
            .await?;
        let change = match executed {
            Some(change) => change,
            None => return Ok(None),
        };

        // The CLI record lacks the payload-side revert data; graft it on.
        let mut summary = change.summary_json.clone();
        if let Some(revert_action) = create_revert_action(event_type, payload) {
            summary["revert_action"] = revert_action.to_value();
        }
        summary["payload"] = json!({
            "before": payload.get("before"),
            "after": payload.get("after"),
        });
        if let Some(installation_id) = payload.pointer("/installation/id").and_then(Value::as_i64) {
            summary["installation_id"] = json!(installation_id);
        }
        self.store
            .update_summary_json(&change.change_id, &summary)
            .await?;
        self.store
            .set_change_status(&change.change_id, ChangeStatus::Executed)
            .await?;

        let mut notified = change.clone();
        notified.status = ChangeStatus::Executed;
        notified.summary_json = summary;
        self.notifier.publish(Notification {
            event: ChangeEvent::ExecutedWithRevert,
            change: notified,
            extras: json!({
                "revert_url": format!("{}/webhooks/github/revert/{}", self.api_base_url, change.change_id),
                "revert_window_hours": change.revert_window,
            }),
            api_key: change.api_key.clone(),
        });

        info!(change_id = %change.change_id, "webhook enriched executed change with revert data");
        Ok(Some(Disposition::CorrelatedExecuted {
            change_id: change.change_id,
        }))
    }

    async fn record_branch_creation(
        &self,
        repo_full_name: &str,
        payload: &Value,
    ) -> CoreResult<()> {
        let branch = payload
            .get("ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_start_matches("refs/heads/")
            .to_string();
        let head_sha = payload.get("after").and_then(Value::as_str).unwrap_or("");
        if branch.is_empty() || head_sha.is_empty() || head_sha == ZERO_SHA {
            return Ok(());
        }

        let now = Utc::now();
        let change = Change {
            change_id: new_change_id(),
            provider: ProviderKind::GitHub,
            target_id: repo_full_name.to_string(),
            title: Some(format!("Branch created: {branch}")),
            status: ChangeStatus::Executed,
            risk_score: 0.0,
            requires_approval: false,
            reasons: Vec::new(),
            policy_json: json!({}),
            summary_json: json!({
                "operation_type": "github_branch_create",
                "branch_name": branch,
                "source": "github_webhook",
            }),
            metadata: json!({}),
            token: None,
            revert_token: None,
            created_at: now,
            expires_at: now + Duration::hours(24),
            last_edited_time: None,
            revert_window: None,
            revert_expires_at: None,
            api_key: None,
            webhook_url: None,
            human_preview: None,
            branch_head_sha: Some(head_sha.to_string()),
            chat_message_id: None,
        };
        self.store.upsert_change(&change).await?;
        debug!(repo = repo_full_name, branch = %branch, "recorded branch head for future restore");
        Ok(())
    }

    async fn record_uncorrelated(
        &self,
        event_type: &str,
        payload: &Value,
        repo_full_name: &str,
        action: &str,
        assessment: risk::RiskAssessment,
    ) -> CoreResult<Disposition> {
        let change_id = new_change_id();
        let now = Utc::now();
        let installation_id = payload.pointer("/installation/id").and_then(Value::as_i64);

        // Resolve the owning tenant through the installation.
        let api_key = match installation_id {
            Some(id) => self
                .store
                .get_installation(id)
                .await?
                .and_then(|i| i.api_key),
            None => None,
        };
        if api_key.is_none() {
            warn!(repo = repo_full_name, "no tenant resolved for webhook event");
        }

        let mut revert_action = create_revert_action(event_type, payload);
        if let Some(RevertAction::BranchRestore { branch, sha, .. }) = &mut revert_action {
            *sha = self
                .resolve_deleted_branch_sha(repo_full_name, branch, installation_id)
                .await;
            if sha.is_none() {
                warn!(repo = repo_full_name, branch = %branch, "no SHA recovered for deleted branch");
            }
        }

        let branch_head_sha = if event_type == "push" {
            payload
                .get("after")
                .and_then(Value::as_str)
                .filter(|s| *s != ZERO_SHA)
                .map(String::from)
        } else {
            None
        };
        let branch_name = payload
            .get("ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_start_matches("refs/heads/")
            .to_string();

        let normalized = risk::normalize(assessment.score);
        let title = format!(
            "{} - {repo_full_name}",
            action.trim_start_matches("github_").replace('_', " "),
        );

        let mut summary_json = json!({
            "operation_type": action,
            "repo_name": repo_full_name,
            "branch_name": branch_name,
            "source": "github_webhook",
            "event_type": event_type,
            "sender": payload.pointer("/sender/login").and_then(Value::as_str),
            "installation_id": installation_id,
            "payload": {
                "before": payload.get("before"),
                "after": payload.get("after"),
            },
        });
        if let Some(action) = &revert_action {
            summary_json["revert_action"] = action.to_value();
        }

        let object_type = revert_action.as_ref().map(|a| match a {
            RevertAction::ForcePushRevert { .. } => "force_push",
            RevertAction::BranchRestore { .. } => "branch",
            RevertAction::RepositoryUnarchive { .. } | RevertAction::RepositoryArchive { .. } => {
                "repository"
            }
            RevertAction::MergeRevert { .. } => "merge",
            _ => "other",
        });

        let change = Change {
            change_id: change_id.clone(),
            provider: ProviderKind::GitHub,
            target_id: repo_full_name.to_string(),
            title: Some(title),
            // Already executed upstream; we only offer the revert.
            status: ChangeStatus::Executed,
            risk_score: normalized,
            requires_approval: false,
            reasons: assessment.reasons.clone(),
            policy_json: json!({ "risk_reasons": assessment.reasons }),
            summary_json,
            metadata: object_type
                .map(|o| json!({ "object": o }))
                .unwrap_or_else(|| json!({})),
            token: None,
            revert_token: None,
            created_at: now,
            expires_at: now + Duration::hours(2),
            last_edited_time: Some(now),
            revert_window: Some(self.revert_window_hours),
            revert_expires_at: Some(now + Duration::hours(self.revert_window_hours)),
            api_key: api_key.clone(),
            webhook_url: None,
            human_preview: None,
            branch_head_sha,
            chat_message_id: None,
        };
        self.store.upsert_change(&change).await?;

        // One-time revert capability, only when a revert is possible.
        let mut revert_token = None;
        if revert_action.is_some() {
            let plain = format!("rvk_{}", Uuid::new_v4().simple());
            self.store.set_revert_token(&change_id, &plain).await?;
            self.store
                .insert_approval_token(
                    &plain,
                    &change_id,
                    ApprovalTokenKind::Revert,
                    Duration::hours(self.revert_window_hours),
                )
                .await?;
            revert_token = Some(plain);
        }

        self.store
            .insert_audit(
                &change_id,
                "github_webhook_received",
                &json!({
                    "event_type": event_type,
                    "risk_score": assessment.score,
                    "sender": payload.pointer("/sender/login").and_then(Value::as_str),
                    "installation_id": installation_id,
                }),
            )
            .await?;

        let high_risk = assessment.score >= 7.0;
        if api_key.is_some() {
            let event = if high_risk {
                ChangeEvent::ExecutedHighRisk
            } else {
                ChangeEvent::ExecutedWithRevert
            };
            let mut notified = change.clone();
            notified.revert_token = revert_token;
            self.notifier.publish(Notification {
                event,
                change: notified,
                extras: json!({
                    "revert_url": format!("{}/webhooks/github/revert/{change_id}", self.api_base_url),
                    "revert_window_hours": self.revert_window_hours,
                }),
                api_key,
            });
        }

        if high_risk {
            warn!(
                change_id,
                repo = repo_full_name,
                action,
                score = assessment.score,
                "high-risk out-of-band operation recorded"
            );
        }
        self.metrics.record_change_status("executed");

        Ok(Disposition::Recorded {
            change_id,
            risk_score: assessment.score,
            high_risk,
        })
    }

    /// Resolves the head SHA of a deleted branch: stored push records
    /// first, then the upstream event feed under a minted App token.
    async fn resolve_deleted_branch_sha(
        &self,
        repo_full_name: &str,
        branch: &str,
        installation_id: Option<i64>,
    ) -> Option<String> {
        match self.store.find_branch_head_sha(repo_full_name, branch).await {
            Ok(Some(sha)) => return Some(sha),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "push-record SHA lookup failed"),
        }

        let (minter, installation_id) = match (&self.minter, installation_id) {
            (Some(minter), Some(id)) => (minter, id),
            _ => return None,
        };
        let token = match minter.installation_token(installation_id).await {
            Ok(token) => token.token,
            Err(e) => {
                warn!(error = %e, "installation token minting failed");
                return None;
            }
        };

        let target = match TargetKind::parse(repo_full_name) {
            Ok(target) => target,
            Err(_) => return None,
        };
        match self
            .provider
            .find_deleted_branch_sha(&target, &token, branch)
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                warn!(error = %e, "event-feed SHA recovery failed");
                None
            }
        }
    }

    /// Installation lifecycle: created, deleted, repositories added/removed.
    async fn handle_installation(&self, payload: &Value) -> CoreResult<Disposition> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let installation_id = payload
            .pointer("/installation/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::bad_request("installation event missing id"))?;
        let account_login = payload
            .pointer("/installation/account/login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match action.as_str() {
            "created" => {
                let repositories = payload
                    .get("repositories")
                    .and_then(Value::as_array)
                    .map(|repos| {
                        repos
                            .iter()
                            .filter_map(|r| r.get("full_name").and_then(Value::as_str))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                self.store
                    .upsert_installation(&InstallationRecord {
                        installation_id,
                        account_login: account_login.clone(),
                        repositories,
                        api_key: None,
                        installed_at: Utc::now(),
                    })
                    .await?;
                info!(installation_id, account = %account_login, "App installation recorded");
            }
            "deleted" => {
                self.store.delete_installation(installation_id).await?;
                info!(installation_id, "App installation removed");
            }
            "added" | "removed" => {
                if let Some(mut record) = self.store.get_installation(installation_id).await? {
                    let changed: Vec<String> = payload
                        .get(if action == "added" {
                            "repositories_added"
                        } else {
                            "repositories_removed"
                        })
                        .and_then(Value::as_array)
                        .map(|repos| {
                            repos
                                .iter()
                                .filter_map(|r| r.get("full_name").and_then(Value::as_str))
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    if action == "added" {
                        for repo in changed {
                            if !record.repositories.contains(&repo) {
                                record.repositories.push(repo);
                            }
                        }
                    } else {
                        record.repositories.retain(|r| !changed.contains(r));
                    }
                    self.store.upsert_installation(&record).await?;
                }
            }
            _ => {}
        }

        Ok(Disposition::Installation {
            action,
            installation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{sample_change, CaptureChannel, MemoryStore, MockProvider};
    use pretty_assertions::assert_eq;

    struct Harness {
        ingress: WebhookIngress,
        store: Arc<MemoryStore>,
        capture: Arc<CaptureChannel>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let capture = Arc::new(CaptureChannel::new("capture"));
        let metrics = Arc::new(MetricsRegistry::new());
        let (notifier, _handle) =
            Notifier::spawn(store.clone(), vec![capture.clone()], metrics.clone(), 64);

        let ingress = WebhookIngress::new(
            store.clone(),
            notifier,
            metrics,
            provider,
            None,
            vec!["saferun-ai[bot]".to_string()],
            "https://api.example".to_string(),
            24,
        );
        Harness {
            ingress,
            store,
            capture,
        }
    }

    fn force_push_payload() -> Value {
        json!({
            "forced": true,
            "ref": "refs/heads/main",
            "before": "oldsha111",
            "after": "newsha222",
            "commits": [{}],
            "repository": {
                "full_name": "octo/widgets",
                "name": "widgets",
                "owner": { "login": "octo" },
            },
            "sender": { "login": "dev-user" },
            "installation": { "id": 42 },
        })
    }

    #[test]
    fn test_signature_verifier_round_trip() {
        let secret = SecretString::new("webhook-secret".to_string());
        let verifier = SignatureVerifier::new(secret);
        let body = br#"{"zen":"Keep it logically awesome."}"#;

        let mut mac = HmacSha256::new_from_slice(b"webhook-secret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verifier.verify(body, Some(&header)).is_ok());
        assert!(verifier.verify(body, Some("sha256=deadbeef")).is_err());
        assert!(verifier.verify(body, None).is_err());
        assert!(verifier.verify(body, Some("md5=abc")).is_err());
    }

    #[test]
    fn test_chat_verifier_rejects_stale_timestamp() {
        let verifier = ChatRequestVerifier::new(SecretString::new("signing".to_string()));
        let stale = (Utc::now().timestamp() - 600).to_string();
        assert!(verifier.verify(&stale, "v0=anything", b"body").is_err());
    }

    #[test]
    fn test_chat_verifier_accepts_fresh_signature() {
        let verifier = ChatRequestVerifier::new(SecretString::new("signing".to_string()));
        let ts = Utc::now().timestamp().to_string();
        let body = b"payload=%7B%7D";

        let mut base = format!("v0:{ts}:").into_bytes();
        base.extend_from_slice(body);
        let mut mac = HmacSha256::new_from_slice(b"signing").unwrap();
        mac.update(&base);
        let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verifier.verify(&ts, &signature, body).is_ok());
    }

    #[tokio::test]
    async fn test_bot_events_are_dropped() {
        let h = harness();
        let mut payload = force_push_payload();
        payload["sender"]["login"] = json!("saferun-ai[bot]");

        let disposition = h.ingress.handle_event("push", &payload).await.unwrap();
        assert_eq!(disposition, Disposition::Ignored { reason: "bot_loop" });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(h.capture.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_empty_push_records_branch_head() {
        let h = harness();
        let payload = json!({
            "ref": "refs/heads/feature-y",
            "after": "cafecafe",
            "before": ZERO_SHA,
            "commits": [],
            "deleted": false,
            "repository": {
                "full_name": "octo/widgets",
                "name": "widgets",
                "owner": { "login": "octo" },
            },
            "sender": { "login": "dev-user" },
        });

        let disposition = h.ingress.handle_event("push", &payload).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::Ignored {
                reason: "branch_creation"
            }
        );

        let sha = h
            .store
            .find_branch_head_sha("octo/widgets", "feature-y")
            .await
            .unwrap();
        assert_eq!(sha.as_deref(), Some("cafecafe"));
        // No user-visible notification for the lightweight record.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(h.capture.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_correlation_skips_pending() {
        let h = harness();
        let mut pending = sample_change("c-pending");
        pending.target_id = "octo/widgets#main".to_string();
        pending.summary_json = json!({ "operation_type": "force_push" });
        h.store.upsert_change(&pending).await.unwrap();

        let disposition = h
            .ingress
            .handle_event("push", &force_push_payload())
            .await
            .unwrap();
        assert_eq!(
            disposition,
            Disposition::CorrelatedPending {
                change_id: "c-pending".to_string()
            }
        );
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(h.capture.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_correlation_enriches_executed() {
        let h = harness();
        let mut executed = sample_change("c-exec");
        executed.target_id = "octo/widgets#main".to_string();
        executed.status = ChangeStatus::Executed;
        executed.summary_json = json!({ "operation_type": "force_push" });
        executed.api_key = Some("sr_alice".to_string());
        h.store.upsert_change(&executed).await.unwrap();

        let disposition = h
            .ingress
            .handle_event("push", &force_push_payload())
            .await
            .unwrap();
        assert_eq!(
            disposition,
            Disposition::CorrelatedExecuted {
                change_id: "c-exec".to_string()
            }
        );

        let stored = h.store.get_change("c-exec").await.unwrap().unwrap();
        assert_eq!(
            stored.summary_json["revert_action"]["type"],
            "force_push_revert"
        );
        assert_eq!(
            stored.summary_json["revert_action"]["before_sha"],
            "oldsha111"
        );
        assert_eq!(stored.summary_json["installation_id"], 42);

        for _ in 0..50 {
            if !h.capture.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let delivered = h.capture.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, ChangeEvent::ExecutedWithRevert);
    }

    #[tokio::test]
    async fn test_uncorrelated_force_push_recorded_high_risk() {
        let h = harness();
        // Link the installation so the tenant resolves.
        h.store
            .upsert_installation(&InstallationRecord {
                installation_id: 42,
                account_login: "octo".to_string(),
                repositories: vec!["octo/widgets".to_string()],
                api_key: Some("sr_alice".to_string()),
                installed_at: Utc::now(),
            })
            .await
            .unwrap();

        let disposition = h
            .ingress
            .handle_event("push", &force_push_payload())
            .await
            .unwrap();
        let (change_id, high_risk) = match disposition {
            Disposition::Recorded {
                change_id,
                high_risk,
                risk_score,
            } => {
                assert_eq!(risk_score, 9.0);
                (change_id, high_risk)
            }
            other => panic!("expected Recorded, got {other:?}"),
        };
        assert!(high_risk);

        let stored = h.store.get_change(&change_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Executed);
        assert_eq!(stored.api_key.as_deref(), Some("sr_alice"));
        assert!(stored.revert_token.unwrap().starts_with("rvk_"));

        for _ in 0..50 {
            if !h.capture.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(h.capture.delivered()[0].event, ChangeEvent::ExecutedHighRisk);
    }

    #[tokio::test]
    async fn test_branch_delete_sha_resolved_from_push_records() {
        let h = harness();
        // A prior branch-creation event captured the head.
        let creation = json!({
            "ref": "refs/heads/feature-y",
            "after": "cafecafe",
            "commits": [],
            "deleted": false,
            "repository": {
                "full_name": "octo/widgets",
                "name": "widgets",
                "owner": { "login": "octo" },
            },
            "sender": { "login": "dev-user" },
        });
        h.ingress.handle_event("push", &creation).await.unwrap();

        let delete = json!({
            "ref": "feature-y",
            "ref_type": "branch",
            "repository": {
                "full_name": "octo/widgets",
                "name": "widgets",
                "owner": { "login": "octo" },
            },
            "sender": { "login": "dev-user" },
        });
        let disposition = h.ingress.handle_event("delete", &delete).await.unwrap();
        let change_id = match disposition {
            Disposition::Recorded { change_id, .. } => change_id,
            other => panic!("expected Recorded, got {other:?}"),
        };

        let stored = h.store.get_change(&change_id).await.unwrap().unwrap();
        assert_eq!(stored.summary_json["revert_action"]["type"], "branch_restore");
        assert_eq!(stored.summary_json["revert_action"]["sha"], "cafecafe");
    }

    #[tokio::test]
    async fn test_installation_lifecycle() {
        let h = harness();
        let created = json!({
            "action": "created",
            "installation": { "id": 7, "account": { "login": "octo" } },
            "repositories": [
                { "full_name": "octo/widgets" },
                { "full_name": "octo/gadgets" },
            ],
        });
        h.ingress.handle_event("installation", &created).await.unwrap();
        let record = h.store.get_installation(7).await.unwrap().unwrap();
        assert_eq!(record.repositories.len(), 2);

        let removed = json!({
            "action": "removed",
            "installation": { "id": 7 },
            "repositories_removed": [{ "full_name": "octo/gadgets" }],
        });
        h.ingress
            .handle_event("installation_repositories", &removed)
            .await
            .unwrap();
        let record = h.store.get_installation(7).await.unwrap().unwrap();
        assert_eq!(record.repositories, vec!["octo/widgets".to_string()]);

        let deleted = json!({
            "action": "deleted",
            "installation": { "id": 7, "account": { "login": "octo" } },
        });
        h.ingress.handle_event("installation", &deleted).await.unwrap();
        assert!(h.store.get_installation(7).await.unwrap().is_none());
    }
}
