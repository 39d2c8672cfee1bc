//! Approval gateway: approve, reject, and revert entry points.
//!
//! Two authentication modes. In token mode the one-time approval token is
//! itself the capability, verified and consumed atomically, with no tenant
//! check. In API-key mode the caller must own the change; a mismatch reads
//! as a missing change.

use crate::engine::{ApplyResult, ChangeEngine, RevertResult};
use crate::errors::{CoreError, CoreResult};
use crate::store::Store;
use crate::tenants::check_ownership;
use crate::types::{ApprovalTokenKind, Change, ChangeStatus};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Caller authentication for gateway endpoints.
#[derive(Debug, Clone, Copy)]
pub enum ApprovalAuth<'a> {
    /// One-time approval token (chat buttons, email links, landing page).
    Token(&'a str),
    /// Tenant API key.
    ApiKey(&'a str),
}

/// Details shown on the approval page.
#[derive(Debug, Clone)]
pub struct ApprovalDetails {
    /// Change id.
    pub change_id: String,
    /// Current status (after any lazy expiry).
    pub status: ChangeStatus,
    /// Whether an approver still has to act.
    pub requires_approval: bool,
    /// Approval deadline.
    pub expires_at: DateTime<Utc>,
    /// Preview text.
    pub human_preview: Option<String>,
    /// Operation type from the summary.
    pub operation_type: Option<String>,
    /// Operation target.
    pub target: String,
    /// Normalized risk score.
    pub risk_score: f64,
    /// Combined reasons.
    pub reasons: Vec<String>,
    /// Revert window in hours.
    pub revert_window: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Outcome of an approve or reject call.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// Change id.
    pub change_id: String,
    /// Resulting status.
    pub status: ChangeStatus,
    /// Whether the change is approved.
    pub approved: bool,
    /// Execution result, when approval triggered synchronous execution.
    pub execution: Option<ApplyResult>,
}

/// The approval gateway.
pub struct ApprovalGateway {
    engine: Arc<ChangeEngine>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGateway").finish_non_exhaustive()
    }
}

impl ApprovalGateway {
    /// Creates the gateway over the engine and its store.
    pub fn new(engine: Arc<ChangeEngine>) -> Self {
        let store = engine.store();
        Self { engine, store }
    }

    // Same message as the ownership check, so a cross-tenant probe is
    // indistinguishable from a missing id.
    async fn load_change(&self, change_id: &str) -> CoreResult<Change> {
        self.store
            .get_change(change_id)
            .await?
            .ok_or_else(|| CoreError::not_found("change not found"))
    }

    /// Non-consuming token inspection for reads: the token must exist,
    /// match the change, and be unspent and unexpired.
    async fn check_token_readonly(&self, change_id: &str, token: &str) -> CoreResult<()> {
        let record = self
            .store
            .get_approval_token(token)
            .await?
            .ok_or_else(|| CoreError::unauthorized("invalid approval token"))?;
        if record.used {
            return Err(CoreError::unauthorized("approval token already used"));
        }
        if record.change_id != change_id {
            return Err(CoreError::forbidden("token does not match change"));
        }
        if record.expires_at < Utc::now() {
            return Err(CoreError::unauthorized("approval token expired"));
        }
        Ok(())
    }

    /// Consuming token check for mutations. A lost consume race reports
    /// `Conflict`, so of two concurrent approvals exactly one succeeds.
    async fn consume_token(
        &self,
        change_id: &str,
        token: &str,
        expected_kind: ApprovalTokenKind,
    ) -> CoreResult<()> {
        let record = self
            .store
            .get_approval_token(token)
            .await?
            .ok_or_else(|| CoreError::unauthorized("invalid approval token"))?;
        if record.change_id != change_id {
            return Err(CoreError::forbidden("token does not match change"));
        }
        if record.kind != expected_kind {
            return Err(CoreError::forbidden("token does not authorize this action"));
        }
        if record.expires_at < Utc::now() {
            return Err(CoreError::unauthorized("approval token expired"));
        }
        if !self.store.verify_and_consume_token(change_id, token).await? {
            return Err(CoreError::conflict("approval token already used"));
        }
        Ok(())
    }

    fn authorize_readonly_change(&self, change: &Change, auth: &ApprovalAuth<'_>) -> CoreResult<()> {
        match auth {
            ApprovalAuth::Token(_) => Ok(()),
            ApprovalAuth::ApiKey(api_key) => check_ownership(change, api_key),
        }
    }

    /// Lazily expires a pending change whose approval deadline has passed.
    async fn expire_if_stale(&self, change: &mut Change) -> CoreResult<bool> {
        if change.status == ChangeStatus::Pending && Utc::now() > change.expires_at {
            self.store
                .set_change_status(&change.change_id, ChangeStatus::Expired)
                .await?;
            self.store
                .insert_audit(&change.change_id, "expired", &json!({}))
                .await?;
            change.status = ChangeStatus::Expired;
            return Ok(true);
        }
        Ok(false)
    }

    /// Detail view for the approver UI.
    pub async fn get_details(
        &self,
        change_id: &str,
        auth: ApprovalAuth<'_>,
    ) -> CoreResult<ApprovalDetails> {
        let mut change = self.load_change(change_id).await?;
        if let ApprovalAuth::Token(token) = auth {
            self.check_token_readonly(change_id, token).await?;
        }
        self.authorize_readonly_change(&change, &auth)?;
        self.expire_if_stale(&mut change).await?;

        Ok(ApprovalDetails {
            change_id: change.change_id.clone(),
            status: change.status,
            requires_approval: change.requires_approval,
            expires_at: change.expires_at,
            human_preview: change.human_preview.clone(),
            operation_type: change
                .summary_json
                .get("operation_type")
                .and_then(Value::as_str)
                .map(String::from),
            target: change.target_id.clone(),
            risk_score: change.risk_score,
            reasons: change.reasons.clone(),
            revert_window: change.revert_window,
            created_at: change.created_at,
        })
    }

    /// Approves a pending change. With a revert window the execution runs
    /// synchronously and the `executed_with_revert` notification carries
    /// the fresh revert capability; without one the change stays `approved`
    /// for the poll path to pick up.
    pub async fn approve(
        &self,
        change_id: &str,
        auth: ApprovalAuth<'_>,
    ) -> CoreResult<ApprovalOutcome> {
        let mut change = self.load_change(change_id).await?;

        match auth {
            ApprovalAuth::Token(token) => {
                self.consume_token(change_id, token, ApprovalTokenKind::Approve)
                    .await?;
            }
            ApprovalAuth::ApiKey(api_key) => check_ownership(&change, api_key)?,
        }

        if self.expire_if_stale(&mut change).await? {
            return Err(CoreError::gone(
                "approval window elapsed; no action taken",
            ));
        }
        match change.status {
            ChangeStatus::Pending => {}
            ChangeStatus::Expired => return Err(CoreError::gone("change expired")),
            other => {
                return Err(CoreError::conflict(format!(
                    "cannot approve: change is {other}"
                )))
            }
        }

        self.store.set_change_approved(&change.change_id).await?;
        self.store
            .set_change_status(&change.change_id, ChangeStatus::Approved)
            .await?;
        self.store
            .insert_audit(&change.change_id, "approved", &json!({ "via": "gateway" }))
            .await?;
        info!(change_id, "change approved");

        // Revert-windowed changes execute immediately; the rest wait for the
        // CLI/SDK poll to apply.
        if change.revert_window.is_some() {
            let execution = self.engine.execute_approved(&change.change_id).await?;
            return Ok(ApprovalOutcome {
                change_id: change.change_id.clone(),
                status: execution.status,
                approved: true,
                execution: Some(execution),
            });
        }

        Ok(ApprovalOutcome {
            change_id: change.change_id.clone(),
            status: ChangeStatus::Approved,
            approved: true,
            execution: None,
        })
    }

    /// Rejects a pending change. Idempotent with respect to expiry: a
    /// change past its deadline reports `expired` without error.
    pub async fn reject(
        &self,
        change_id: &str,
        auth: ApprovalAuth<'_>,
    ) -> CoreResult<ApprovalOutcome> {
        let mut change = self.load_change(change_id).await?;

        match auth {
            ApprovalAuth::Token(token) => {
                self.consume_token(change_id, token, ApprovalTokenKind::Approve)
                    .await?;
            }
            ApprovalAuth::ApiKey(api_key) => check_ownership(&change, api_key)?,
        }

        if self.expire_if_stale(&mut change).await? || change.status == ChangeStatus::Expired {
            return Ok(ApprovalOutcome {
                change_id: change.change_id.clone(),
                status: ChangeStatus::Expired,
                approved: false,
                execution: None,
            });
        }
        if change.status != ChangeStatus::Pending {
            return Err(CoreError::conflict(format!(
                "cannot reject: change is {}",
                change.status
            )));
        }

        self.store
            .set_change_status(&change.change_id, ChangeStatus::Rejected)
            .await?;
        self.store
            .insert_audit(&change.change_id, "rejected", &json!({ "via": "gateway" }))
            .await?;
        info!(change_id, "change rejected");

        Ok(ApprovalOutcome {
            change_id: change.change_id.clone(),
            status: ChangeStatus::Rejected,
            approved: false,
            execution: None,
        })
    }

    /// Out-of-band revert with a one-time revert token. The token is the
    /// capability; the provider credential comes from the change record or
    /// a minted App installation token.
    pub async fn revert_with_token(
        &self,
        change_id: &str,
        token: &str,
        credential_override: Option<&str>,
    ) -> CoreResult<RevertResult> {
        self.consume_token(change_id, token, ApprovalTokenKind::Revert)
            .await?;
        let change = self.load_change(change_id).await?;
        self.engine.revert_loaded(change, credential_override).await
    }

    /// Out-of-band revert authenticated by API key. The caller must own the
    /// change and supply the provider credential.
    pub async fn revert_with_api_key(
        &self,
        change_id: &str,
        api_key: &str,
        credential: &str,
    ) -> CoreResult<RevertResult> {
        let change = self.load_change(change_id).await?;
        check_ownership(&change, api_key)?;
        self.engine.revert_loaded(change, Some(credential)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DryRunRequest, EngineOptions, Operation};
    use crate::mocks::{CaptureChannel, MemoryStore, MockProvider};
    use crate::notify::{ChangeEvent, Notifier};
    use crate::observability::MetricsRegistry;
    use crate::providers::Provider;
    use crate::types::ProviderKind;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct Harness {
        gateway: ApprovalGateway,
        engine: Arc<ChangeEngine>,
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
        capture: Arc<CaptureChannel>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let capture = Arc::new(CaptureChannel::new("capture"));
        let metrics = Arc::new(MetricsRegistry::new());
        let (notifier, _handle) =
            Notifier::spawn(store.clone(), vec![capture.clone()], metrics.clone(), 64);
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        providers.insert(ProviderKind::GitHub, provider.clone());

        let engine = Arc::new(ChangeEngine::new(
            store.clone(),
            providers,
            notifier,
            metrics,
            None,
            EngineOptions {
                app_base_url: "https://app.example".to_string(),
                api_base_url: "https://api.example".to_string(),
                approval_ttl: Duration::hours(2),
                revert_window_hours: 24,
                admin_api_keys: vec![],
                default_policy_json: None,
            },
        ));
        Harness {
            gateway: ApprovalGateway::new(engine.clone()),
            engine,
            store,
            provider,
            capture,
        }
    }

    async fn create_pending(h: &Harness) -> (String, String) {
        let result = h
            .engine
            .dry_run(DryRunRequest {
                provider: ProviderKind::GitHub,
                operation: Operation::DeleteBranch,
                target_id: "octo/widgets#feature-x".to_string(),
                credential: "ghp_caller_token".to_string(),
                caller_api_key: "sr_alice".to_string(),
                reason: None,
                policy: None,
                webhook_url: None,
                commit_sha: None,
                commit_message: None,
            })
            .await
            .unwrap();
        let token = result
            .approve_url
            .unwrap()
            .split("token=")
            .nth(1)
            .unwrap()
            .to_string();
        (result.change_id, token)
    }

    #[tokio::test]
    async fn test_approve_with_token_executes() {
        let h = harness();
        let (change_id, token) = create_pending(&h).await;

        let outcome = h
            .gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.status, ChangeStatus::Executed);
        let execution = outcome.execution.unwrap();
        assert!(execution.revert_token.unwrap().starts_with("rvk_"));
        assert_eq!(h.provider.calls(), vec!["delete_branch:octo/widgets#feature-x"]);

        let stored = h.store.get_change(&change_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Executed);
        assert!(!stored.requires_approval);
    }

    #[tokio::test]
    async fn test_token_double_spend_conflicts() {
        let h = harness();
        let (change_id, token) = create_pending(&h).await;

        h.gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap();
        let err = h
            .gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        // The operation executed exactly once.
        assert_eq!(h.provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_is_idempotent_on_expired() {
        let h = harness();
        let (change_id, _token) = create_pending(&h).await;

        let mut change = h.store.get_change(&change_id).await.unwrap().unwrap();
        change.expires_at = Utc::now() - Duration::seconds(1);
        h.store.upsert_change(&change).await.unwrap();

        let outcome = h
            .gateway
            .reject(&change_id, ApprovalAuth::ApiKey("sr_alice"))
            .await
            .unwrap();
        assert_eq!(outcome.status, ChangeStatus::Expired);
        assert!(!outcome.approved);
    }

    #[tokio::test]
    async fn test_approve_on_rejected_conflicts() {
        let h = harness();
        let (change_id, _token) = create_pending(&h).await;

        h.gateway
            .reject(&change_id, ApprovalAuth::ApiKey("sr_alice"))
            .await
            .unwrap();
        let err = h
            .gateway
            .approve(&change_id, ApprovalAuth::ApiKey("sr_alice"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_cross_tenant_details_not_found() {
        let h = harness();
        let (change_id, _token) = create_pending(&h).await;

        let err = h
            .gateway
            .get_details(&change_id, ApprovalAuth::ApiKey("sr_bob"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        // Same shape as a truly missing id.
        let missing = h
            .gateway
            .get_details("does-not-exist", ApprovalAuth::ApiKey("sr_bob"))
            .await
            .unwrap_err();
        assert_eq!(missing.status_code(), 404);
        assert_eq!(err.envelope().error_code, missing.envelope().error_code);
    }

    #[tokio::test]
    async fn test_get_details_does_not_consume_token() {
        let h = harness();
        let (change_id, token) = create_pending(&h).await;

        for _ in 0..3 {
            let details = h
                .gateway
                .get_details(&change_id, ApprovalAuth::Token(&token))
                .await
                .unwrap();
            assert_eq!(details.status, ChangeStatus::Pending);
        }
        // Token still spendable.
        let outcome = h
            .gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn test_revert_with_consumed_revert_token() {
        let h = harness();
        let (change_id, token) = create_pending(&h).await;
        h.gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap();

        // The approve token cannot authorize a revert.
        let err = h
            .gateway
            .revert_with_token(&change_id, &token, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        // The stored revert-kind token can, exactly once.
        let revert_token = h
            .store
            .raw_token_of_kind(&change_id, ApprovalTokenKind::Revert)
            .expect("revert token issued at execution");
        let result = h
            .gateway
            .revert_with_token(&change_id, &revert_token, None)
            .await
            .unwrap();
        assert_eq!(result.status, ChangeStatus::Reverted);

        let err = h
            .gateway
            .revert_with_token(&change_id, &revert_token, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_approval_notifications_flow() {
        let h = harness();
        let (change_id, token) = create_pending(&h).await;
        h.gateway
            .approve(&change_id, ApprovalAuth::Token(&token))
            .await
            .unwrap();

        for _ in 0..100 {
            if h.capture.delivered().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let events: Vec<ChangeEvent> =
            h.capture.delivered().iter().map(|n| n.event).collect();
        assert!(events.contains(&ChangeEvent::DryRun));
        assert!(events.contains(&ChangeEvent::ExecutedWithRevert));
    }
}
