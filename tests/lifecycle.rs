//! End-to-end lifecycle scenarios against the in-memory store and a
//! scripted provider: dry-run → approve → execute → revert, the expiry
//! sweep, webhook correlation, and the tenant boundary.

use saferun_core::approvals::{ApprovalAuth, ApprovalGateway};
use saferun_core::engine::{ChangeEngine, DryRunRequest, EngineOptions, Operation};
use saferun_core::expiry::ExpiryScheduler;
use saferun_core::mocks::{sample_change, CaptureChannel, MemoryStore, MockProvider};
use saferun_core::notify::{ChangeEvent, Notifier};
use saferun_core::observability::MetricsRegistry;
use saferun_core::providers::Provider;
use saferun_core::store::Store;
use saferun_core::types::{ChangeStatus, ProviderKind};
use saferun_core::webhooks::{Disposition, WebhookIngress};

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

struct Harness {
    engine: Arc<ChangeEngine>,
    gateway: ApprovalGateway,
    ingress: WebhookIngress,
    scheduler: ExpiryScheduler,
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
        notifier.clone(),
        metrics.clone(),
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
    let gateway = ApprovalGateway::new(engine.clone());
    let ingress = WebhookIngress::new(
        store.clone(),
        notifier.clone(),
        metrics.clone(),
        provider.clone(),
        None,
        vec!["saferun-ai[bot]".to_string()],
        "https://api.example".to_string(),
        24,
    );
    let scheduler = ExpiryScheduler::new(
        store.clone(),
        notifier,
        metrics,
        std::time::Duration::from_secs(300),
    );

    Harness {
        engine,
        gateway,
        ingress,
        scheduler,
        store,
        provider,
        capture,
    }
}

fn dry_run_request(operation: Operation, target_id: &str) -> DryRunRequest {
    DryRunRequest {
        provider: ProviderKind::GitHub,
        operation,
        target_id: target_id.to_string(),
        credential: "ghp_agent_token".to_string(),
        caller_api_key: "sr_alice".to_string(),
        reason: None,
        policy: None,
        webhook_url: None,
        commit_sha: None,
        commit_message: None,
    }
}

fn approval_token(url: &str) -> String {
    url.split("token=").nth(1).unwrap().to_string()
}

async fn wait_for_events(capture: &CaptureChannel, count: usize) -> Vec<ChangeEvent> {
    for _ in 0..100 {
        if capture.delivered().len() >= count {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    capture.delivered().iter().map(|n| n.event).collect()
}

// Branch delete with a recent commit: dry-run, approve by one-time token,
// execute with the SHA captured, then revert by the issued token.
#[tokio::test]
async fn branch_delete_approve_and_revert() {
    let h = harness();
    let last_commit = (Utc::now() - Duration::minutes(45)).to_rfc3339();
    h.provider.set_metadata(json!({
        "object": "branch",
        "owner": "octo",
        "repo": "widgets",
        "branch": "feature-x",
        "name": "feature-x",
        "isDefault": false,
        "default_branch": "main",
        "lastCommitDate": last_commit,
    }));
    h.provider.set_branch_sha("feadbeef42");

    let result = h
        .engine
        .dry_run(dry_run_request(Operation::DeleteBranch, "octo/widgets#feature-x"))
        .await
        .unwrap();

    assert!(result.requires_approval);
    assert!(
        (0.4..=0.5).contains(&result.risk_score),
        "risk {}",
        result.risk_score
    );
    assert!(result.human_preview.contains("DELETE BRANCH"));
    assert!(result.is_reversible);

    let token = approval_token(result.approve_url.as_deref().unwrap());
    let outcome = h
        .gateway
        .approve(&result.change_id, ApprovalAuth::Token(&token))
        .await
        .unwrap();
    assert_eq!(outcome.status, ChangeStatus::Executed);

    let stored = h.store.get_change(&result.change_id).await.unwrap().unwrap();
    assert_eq!(stored.summary_json["github_restore_sha"], "feadbeef42");
    assert_eq!(
        h.provider.calls(),
        vec!["delete_branch:octo/widgets#feature-x"]
    );

    let revert_token = outcome.execution.unwrap().revert_token.unwrap();
    let reverted = h
        .engine
        .revert(&revert_token, "sr_alice", None)
        .await
        .unwrap();
    assert_eq!(reverted.status, ChangeStatus::Reverted);
    assert_eq!(
        h.provider.calls()[1],
        "restore_branch:octo/widgets#feature-x:feadbeef42"
    );

    let events = wait_for_events(&h.capture, 3).await;
    assert!(events.contains(&ChangeEvent::DryRun));
    assert!(events.contains(&ChangeEvent::ExecutedWithRevert));
    assert!(events.contains(&ChangeEvent::Reverted));
}

// Repository deletion is irreversible: high risk, no revert URL, no revert
// token, and any revert attempt reads as a missing change.
#[tokio::test]
async fn repository_delete_is_irreversible() {
    let h = harness();
    h.provider.set_metadata(json!({
        "object": "repository",
        "owner": "octo",
        "repo": "widgets",
        "name": "widgets",
        "default_branch": "main",
    }));

    let mut request = dry_run_request(Operation::DeleteRepository, "octo/widgets");
    request.reason = Some("Delete repository (PERMANENT)".to_string());
    let result = h.engine.dry_run(request).await.unwrap();

    assert!(result.risk_score >= 0.8);
    assert!(result
        .reasons
        .contains(&"github_irreversible_repo_deletion".to_string()));
    assert!(!result.is_reversible);
    assert!(result.revert_url.is_none());

    let token = approval_token(result.approve_url.as_deref().unwrap());
    let outcome = h
        .gateway
        .approve(&result.change_id, ApprovalAuth::Token(&token))
        .await
        .unwrap();
    assert_eq!(
        h.provider.calls(),
        vec!["delete_repository:octo/widgets"]
    );
    assert!(outcome.execution.unwrap().revert_token.is_none());

    let err = h
        .engine
        .revert("rvk_nonexistent", "sr_alice", None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

// A pending force-push change absorbs the matching webhook silently; an
// executed one is enriched with the payload's revert descriptor.
#[tokio::test]
async fn force_push_webhook_correlation() {
    let h = harness();
    let payload = json!({
        "forced": true,
        "ref": "refs/heads/main",
        "before": "before-sha",
        "after": "after-sha",
        "commits": [{}],
        "repository": {
            "full_name": "octo/widgets",
            "name": "widgets",
            "owner": { "login": "octo" },
        },
        "sender": { "login": "dev-user" },
        "installation": { "id": 42 },
    });

    let mut pending = sample_change("c-cli-pending");
    pending.target_id = "octo/widgets#main".to_string();
    pending.summary_json = json!({ "operation_type": "force_push" });
    h.store.upsert_change(&pending).await.unwrap();

    let disposition = h.ingress.handle_event("push", &payload).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::CorrelatedPending {
            change_id: "c-cli-pending".to_string()
        }
    );
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.capture.delivered().is_empty());

    // Same event against an executed change updates it instead.
    h.store
        .set_change_status("c-cli-pending", ChangeStatus::Approved)
        .await
        .unwrap();
    h.store
        .set_change_status("c-cli-pending", ChangeStatus::Executed)
        .await
        .unwrap();
    let disposition = h.ingress.handle_event("push", &payload).await.unwrap();
    assert_eq!(
        disposition,
        Disposition::CorrelatedExecuted {
            change_id: "c-cli-pending".to_string()
        }
    );

    let stored = h.store.get_change("c-cli-pending").await.unwrap().unwrap();
    let revert_action = &stored.summary_json["revert_action"];
    assert_eq!(revert_action["type"], "force_push_revert");
    assert_eq!(revert_action["before_sha"], "before-sha");
    assert_eq!(stored.summary_json["installation_id"], 42);

    let events = wait_for_events(&h.capture, 1).await;
    assert_eq!(events, vec![ChangeEvent::ExecutedWithRevert]);
}

// Approval-token double spend: of two concurrent approvals exactly one
// succeeds, and the operation executes exactly once.
#[tokio::test]
async fn approval_token_double_spend() {
    let h = harness();
    let result = h
        .engine
        .dry_run(dry_run_request(Operation::DeleteBranch, "octo/widgets#feature-x"))
        .await
        .unwrap();
    let token = approval_token(result.approve_url.as_deref().unwrap());

    let (first, second) = tokio::join!(
        h.gateway
            .approve(&result.change_id, ApprovalAuth::Token(&token)),
        h.gateway
            .approve(&result.change_id, ApprovalAuth::Token(&token)),
    );

    let outcomes = [first, second];
    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(successes, 1);
    let conflict = outcomes
        .iter()
        .find_map(|o| o.as_ref().err())
        .expect("one call loses");
    assert_eq!(conflict.status_code(), 409);

    assert_eq!(h.provider.calls().len(), 1);
    let stored = h.store.get_change(&result.change_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ChangeStatus::Executed);
}

// Expiry sweep: one transition and one notification for a stale pending
// change, nothing on the second tick.
#[tokio::test]
async fn expiry_sweep_is_exactly_once() {
    let h = harness();
    let mut change = sample_change("c-stale");
    change.revert_expires_at = Some(Utc::now() - Duration::seconds(1));
    h.store.upsert_change(&change).await.unwrap();

    let first = h.scheduler.tick().await.unwrap();
    assert_eq!(first, vec!["c-stale".to_string()]);
    let second = h.scheduler.tick().await.unwrap();
    assert!(second.is_empty());

    let events = wait_for_events(&h.capture, 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(events, vec![ChangeEvent::Expired]);
    assert_eq!(h.capture.delivered().len(), 1);

    let stored = h.store.get_change("c-stale").await.unwrap().unwrap();
    assert_eq!(stored.status, ChangeStatus::Expired);
}

// Tenant boundary: another tenant's change is indistinguishable from a
// missing one, for reads and mutations alike.
#[tokio::test]
async fn cross_tenant_access_is_not_found() {
    let h = harness();
    let result = h
        .engine
        .dry_run(dry_run_request(Operation::DeleteBranch, "octo/widgets#feature-x"))
        .await
        .unwrap();

    let err = h
        .gateway
        .get_details(&result.change_id, ApprovalAuth::ApiKey("sr_bob"))
        .await
        .unwrap_err();
    let missing = h
        .gateway
        .get_details("00000000-0000-0000-0000-000000000000", ApprovalAuth::ApiKey("sr_bob"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(missing.status_code(), 404);
    assert_eq!(err.envelope().error_code, missing.envelope().error_code);

    let apply_err = h
        .engine
        .apply(&result.change_id, "sr_bob", true, None)
        .await
        .unwrap_err();
    assert_eq!(apply_err.status_code(), 404);

    // The owner still sees it.
    let details = h
        .gateway
        .get_details(&result.change_id, ApprovalAuth::ApiKey("sr_alice"))
        .await
        .unwrap();
    assert_eq!(details.status, ChangeStatus::Pending);
}

// Credentials written through the public API are ciphertext at rest.
#[tokio::test]
async fn credentials_are_encrypted_at_rest() {
    let h = harness();
    let result = h
        .engine
        .dry_run(dry_run_request(Operation::DeleteBranch, "octo/widgets#feature-x"))
        .await
        .unwrap();

    let raw = h.store.raw_change(&result.change_id).unwrap();
    assert!(saferun_core::crypto::looks_encrypted(
        raw.token.as_deref().unwrap()
    ));

    let token = approval_token(result.approve_url.as_deref().unwrap());
    h.gateway
        .approve(&result.change_id, ApprovalAuth::Token(&token))
        .await
        .unwrap();

    let raw = h.store.raw_change(&result.change_id).unwrap();
    assert!(saferun_core::crypto::looks_encrypted(
        raw.revert_token.as_deref().unwrap()
    ));
}

// Bulk PR close and reopen through the full lifecycle.
#[tokio::test]
async fn bulk_close_and_reopen() {
    let h = harness();
    h.provider.set_metadata(json!({
        "type": "bulk_pr",
        "owner": "octo",
        "repo": "widgets",
        "view_name": "open_prs",
        "records_affected": 2,
    }));

    let result = h
        .engine
        .dry_run(dry_run_request(Operation::BulkClosePrs, "octo/widgets@open_prs"))
        .await
        .unwrap();
    assert!(result.is_reversible);

    let token = approval_token(result.approve_url.as_deref().unwrap());
    let outcome = h
        .gateway
        .approve(&result.change_id, ApprovalAuth::Token(&token))
        .await
        .unwrap();
    let revert_token = outcome.execution.unwrap().revert_token.unwrap();

    let stored = h.store.get_change(&result.change_id).await.unwrap().unwrap();
    assert_eq!(stored.summary_json["closed_pr_numbers"], json!([7, 9]));

    h.engine
        .revert(&revert_token, "sr_alice", None)
        .await
        .unwrap();
    assert!(h
        .provider
        .calls()
        .iter()
        .any(|c| c.starts_with("bulk_reopen:octo/widgets:[7, 9]")));
}

// A rejected pending change past its deadline reports expired, without
// error, matching the reject idempotence law.
#[tokio::test]
async fn reject_after_deadline_reports_expired() {
    let h = harness();
    let result = h
        .engine
        .dry_run(dry_run_request(Operation::DeleteBranch, "octo/widgets#feature-x"))
        .await
        .unwrap();

    let mut change = h.store.get_change(&result.change_id).await.unwrap().unwrap();
    change.expires_at = Utc::now() - Duration::seconds(5);
    h.store.upsert_change(&change).await.unwrap();

    let outcome = h
        .gateway
        .reject(&result.change_id, ApprovalAuth::ApiKey("sr_alice"))
        .await
        .unwrap();
    assert_eq!(outcome.status, ChangeStatus::Expired);
    assert!(!outcome.approved);
}
