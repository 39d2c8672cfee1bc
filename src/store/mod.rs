//! Persistence: the single `Store` interface and its backends.
//!
//! Every write goes through the narrow mutators here; the change engine
//! never touches rows directly, and nothing in the crate caches change
//! state across requests. Credential fields are encrypted through the vault
//! on write and decrypted on read, so at-rest values are always ciphertext.
//! JSON columns are encoded exactly once at this boundary.

use crate::errors::CoreResult;
use crate::types::{
    ApiKeyRecord, ApprovalToken, ApprovalTokenKind, AuditRecord, Change, ChangeStatus,
    InstallationRecord, OauthSetupSession, TenantSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

pub mod postgres;

pub use postgres::PostgresStore;

/// Filter for the webhook correlation lookback.
#[derive(Debug, Clone)]
pub struct CorrelationQuery {
    /// Repository full name (`owner/repo`); matches target ids with or
    /// without a ref suffix.
    pub repo_full_name: String,
    /// Operation type recorded in `summary_json` (`merge`, `force_push`).
    pub operation_type: String,
    /// Statuses to match.
    pub statuses: Vec<ChangeStatus>,
    /// Lower bound on `created_at`.
    pub since: DateTime<Utc>,
}

/// Persistence interface. One backend is selected at startup; callers only
/// ever see this trait.
#[async_trait]
pub trait Store: Send + Sync {
    // Changes

    /// Inserts or replaces a change. Credentials are encrypted before the
    /// row is written; JSON blobs are serialized exactly once.
    async fn upsert_change(&self, change: &Change) -> CoreResult<()>;

    /// Loads a change, decrypting credential fields. A credential that fails
    /// decryption comes back as `None` rather than an error.
    async fn get_change(&self, change_id: &str) -> CoreResult<Option<Change>>;

    /// Looks a change up by plaintext revert token. Fast path is an equality
    /// match against legacy plaintext rows; slow path scans rows with a
    /// non-null revert token and compares decrypted values in constant time.
    async fn get_change_by_revert_token(&self, token: &str) -> CoreResult<Option<Change>>;

    /// Single-row status update.
    async fn set_change_status(&self, change_id: &str, status: ChangeStatus) -> CoreResult<()>;

    /// Stores a fresh revert token (encrypted).
    async fn set_revert_token(&self, change_id: &str, token: &str) -> CoreResult<()>;

    /// Replaces the summary blob.
    async fn update_summary_json(&self, change_id: &str, summary: &Value) -> CoreResult<()>;

    /// Clears the approval requirement after an approval.
    async fn set_change_approved(&self, change_id: &str) -> CoreResult<()>;

    /// Records the outbound chat message id for in-place updates.
    async fn set_chat_message_id(&self, change_id: &str, message_id: &str) -> CoreResult<()>;

    /// Atomically expires pending changes whose revert deadline has passed.
    /// Returns the ids that transitioned; a change is returned by at most
    /// one concurrent sweep.
    async fn expire_pending(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>>;

    /// Finds the most recent change matching a correlation query.
    async fn find_correlated_change(&self, query: &CorrelationQuery)
        -> CoreResult<Option<Change>>;

    /// Most recent recorded head SHA for a branch of a repository, from
    /// lightweight push records.
    async fn find_branch_head_sha(
        &self,
        repo_full_name: &str,
        branch: &str,
    ) -> CoreResult<Option<String>>;

    /// Re-encrypts legacy plaintext credentials in place. Idempotent;
    /// returns the number of rows rewritten.
    async fn migrate_tokens_to_encrypted(&self) -> CoreResult<u64>;

    // Approval tokens

    /// Creates a one-time token bound to a change.
    async fn create_approval_token(
        &self,
        change_id: &str,
        kind: ApprovalTokenKind,
        ttl: Duration,
    ) -> CoreResult<String>;

    /// Registers a caller-chosen one-time token (revert handles are stored
    /// both on the change row and here, under the same value).
    async fn insert_approval_token(
        &self,
        token: &str,
        change_id: &str,
        kind: ApprovalTokenKind,
        ttl: Duration,
    ) -> CoreResult<()>;

    /// Atomically verifies and consumes a token. Exactly one concurrent
    /// caller succeeds; a consumed or expired token always fails.
    async fn verify_and_consume_token(&self, change_id: &str, token: &str) -> CoreResult<bool>;

    /// Loads token metadata without consuming it.
    async fn get_approval_token(&self, token: &str) -> CoreResult<Option<ApprovalToken>>;

    /// Deletes consumed and expired tokens. Returns the number removed.
    async fn gc_tokens(&self, now: DateTime<Utc>) -> CoreResult<u64>;

    // Audit

    /// Appends an audit record. Audit rows are never mutated or pruned here.
    async fn insert_audit(&self, change_id: &str, event: &str, meta: &Value) -> CoreResult<()>;

    /// Audit trail for a change, oldest first.
    async fn list_audit(&self, change_id: &str) -> CoreResult<Vec<AuditRecord>>;

    // API keys

    /// Issues a new API key for an email.
    async fn create_api_key(&self, email: &str) -> CoreResult<ApiKeyRecord>;

    /// Validates a key and atomically increments its usage counter.
    async fn validate_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>>;

    /// Loads a key record without counting a use.
    async fn get_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>>;

    /// Links a GitHub App installation to a tenant.
    async fn link_installation(&self, api_key: &str, installation_id: i64) -> CoreResult<()>;

    // Tenant settings

    /// Loads settings, decrypting secret-bearing fields.
    async fn get_settings(&self, api_key: &str) -> CoreResult<Option<TenantSettings>>;

    /// Upserts settings, encrypting secret-bearing fields.
    async fn upsert_settings(&self, settings: &TenantSettings) -> CoreResult<()>;

    // Installations

    /// Records or refreshes an installation.
    async fn upsert_installation(&self, record: &InstallationRecord) -> CoreResult<()>;

    /// Removes an installation on uninstall.
    async fn delete_installation(&self, installation_id: i64) -> CoreResult<()>;

    /// Looks an installation up by id.
    async fn get_installation(&self, installation_id: i64)
        -> CoreResult<Option<InstallationRecord>>;

    /// Finds the installation covering a repository.
    async fn find_installation_by_repo(
        &self,
        repo_full_name: &str,
    ) -> CoreResult<Option<InstallationRecord>>;

    // OAuth setup sessions

    /// Starts a setup session for a tenant. Returns the CSRF state.
    async fn create_oauth_session(&self, api_key: &str, ttl: Duration) -> CoreResult<String>;

    /// Loads a session by state.
    async fn get_oauth_session(&self, state: &str) -> CoreResult<Option<OauthSetupSession>>;

    /// Marks the Slack side complete. Atomic against a racing callback;
    /// returns the owning api key, or `None` when the state is unknown,
    /// expired, or already completed on this side.
    async fn complete_slack_oauth(&self, state: &str) -> CoreResult<Option<String>>;

    /// Marks the GitHub side complete and captures the installation id.
    /// Same atomicity as the Slack completion.
    async fn complete_github_installation(
        &self,
        state: &str,
        installation_id: i64,
    ) -> CoreResult<Option<String>>;
}
