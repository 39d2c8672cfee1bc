//! Core data model: changes, approval tokens, audit records, tenants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upstream provider a change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ProviderKind {
    /// GitHub (REST v3).
    GitHub,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitHub => write!(f, "github"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::GitHub),
            _ => Err(()),
        }
    }
}

/// Lifecycle status of a change.
///
/// Transitions are constrained to the lifecycle diagram; anything else is a
/// bug and [`ChangeStatus::can_transition_to`] is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Dry-run created, awaiting approval.
    Pending,
    /// Approved, awaiting a poll-driven apply (no revert window).
    Approved,
    /// Executed against the upstream; revertable within the window.
    /// Webhook-originated changes enter the lifecycle here.
    Executed,
    /// Applied via the CLI/SDK poll path; revertable within the window.
    Applied,
    /// Reverse operation completed.
    Reverted,
    /// Rejected by an approver.
    Rejected,
    /// Approval deadline passed without a decision.
    Expired,
    /// Adapter failure during apply or revert.
    Failed,
}

impl ChangeStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Applied => "applied",
            Self::Reverted => "reverted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is legal from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Reverted | Self::Rejected | Self::Expired | Self::Failed
        )
    }

    /// Whether the transition `self -> next` is legal.
    pub fn can_transition_to(&self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        match self {
            Pending => matches!(next, Approved | Rejected | Expired | Applied | Executed | Failed),
            Approved => matches!(next, Executed | Applied | Failed),
            Executed | Applied => matches!(next, Reverted | Failed),
            Reverted | Rejected | Expired | Failed => false,
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "executed" => Ok(Self::Executed),
            "applied" => Ok(Self::Applied),
            "reverted" => Ok(Self::Reverted),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// The central entity: one proposed or executed privileged operation.
///
/// Credential fields (`token`, `revert_token`) hold plaintext in memory; the
/// store encrypts on write and decrypts on read, so at-rest values are always
/// ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Opaque UUID, unique and immutable.
    pub change_id: String,
    /// Target provider.
    pub provider: ProviderKind,
    /// Provider-specific target grammar (`owner/repo`, `owner/repo#branch`, …).
    pub target_id: String,
    /// Human title.
    pub title: Option<String>,
    /// Lifecycle status.
    pub status: ChangeStatus,
    /// Normalized risk score in [0, 1]. UIs display ×10.
    pub risk_score: f64,
    /// Whether an approver must act before execution.
    pub requires_approval: bool,
    /// Ordered risk and policy reasons.
    pub reasons: Vec<String>,
    /// Rule set effective at evaluation time. Immutable after creation.
    pub policy_json: Value,
    /// Opaque per-provider blob: operation type, revert descriptor, saved
    /// SHAs, installation id, payload excerpt.
    pub summary_json: Value,
    /// Operation context (object kind, default-branch flags, …).
    pub metadata: Value,
    /// Caller-supplied provider credential. None for webhook-origin or
    /// App-token changes.
    pub token: Option<String>,
    /// Opaque revert handle.
    pub revert_token: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Approval deadline.
    pub expires_at: DateTime<Utc>,
    /// Provider-supplied last-modified token captured at dry-run time, used
    /// for the optimistic-concurrency check on apply.
    pub last_edited_time: Option<DateTime<Utc>>,
    /// Revert window in hours, when the operation is revertable.
    pub revert_window: Option<i64>,
    /// Deadline after which the executed change can no longer be reverted.
    pub revert_expires_at: Option<DateTime<Utc>>,
    /// Owning tenant. Once set, reads and mutations from other tenants
    /// behave as if the change does not exist.
    pub api_key: Option<String>,
    /// Per-change custom notification target.
    pub webhook_url: Option<String>,
    /// Rendered preview shown to approvers.
    pub human_preview: Option<String>,
    /// Head SHA recorded from push events, used by the delete-revert resolver.
    pub branch_head_sha: Option<String>,
    /// Outbound chat message id, for in-place message updates.
    pub chat_message_id: Option<String>,
}

/// Generates a fresh change id.
pub fn new_change_id() -> String {
    Uuid::new_v4().to_string()
}

/// What a one-time approval token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalTokenKind {
    /// Approve or reject the pending change.
    Approve,
    /// Trigger the reverse operation.
    Revert,
}

impl ApprovalTokenKind {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Revert => "revert",
        }
    }
}

impl FromStr for ApprovalTokenKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "revert" => Ok(Self::Revert),
            _ => Err(()),
        }
    }
}

/// One-time credential binding an approver's action to one change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    /// Opaque token value.
    pub token: String,
    /// Change this token is bound to.
    pub change_id: String,
    /// What the token authorizes.
    pub kind: ApprovalTokenKind,
    /// Expiry; consumed or expired tokens are garbage-collected.
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been spent.
    pub used: bool,
    /// When it was spent.
    pub used_at: Option<DateTime<Utc>>,
}

/// Append-only audit record. Never mutated, never pruned by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Change this event belongs to.
    pub change_id: String,
    /// Event name (`dry_run`, `applied`, `reverted`, …).
    pub event: String,
    /// Structured event context. Never contains tokens or credentials.
    pub meta: Value,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
}

/// Per-tenant API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Opaque key (`sr_` prefix).
    pub api_key: String,
    /// Registered email.
    pub email: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Validated-request counter.
    pub usage_count: i64,
    /// Whether the key is active.
    pub is_active: bool,
    /// Linked GitHub App installation, if any.
    pub installation_id: Option<i64>,
}

/// Ephemeral CSRF state for the unified Slack + GitHub installation flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthSetupSession {
    /// Opaque state (UUID).
    pub state: String,
    /// Tenant starting the flow.
    pub api_key: String,
    /// Session deadline (≤ 30 minutes).
    pub expires_at: DateTime<Utc>,
    /// Whether the session was consumed.
    pub used: bool,
    /// Slack side completed.
    pub slack_connected: bool,
    /// GitHub App side completed.
    pub github_installed: bool,
    /// Installation captured by the GitHub callback.
    pub installation_id: Option<i64>,
}

/// GitHub App installation, resolved to a tenant by the webhook ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationRecord {
    /// Upstream installation id.
    pub installation_id: i64,
    /// Account the App is installed on.
    pub account_login: String,
    /// Repositories covered by the installation (`owner/repo`).
    pub repositories: Vec<String>,
    /// Linked tenant, once claimed.
    pub api_key: Option<String>,
    /// Installation timestamp.
    pub installed_at: DateTime<Utc>,
}

/// Per-tenant notification and protection settings.
///
/// Secret-bearing fields (`slack_bot_token`, `webhook_secret`) are ciphertext
/// at rest; the store decrypts on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Owning tenant.
    pub api_key: String,
    /// Slack incoming-webhook URL (simple channel).
    pub slack_webhook_url: Option<String>,
    /// Slack OAuth bot token (rich channel).
    pub slack_bot_token: Option<String>,
    /// Slack channel for bot messages.
    pub slack_channel: Option<String>,
    /// Slack delivery enabled.
    pub slack_enabled: bool,
    /// Email address for the optional email channel.
    pub email: Option<String>,
    /// Email delivery enabled.
    pub email_enabled: bool,
    /// Generic webhook URL.
    pub webhook_url: Option<String>,
    /// Shared HMAC secret for the generic webhook.
    pub webhook_secret: Option<String>,
    /// Generic webhook delivery enabled.
    pub webhook_enabled: bool,
    /// Channel preference list.
    pub notification_channels: Vec<String>,
    /// Comma-separated protected-branch patterns. Defaults to `main,master`.
    pub protected_branches: Option<String>,
}

impl TenantSettings {
    /// Protected-branch patterns, applying the default.
    pub fn protected_branch_patterns(&self) -> Vec<String> {
        self.protected_branches
            .as_deref()
            .unwrap_or("main,master")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ChangeStatus::Pending, ChangeStatus::Approved, true)]
    #[test_case(ChangeStatus::Pending, ChangeStatus::Rejected, true)]
    #[test_case(ChangeStatus::Pending, ChangeStatus::Expired, true)]
    #[test_case(ChangeStatus::Pending, ChangeStatus::Executed, true)]
    #[test_case(ChangeStatus::Approved, ChangeStatus::Applied, true)]
    #[test_case(ChangeStatus::Executed, ChangeStatus::Reverted, true)]
    #[test_case(ChangeStatus::Applied, ChangeStatus::Reverted, true)]
    #[test_case(ChangeStatus::Executed, ChangeStatus::Failed, true)]
    #[test_case(ChangeStatus::Expired, ChangeStatus::Approved, false)]
    #[test_case(ChangeStatus::Rejected, ChangeStatus::Pending, false)]
    #[test_case(ChangeStatus::Reverted, ChangeStatus::Executed, false)]
    #[test_case(ChangeStatus::Approved, ChangeStatus::Rejected, false)]
    #[test_case(ChangeStatus::Executed, ChangeStatus::Applied, false)]
    #[test_case(ChangeStatus::Failed, ChangeStatus::Reverted, false)]
    fn test_transition_legality(from: ChangeStatus, to: ChangeStatus, expected: bool) {
        assert_eq!(from.can_transition_to(to), expected);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ChangeStatus::Reverted.is_terminal());
        assert!(ChangeStatus::Rejected.is_terminal());
        assert!(ChangeStatus::Expired.is_terminal());
        assert!(ChangeStatus::Failed.is_terminal());
        assert!(!ChangeStatus::Pending.is_terminal());
        assert!(!ChangeStatus::Executed.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ChangeStatus::Pending,
            ChangeStatus::Approved,
            ChangeStatus::Executed,
            ChangeStatus::Applied,
            ChangeStatus::Reverted,
            ChangeStatus::Rejected,
            ChangeStatus::Expired,
            ChangeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ChangeStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_change_id_uniqueness() {
        assert_ne!(new_change_id(), new_change_id());
    }

    #[test]
    fn test_protected_branch_defaults() {
        let settings = TenantSettings::default();
        assert_eq!(settings.protected_branch_patterns(), vec!["main", "master"]);

        let custom = TenantSettings {
            protected_branches: Some("main, release/*".to_string()),
            ..Default::default()
        };
        assert_eq!(custom.protected_branch_patterns(), vec!["main", "release/*"]);
    }
}
