//! Revert descriptors and the SHA resolver.
//!
//! A revert descriptor is stored in `summary_json.revert_action` when an
//! operation executes (or when the webhook ingress observes one). Reverting
//! dispatches on the descriptor type; for branch restores the SHA is
//! resolved from an ordered list of sources, first success wins.

use crate::errors::{CoreError, CoreResult};
use crate::providers::{Provider, TargetKind};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Typed revert descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RevertAction {
    /// Recreate a deleted branch at its last head.
    BranchRestore {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Branch name.
        branch: String,
        /// Saved head SHA, when captured at delete time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha: Option<String>,
    },
    /// Reset a force-pushed branch to its previous head.
    ForcePushRevert {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Branch name.
        branch: String,
        /// Head before the force push.
        before_sha: Option<String>,
    },
    /// Counter-commit the inverse of a merge. Git history retains the merge.
    MergeRevert {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Target branch of the merge.
        branch: String,
        /// The merge commit.
        merge_commit_sha: Option<String>,
    },
    /// Unarchive an archived repository.
    RepositoryUnarchive {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// Re-archive an unarchived repository.
    RepositoryArchive {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// Reopen bulk-closed pull requests.
    BulkReopen {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Numbers closed by the original operation.
        pr_numbers: Vec<u64>,
    },
    /// Delete a freshly created or updated secret.
    SecretDelete {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Secret name.
        secret_name: String,
    },
    /// Flip repository visibility back.
    VisibilityRevert {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Visibility to restore.
        private: bool,
    },
    /// Re-apply a stored branch-protection configuration.
    BranchProtectionRestore {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Protected branch.
        branch: String,
        /// Prior protection settings.
        protection: Value,
    },
    /// Restore a workflow file to its prior content.
    WorkflowRestore {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Workflow file path.
        path: String,
        /// Prior content, base64.
        content: String,
        /// File SHA at restore time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prior_sha: Option<String>,
    },
}

impl RevertAction {
    /// Reads the descriptor out of a summary blob.
    pub fn from_summary(summary: &Value) -> Option<Self> {
        summary
            .get("revert_action")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The descriptor as a JSON value for persistence.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Owner and repository of the descriptor's target.
    pub fn owner_repo(&self) -> (&str, &str) {
        match self {
            Self::BranchRestore { owner, repo, .. }
            | Self::ForcePushRevert { owner, repo, .. }
            | Self::MergeRevert { owner, repo, .. }
            | Self::RepositoryUnarchive { owner, repo }
            | Self::RepositoryArchive { owner, repo }
            | Self::BulkReopen { owner, repo, .. }
            | Self::SecretDelete { owner, repo, .. }
            | Self::VisibilityRevert { owner, repo, .. }
            | Self::BranchProtectionRestore { owner, repo, .. }
            | Self::WorkflowRestore { owner, repo, .. } => (owner, repo),
        }
    }
}

/// Resolves the restore SHA for a deleted branch from an ordered list of
/// sources: the descriptor itself, the webhook payload's `before`, the
/// recorded branch head, stored push records, and finally the upstream
/// event feed. The first source that yields a SHA wins.
pub async fn resolve_restore_sha(
    action: &RevertAction,
    summary: &Value,
    recorded_head: Option<&str>,
    store: &dyn Store,
    provider: &dyn Provider,
    credential: &str,
) -> CoreResult<String> {
    let (owner, repo, branch, descriptor_sha) = match action {
        RevertAction::BranchRestore {
            owner,
            repo,
            branch,
            sha,
        } => (owner, repo, branch, sha.clone()),
        _ => return Err(CoreError::bad_request("not a branch restore")),
    };

    if let Some(sha) = descriptor_sha {
        return Ok(sha);
    }

    if let Some(sha) = summary
        .pointer("/payload/before")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && !s.chars().all(|c| c == '0'))
    {
        debug!(branch, "restore SHA from webhook payload");
        return Ok(sha.to_string());
    }

    if let Some(sha) = recorded_head.filter(|s| !s.is_empty()) {
        debug!(branch, "restore SHA from recorded branch head");
        return Ok(sha.to_string());
    }

    let full_name = format!("{owner}/{repo}");
    if let Some(sha) = store.find_branch_head_sha(&full_name, branch).await? {
        debug!(branch, "restore SHA from stored push records");
        return Ok(sha);
    }

    let target = TargetKind::Repo {
        owner: owner.clone(),
        repo: repo.clone(),
    };
    if let Some(sha) = provider
        .find_deleted_branch_sha(&target, credential, branch)
        .await
        .map_err(|e| e.into_core())?
    {
        debug!(branch, "restore SHA from upstream event feed");
        return Ok(sha);
    }

    Err(CoreError::bad_request(
        "cannot restore branch: no SHA available from any source",
    ))
}
