//! Provider adapters: uniform metadata, mutate, and revert calls against a
//! remote system.
//!
//! Each provider implements the [`Provider`] capability trait; unsupported
//! operations are visible as absent methods at compile time, not runtime
//! attribute errors. Adapters are stateless beyond their HTTP client; one
//! instance per provider is adequate, and credentials travel per call.

use crate::errors::{CoreError, CoreResult};
use crate::types::ProviderKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod app_auth;
pub mod github;

pub use app_auth::AppTokenMinter;
pub use github::GitHubAdapter;

/// Parsed target grammar.
///
/// `owner/repo` · `owner/repo#branch` · `owner/repo#source→target` ·
/// `owner/repo@view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetKind {
    /// A whole repository.
    Repo {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
    /// A single branch.
    Branch {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Branch name.
        branch: String,
    },
    /// A merge of one branch into another.
    Merge {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Source branch.
        source: String,
        /// Target branch.
        target: String,
    },
    /// A bulk view over open pull requests.
    Bulk {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// View name.
        view: String,
    },
}

impl TargetKind {
    /// Parses the provider target grammar.
    pub fn parse(target_id: &str) -> CoreResult<Self> {
        let split_owner_repo = |s: &str| -> CoreResult<(String, String)> {
            match s.split_once('/') {
                Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
                    Ok((owner.to_string(), repo.to_string()))
                }
                _ => Err(CoreError::bad_request(format!(
                    "target_id must be owner/repo[...], got: {target_id}"
                ))),
            }
        };

        if let Some((owner_repo, view)) = target_id.split_once('@') {
            let (owner, repo) = split_owner_repo(owner_repo)?;
            if view.is_empty() {
                return Err(CoreError::bad_request("target_id view must not be empty"));
            }
            return Ok(Self::Bulk {
                owner,
                repo,
                view: view.to_string(),
            });
        }

        if let Some((owner_repo, git_ref)) = target_id.split_once('#') {
            let (owner, repo) = split_owner_repo(owner_repo)?;
            if let Some((source, target)) = git_ref.split_once('→') {
                if source.is_empty() || target.is_empty() {
                    return Err(CoreError::bad_request(
                        "merge target_id must be owner/repo#source→target",
                    ));
                }
                return Ok(Self::Merge {
                    owner,
                    repo,
                    source: source.to_string(),
                    target: target.to_string(),
                });
            }
            if git_ref.is_empty() {
                return Err(CoreError::bad_request("target_id branch must not be empty"));
            }
            return Ok(Self::Branch {
                owner,
                repo,
                branch: git_ref.to_string(),
            });
        }

        let (owner, repo) = split_owner_repo(target_id)?;
        Ok(Self::Repo { owner, repo })
    }

    /// The owner and repository components.
    pub fn owner_repo(&self) -> (&str, &str) {
        match self {
            Self::Repo { owner, repo }
            | Self::Branch { owner, repo, .. }
            | Self::Merge { owner, repo, .. }
            | Self::Bulk { owner, repo, .. } => (owner, repo),
        }
    }

    /// The branch name, for branch targets.
    pub fn branch(&self) -> Option<&str> {
        match self {
            Self::Branch { branch, .. } => Some(branch),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo { owner, repo } => write!(f, "{owner}/{repo}"),
            Self::Branch { owner, repo, branch } => write!(f, "{owner}/{repo}#{branch}"),
            Self::Merge {
                owner,
                repo,
                source,
                target,
            } => write!(f, "{owner}/{repo}#{source}→{target}"),
            Self::Bulk { owner, repo, view } => write!(f, "{owner}/{repo}@{view}"),
        }
    }
}

/// Typed upstream failures. Mutating calls are never retried transparently;
/// a rate-limit signal surfaces to the caller with its reset time.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Upstream rate limit exhausted.
    #[error("upstream rate limit exceeded")]
    RateLimit {
        /// When the limit resets, if the upstream said.
        reset_at: Option<DateTime<Utc>>,
    },
    /// Credential rejected.
    #[error("upstream rejected credentials")]
    Unauthorized,
    /// Credential valid but lacks the right.
    #[error("upstream forbade the operation")]
    Forbidden,
    /// Target does not exist.
    #[error("upstream target not found")]
    NotFound,
    /// State conflict at the upstream (e.g. ref already exists).
    #[error("upstream conflict: {0}")]
    Conflict(String),
    /// Transient failure worth retrying on a read path.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Anything else.
    #[error("upstream error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Maps the provider failure to the core taxonomy at the engine boundary.
    pub fn into_core(self) -> CoreError {
        match self {
            Self::RateLimit { reset_at } => {
                let mut err = CoreError::bad_gateway("upstream rate limit exceeded");
                if let Some(at) = reset_at {
                    let secs = (at - Utc::now()).num_seconds().max(0) as u64;
                    err = err.with_retry_after(secs);
                }
                err
            }
            Self::Unauthorized => CoreError::bad_gateway("upstream rejected credentials"),
            Self::Forbidden => CoreError::bad_gateway("upstream forbade the operation"),
            Self::NotFound => CoreError::not_found("upstream target not found"),
            Self::Conflict(msg) => CoreError::conflict(msg),
            Self::Transient(msg) | Self::Other(msg) => CoreError::bad_gateway(msg),
        }
    }
}

/// Result alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Open pull request summary used by bulk views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSummary {
    /// PR number.
    pub number: u64,
    /// PR title.
    pub title: String,
    /// Last update timestamp (ISO 8601).
    pub updated_at: Option<String>,
}

/// Outcome of a force push: both SHAs, so the revert handle is complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcePushOutcome {
    /// Branch head before the push. Revert is only possible when captured.
    pub previous_sha: String,
    /// Branch head after the push.
    pub new_sha: String,
}

/// Outcome of a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// SHA of the created merge commit.
    pub merge_sha: Option<String>,
    /// Whether the target was the default branch.
    pub target_is_default: bool,
}

/// Capability set every provider implements.
///
/// `get_metadata` must populate the fields the risk engine reads: `title` or
/// `name`, `object`, `isDefault`, `isTargetDefault`, `lastPushedAt`,
/// `lastCommitDate`, `linkedCount`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which provider this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Fetches normalized metadata for a parsed target.
    async fn get_metadata(&self, target: &TargetKind, credential: &str) -> ProviderResult<Value>;

    /// Child/affected-object count for the target (open PRs for bulk views,
    /// open issues for repositories, 0 for branches).
    async fn get_children_count(&self, target: &TargetKind, credential: &str)
        -> ProviderResult<i64>;

    /// Archives a repository. Reversible via [`Provider::unarchive`].
    async fn archive(&self, target: &TargetKind, credential: &str) -> ProviderResult<()>;

    /// Unarchives a repository.
    async fn unarchive(&self, target: &TargetKind, credential: &str) -> ProviderResult<()>;

    /// Deletes a branch, returning the head SHA needed to restore it.
    async fn delete_branch(&self, target: &TargetKind, credential: &str) -> ProviderResult<String>;

    /// Restores a deleted branch at the given SHA. Succeeds if the ref
    /// already exists.
    async fn restore_branch(
        &self,
        target: &TargetKind,
        credential: &str,
        sha: &str,
    ) -> ProviderResult<()>;

    /// Lists open pull requests for a bulk view.
    async fn list_open_prs(
        &self,
        target: &TargetKind,
        credential: &str,
    ) -> ProviderResult<Vec<PrSummary>>;

    /// Closes the given open PRs (or all open PRs when `None`), returning
    /// the closed numbers as the revert handle.
    async fn bulk_close_prs(
        &self,
        target: &TargetKind,
        credential: &str,
        pr_numbers: Option<Vec<u64>>,
    ) -> ProviderResult<Vec<u64>>;

    /// Reopens previously closed PRs.
    async fn bulk_reopen(
        &self,
        target: &TargetKind,
        credential: &str,
        pr_numbers: &[u64],
    ) -> ProviderResult<()>;

    /// Force-updates a branch ref. Reversible only because the previous SHA
    /// is captured in the outcome.
    async fn force_push(
        &self,
        target: &TargetKind,
        credential: &str,
        new_sha: &str,
    ) -> ProviderResult<ForcePushOutcome>;

    /// Merges source into target. Irreversible in-band; the revert path is a
    /// counter-commit.
    async fn merge(
        &self,
        target: &TargetKind,
        credential: &str,
        commit_message: Option<&str>,
    ) -> ProviderResult<MergeOutcome>;

    /// Deletes a repository. Irreversible.
    async fn delete_repository(&self, target: &TargetKind, credential: &str)
        -> ProviderResult<()>;

    /// Resets a branch ref to the pre-push SHA (force-push revert).
    async fn revert_force_push(
        &self,
        target: &TargetKind,
        credential: &str,
        before_sha: &str,
    ) -> ProviderResult<()>;

    /// Reverts a merge by committing the inverse of the merge commit on top
    /// of the branch. Git history retains the original merge.
    async fn create_counter_commit(
        &self,
        target: &TargetKind,
        credential: &str,
        merge_commit_sha: &str,
    ) -> ProviderResult<()>;

    /// Deletes an Actions secret (revert of a secret create/update).
    async fn delete_secret(
        &self,
        target: &TargetKind,
        credential: &str,
        secret_name: &str,
    ) -> ProviderResult<()>;

    /// Flips repository visibility.
    async fn set_visibility(
        &self,
        target: &TargetKind,
        credential: &str,
        private: bool,
    ) -> ProviderResult<()>;

    /// Re-applies a stored branch-protection configuration.
    async fn put_branch_protection(
        &self,
        target: &TargetKind,
        credential: &str,
        branch: &str,
        protection: &Value,
    ) -> ProviderResult<()>;

    /// Restores a workflow file to stored prior content.
    async fn put_workflow_file(
        &self,
        target: &TargetKind,
        credential: &str,
        path: &str,
        content_b64: &str,
        message: &str,
        prior_sha: Option<&str>,
    ) -> ProviderResult<()>;

    /// Recovers the head SHA of a deleted branch from the upstream event
    /// feed. Last-resort source for the delete-revert resolver.
    async fn find_deleted_branch_sha(
        &self,
        target: &TargetKind,
        credential: &str,
        branch: &str,
    ) -> ProviderResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_parse_repo() {
        let target = TargetKind::parse("octo/widgets").unwrap();
        assert_eq!(
            target,
            TargetKind::Repo {
                owner: "octo".into(),
                repo: "widgets".into()
            }
        );
    }

    #[test]
    fn test_parse_branch() {
        let target = TargetKind::parse("octo/widgets#feature-x").unwrap();
        assert_eq!(
            target,
            TargetKind::Branch {
                owner: "octo".into(),
                repo: "widgets".into(),
                branch: "feature-x".into()
            }
        );
    }

    #[test]
    fn test_parse_merge() {
        let target = TargetKind::parse("octo/widgets#dev→main").unwrap();
        assert_eq!(
            target,
            TargetKind::Merge {
                owner: "octo".into(),
                repo: "widgets".into(),
                source: "dev".into(),
                target: "main".into()
            }
        );
    }

    #[test]
    fn test_parse_bulk() {
        let target = TargetKind::parse("octo/widgets@open_prs").unwrap();
        assert_eq!(
            target,
            TargetKind::Bulk {
                owner: "octo".into(),
                repo: "widgets".into(),
                view: "open_prs".into()
            }
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("justaname" ; "no slash")]
    #[test_case("/repo" ; "empty owner")]
    #[test_case("owner/" ; "empty repo")]
    #[test_case("owner/repo#" ; "empty branch")]
    #[test_case("owner/repo@" ; "empty view")]
    #[test_case("owner/repo#→main" ; "empty merge source")]
    fn test_parse_rejects(input: &str) {
        assert!(TargetKind::parse(input).is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for input in [
            "octo/widgets",
            "octo/widgets#feature-x",
            "octo/widgets#dev→main",
            "octo/widgets@open_prs",
        ] {
            let parsed = TargetKind::parse(input).unwrap();
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn test_rate_limit_maps_with_retry_after() {
        let err = ProviderError::RateLimit {
            reset_at: Some(Utc::now() + chrono::Duration::seconds(90)),
        };
        let core = err.into_core();
        assert_eq!(core.status_code(), 502);
        assert!(core.retry_after().unwrap() <= 90);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        assert_eq!(ProviderError::NotFound.into_core().status_code(), 404);
    }
}
