//! GitHub provider adapter.
//!
//! Thin REST v3 client scoped to the operations the change engine gates.
//! Credentials travel per call and never live on the adapter.

use super::{
    ForcePushOutcome, MergeOutcome, PrSummary, Provider, ProviderError, ProviderResult, TargetKind,
};
use crate::types::ProviderKind;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{header, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// API version header value.
const API_VERSION: &str = "2022-11-28";

/// User-Agent sent on every request (GitHub requires one).
const USER_AGENT: &str = concat!("saferun-core/", env!("CARGO_PKG_VERSION"));

/// GitHub REST adapter.
#[derive(Debug, Clone)]
pub struct GitHubAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl GitHubAdapter {
    /// Creates an adapter against the given API base with a bounded
    /// per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        credential: &str,
        body: Option<&Value>,
    ) -> ProviderResult<Option<Value>> {
        if credential.is_empty() {
            return Err(ProviderError::Unauthorized);
        }

        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .header(header::AUTHORIZATION, format!("Bearer {credential}"))
            .header(header::ACCEPT, "application/vnd.github+json")
            .header(header::USER_AGENT, USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ProviderError::Transient(format!("request failed: {e}"))
            } else {
                ProviderError::Other(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "github request");

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if status.is_success() {
            let value = response
                .json::<Value>()
                .await
                .map_err(|e| ProviderError::Other(format!("malformed response body: {e}")))?;
            return Ok(Some(value));
        }

        Err(Self::error_from_response(status, response).await)
    }

    async fn error_from_response(status: StatusCode, response: reqwest::Response) -> ProviderError {
        let rate_limited = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0");
        let reset_at = response
            .headers()
            .get("X-RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());

        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        match status {
            StatusCode::UNAUTHORIZED => ProviderError::Unauthorized,
            StatusCode::FORBIDDEN if rate_limited => ProviderError::RateLimit { reset_at },
            StatusCode::FORBIDDEN => ProviderError::Forbidden,
            StatusCode::NOT_FOUND => ProviderError::NotFound,
            StatusCode::CONFLICT => ProviderError::Conflict(message),
            StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Conflict(message),
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimit { reset_at },
            s if s.is_server_error() => ProviderError::Transient(message),
            _ => ProviderError::Other(message),
        }
    }

    async fn get_repo(&self, owner: &str, repo: &str, credential: &str) -> ProviderResult<Value> {
        self.request(Method::GET, &format!("/repos/{owner}/{repo}"), credential, None)
            .await?
            .ok_or_else(|| ProviderError::Other("empty repo metadata".into()))
    }

    async fn get_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        credential: &str,
    ) -> ProviderResult<Value> {
        self.request(
            Method::GET,
            &format!("/repos/{owner}/{repo}/branches/{branch}"),
            credential,
            None,
        )
        .await?
        .ok_or_else(|| ProviderError::Other("empty branch metadata".into()))
    }

    fn expect_branch<'a>(target: &'a TargetKind, op: &str) -> ProviderResult<(&'a str, &'a str, &'a str)> {
        match target {
            TargetKind::Branch { owner, repo, branch } => Ok((owner, repo, branch)),
            _ => Err(ProviderError::Other(format!(
                "{op} requires owner/repo#branch"
            ))),
        }
    }

    fn expect_repo<'a>(target: &'a TargetKind, op: &str) -> ProviderResult<(&'a str, &'a str)> {
        match target {
            TargetKind::Repo { owner, repo } => Ok((owner, repo)),
            _ => Err(ProviderError::Other(format!("{op} requires owner/repo"))),
        }
    }
}

#[async_trait]
impl Provider for GitHubAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn get_metadata(&self, target: &TargetKind, credential: &str) -> ProviderResult<Value> {
        match target {
            TargetKind::Bulk { owner, repo, view } => {
                let prs = self.list_open_prs(target, credential).await?;
                let sample: Vec<String> = prs
                    .iter()
                    .take(3)
                    .map(|p| format!("#{} \"{}\"", p.number, p.title))
                    .collect();
                Ok(json!({
                    "type": "bulk_pr",
                    "owner": owner,
                    "repo": repo,
                    "view_name": view,
                    "records_affected": prs.len(),
                    "sample": sample,
                }))
            }
            TargetKind::Merge {
                owner,
                repo,
                source,
                target: merge_target,
            } => {
                let repo_data = self.get_repo(owner, repo, credential).await?;
                let source_data = self.get_branch(owner, repo, source, credential).await?;
                let target_data = self.get_branch(owner, repo, merge_target, credential).await?;
                let default_branch = repo_data.get("default_branch").and_then(Value::as_str);
                Ok(json!({
                    "object": "merge",
                    "owner": owner,
                    "repo": repo,
                    "source_branch": source,
                    "target_branch": merge_target,
                    "source_sha": source_data.pointer("/commit/sha"),
                    "target_sha": target_data.pointer("/commit/sha"),
                    "isTargetDefault": default_branch == Some(merge_target.as_str()),
                    "default_branch": default_branch,
                    "lastPushedAt": repo_data.get("pushed_at"),
                }))
            }
            TargetKind::Branch { owner, repo, branch } => {
                let repo_data = self.get_repo(owner, repo, credential).await?;
                let branch_data = self.get_branch(owner, repo, branch, credential).await?;
                let default_branch = repo_data.get("default_branch").and_then(Value::as_str);
                Ok(json!({
                    "object": "branch",
                    "owner": owner,
                    "repo": repo,
                    "branch": branch,
                    "name": branch_data.get("name").and_then(Value::as_str).unwrap_or(branch),
                    "isDefault": default_branch == Some(branch.as_str()),
                    "default_branch": default_branch,
                    "lastCommitDate": branch_data.pointer("/commit/commit/committer/date"),
                    "sha": branch_data.pointer("/commit/sha"),
                }))
            }
            TargetKind::Repo { owner, repo } => {
                let repo_data = self.get_repo(owner, repo, credential).await?;
                Ok(json!({
                    "object": "repository",
                    "owner": owner,
                    "repo": repo,
                    "name": repo_data.get("name"),
                    "full_name": repo_data.get("full_name"),
                    "archived": repo_data.get("archived"),
                    "lastPushedAt": repo_data.get("pushed_at"),
                    "stars": repo_data.get("stargazers_count"),
                    "forks": repo_data.get("forks_count"),
                    "default_branch": repo_data.get("default_branch"),
                }))
            }
        }
    }

    async fn get_children_count(
        &self,
        target: &TargetKind,
        credential: &str,
    ) -> ProviderResult<i64> {
        match target {
            TargetKind::Bulk { .. } => {
                Ok(self.list_open_prs(target, credential).await?.len() as i64)
            }
            TargetKind::Branch { .. } => Ok(0),
            TargetKind::Repo { owner, repo } | TargetKind::Merge { owner, repo, .. } => {
                let repo_data = self.get_repo(owner, repo, credential).await?;
                Ok(repo_data
                    .get("open_issues_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0))
            }
        }
    }

    async fn archive(&self, target: &TargetKind, credential: &str) -> ProviderResult<()> {
        let (owner, repo) = Self::expect_repo(target, "archive")?;
        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}"),
            credential,
            Some(&json!({ "archived": true })),
        )
        .await?;
        Ok(())
    }

    async fn unarchive(&self, target: &TargetKind, credential: &str) -> ProviderResult<()> {
        let (owner, repo) = Self::expect_repo(target, "unarchive")?;
        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}"),
            credential,
            Some(&json!({ "archived": false })),
        )
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, target: &TargetKind, credential: &str) -> ProviderResult<String> {
        let (owner, repo, branch) = Self::expect_branch(target, "delete_branch")?;

        let git_ref = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/git/ref/heads/{branch}"),
                credential,
                None,
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty ref response".into()))?;
        let sha = git_ref
            .pointer("/object/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("unable to resolve branch SHA".into()))?
            .to_string();

        self.request(
            Method::DELETE,
            &format!("/repos/{owner}/{repo}/git/refs/heads/{branch}"),
            credential,
            None,
        )
        .await?;
        Ok(sha)
    }

    async fn restore_branch(
        &self,
        target: &TargetKind,
        credential: &str,
        sha: &str,
    ) -> ProviderResult<()> {
        let (owner, repo, branch) = Self::expect_branch(target, "restore_branch")?;
        let result = self
            .request(
                Method::POST,
                &format!("/repos/{owner}/{repo}/git/refs"),
                credential,
                Some(&json!({ "ref": format!("refs/heads/{branch}"), "sha": sha })),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Ref already exists: the branch is back, which is what we wanted.
            Err(ProviderError::Conflict(msg)) if msg.to_lowercase().contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_open_prs(
        &self,
        target: &TargetKind,
        credential: &str,
    ) -> ProviderResult<Vec<PrSummary>> {
        let (owner, repo) = target.owner_repo();
        let prs = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/pulls?state=open&per_page=100"),
                credential,
                None,
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty PR list response".into()))?;
        let prs = prs
            .as_array()
            .ok_or_else(|| ProviderError::Other("unexpected PR list shape".into()))?;

        Ok(prs
            .iter()
            .filter_map(|pr| {
                Some(PrSummary {
                    number: pr.get("number")?.as_u64()?,
                    title: pr
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    updated_at: pr
                        .get("updated_at")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            })
            .collect())
    }

    async fn bulk_close_prs(
        &self,
        target: &TargetKind,
        credential: &str,
        pr_numbers: Option<Vec<u64>>,
    ) -> ProviderResult<Vec<u64>> {
        let (owner, repo) = target.owner_repo();
        let numbers = match pr_numbers {
            Some(numbers) => numbers,
            None => self
                .list_open_prs(target, credential)
                .await?
                .into_iter()
                .map(|p| p.number)
                .collect(),
        };

        for number in &numbers {
            self.request(
                Method::PATCH,
                &format!("/repos/{owner}/{repo}/pulls/{number}"),
                credential,
                Some(&json!({ "state": "closed" })),
            )
            .await?;
        }
        Ok(numbers)
    }

    async fn bulk_reopen(
        &self,
        target: &TargetKind,
        credential: &str,
        pr_numbers: &[u64],
    ) -> ProviderResult<()> {
        let (owner, repo) = target.owner_repo();
        for number in pr_numbers {
            self.request(
                Method::PATCH,
                &format!("/repos/{owner}/{repo}/pulls/{number}"),
                credential,
                Some(&json!({ "state": "open" })),
            )
            .await?;
        }
        Ok(())
    }

    async fn force_push(
        &self,
        target: &TargetKind,
        credential: &str,
        new_sha: &str,
    ) -> ProviderResult<ForcePushOutcome> {
        let (owner, repo, branch) = Self::expect_branch(target, "force_push")?;

        let branch_data = self.get_branch(owner, repo, branch, credential).await?;
        let previous_sha = branch_data
            .pointer("/commit/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("unable to resolve current branch SHA".into()))?
            .to_string();

        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}/git/refs/heads/{branch}"),
            credential,
            Some(&json!({ "sha": new_sha, "force": true })),
        )
        .await?;

        Ok(ForcePushOutcome {
            previous_sha,
            new_sha: new_sha.to_string(),
        })
    }

    async fn merge(
        &self,
        target: &TargetKind,
        credential: &str,
        commit_message: Option<&str>,
    ) -> ProviderResult<MergeOutcome> {
        let (owner, repo, source, merge_target) = match target {
            TargetKind::Merge {
                owner,
                repo,
                source,
                target,
            } => (owner, repo, source, target),
            _ => {
                return Err(ProviderError::Other(
                    "merge requires owner/repo#source→target".into(),
                ))
            }
        };

        let repo_data = self.get_repo(owner, repo, credential).await?;
        let target_is_default =
            repo_data.get("default_branch").and_then(Value::as_str) == Some(merge_target.as_str());

        let mut payload = json!({ "base": merge_target, "head": source });
        if let Some(message) = commit_message {
            payload["commit_message"] = json!(message);
        }

        let result = self
            .request(
                Method::POST,
                &format!("/repos/{owner}/{repo}/merges"),
                credential,
                Some(&payload),
            )
            .await?;

        Ok(MergeOutcome {
            merge_sha: result
                .as_ref()
                .and_then(|v| v.get("sha"))
                .and_then(Value::as_str)
                .map(String::from),
            target_is_default,
        })
    }

    async fn delete_repository(
        &self,
        target: &TargetKind,
        credential: &str,
    ) -> ProviderResult<()> {
        let (owner, repo) = Self::expect_repo(target, "delete_repository")?;
        self.request(Method::DELETE, &format!("/repos/{owner}/{repo}"), credential, None)
            .await?;
        Ok(())
    }

    async fn revert_force_push(
        &self,
        target: &TargetKind,
        credential: &str,
        before_sha: &str,
    ) -> ProviderResult<()> {
        let (owner, repo, branch) = Self::expect_branch(target, "revert_force_push")?;
        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}/git/refs/heads/{branch}"),
            credential,
            Some(&json!({ "sha": before_sha, "force": true })),
        )
        .await?;
        Ok(())
    }

    async fn create_counter_commit(
        &self,
        target: &TargetKind,
        credential: &str,
        merge_commit_sha: &str,
    ) -> ProviderResult<()> {
        let (owner, repo, branch) = Self::expect_branch(target, "create_counter_commit")?;

        // Tree of the merge commit's first parent is the pre-merge state.
        let merge_commit = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/git/commits/{merge_commit_sha}"),
                credential,
                None,
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty commit response".into()))?;
        let parent_sha = merge_commit
            .pointer("/parents/0/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("merge commit has no parent".into()))?
            .to_string();

        let parent_commit = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/git/commits/{parent_sha}"),
                credential,
                None,
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty commit response".into()))?;
        let parent_tree = parent_commit
            .pointer("/tree/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("parent commit has no tree".into()))?
            .to_string();

        let branch_data = self.get_branch(owner, repo, branch, credential).await?;
        let head_sha = branch_data
            .pointer("/commit/sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("unable to resolve branch head".into()))?
            .to_string();

        // New commit on top of the current head with the pre-merge tree.
        // History keeps the merge; the branch content no longer does.
        let revert_commit = self
            .request(
                Method::POST,
                &format!("/repos/{owner}/{repo}/git/commits"),
                credential,
                Some(&json!({
                    "message": format!("Revert merge commit {}", &merge_commit_sha[..merge_commit_sha.len().min(8)]),
                    "tree": parent_tree,
                    "parents": [head_sha],
                })),
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty commit creation response".into()))?;
        let revert_sha = revert_commit
            .get("sha")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Other("commit creation returned no SHA".into()))?;

        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}/git/refs/heads/{branch}"),
            credential,
            Some(&json!({ "sha": revert_sha })),
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(
        &self,
        target: &TargetKind,
        credential: &str,
        secret_name: &str,
    ) -> ProviderResult<()> {
        let (owner, repo) = target.owner_repo();
        self.request(
            Method::DELETE,
            &format!("/repos/{owner}/{repo}/actions/secrets/{secret_name}"),
            credential,
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_visibility(
        &self,
        target: &TargetKind,
        credential: &str,
        private: bool,
    ) -> ProviderResult<()> {
        let (owner, repo) = target.owner_repo();
        self.request(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}"),
            credential,
            Some(&json!({ "private": private })),
        )
        .await?;
        Ok(())
    }

    async fn put_branch_protection(
        &self,
        target: &TargetKind,
        credential: &str,
        branch: &str,
        protection: &Value,
    ) -> ProviderResult<()> {
        let (owner, repo) = target.owner_repo();
        self.request(
            Method::PUT,
            &format!("/repos/{owner}/{repo}/branches/{branch}/protection"),
            credential,
            Some(protection),
        )
        .await?;
        Ok(())
    }

    async fn put_workflow_file(
        &self,
        target: &TargetKind,
        credential: &str,
        path: &str,
        content_b64: &str,
        message: &str,
        prior_sha: Option<&str>,
    ) -> ProviderResult<()> {
        let (owner, repo) = target.owner_repo();
        let mut payload = json!({ "message": message, "content": content_b64 });
        if let Some(sha) = prior_sha {
            payload["sha"] = json!(sha);
        }
        self.request(
            Method::PUT,
            &format!("/repos/{owner}/{repo}/contents/{path}"),
            credential,
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    async fn find_deleted_branch_sha(
        &self,
        target: &TargetKind,
        credential: &str,
        branch: &str,
    ) -> ProviderResult<Option<String>> {
        let (owner, repo) = target.owner_repo();
        let events = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/events?per_page=100"),
                credential,
                None,
            )
            .await?
            .ok_or_else(|| ProviderError::Other("empty events response".into()))?;
        let events = match events.as_array() {
            Some(events) => events.clone(),
            None => return Ok(None),
        };

        let wanted_ref = format!("refs/heads/{branch}");
        for event in events {
            if event.get("type").and_then(Value::as_str) == Some("PushEvent")
                && event.pointer("/payload/ref").and_then(Value::as_str) == Some(wanted_ref.as_str())
            {
                if let Some(head) = event.pointer("/payload/head").and_then(Value::as_str) {
                    return Ok(Some(head.to_string()));
                }
            }
        }
        Ok(None)
    }
}

/// Parses an ISO 8601 timestamp from provider metadata.
pub fn parse_provider_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter(server: &MockServer) -> GitHubAdapter {
        GitHubAdapter::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_repo_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets"))
            .and(header("User-Agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "widgets",
                "full_name": "octo/widgets",
                "archived": false,
                "pushed_at": "2026-07-30T10:00:00Z",
                "stargazers_count": 12,
                "forks_count": 3,
                "default_branch": "main",
            })))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets").unwrap();
        let metadata = adapter(&server)
            .await
            .get_metadata(&target, "ghp_test")
            .await
            .unwrap();

        assert_eq!(metadata["object"], "repository");
        assert_eq!(metadata["default_branch"], "main");
        assert_eq!(metadata["lastPushedAt"], "2026-07-30T10:00:00Z");
    }

    #[tokio::test]
    async fn test_branch_metadata_flags_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "default_branch": "main",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "main",
                "commit": {
                    "sha": "abc123",
                    "commit": { "committer": { "date": "2026-07-31T12:00:00Z" } }
                },
            })))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets#main").unwrap();
        let metadata = adapter(&server)
            .await
            .get_metadata(&target, "ghp_test")
            .await
            .unwrap();

        assert_eq!(metadata["isDefault"], true);
        assert_eq!(metadata["sha"], "abc123");
    }

    #[tokio::test]
    async fn test_delete_branch_returns_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/git/ref/heads/feature-x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": { "sha": "feadbeef" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/repos/octo/widgets/git/refs/heads/feature-x"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets#feature-x").unwrap();
        let sha = adapter(&server)
            .await
            .delete_branch(&target, "ghp_test")
            .await
            .unwrap();
        assert_eq!(sha, "feadbeef");
    }

    #[tokio::test]
    async fn test_restore_branch_tolerates_existing_ref() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/widgets/git/refs"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "message": "Reference already exists"
            })))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets#feature-x").unwrap();
        let result = adapter(&server)
            .await
            .restore_branch(&target, "ghp_test", "feadbeef")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_reset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("X-RateLimit-Reset", "1753950000")
                    .set_body_json(serde_json::json!({ "message": "API rate limit exceeded" })),
            )
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets").unwrap();
        let err = adapter(&server)
            .await
            .get_metadata(&target, "ghp_test")
            .await
            .unwrap_err();
        match err {
            ProviderError::RateLimit { reset_at } => assert!(reset_at.is_some()),
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_and_not_found_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "Not Found"
            })))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/missing").unwrap();
        let err = adapter(&server)
            .await
            .get_metadata(&target, "ghp_test")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound));
    }

    #[tokio::test]
    async fn test_force_push_captures_previous_sha() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "main",
                "commit": { "sha": "oldsha" },
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/widgets/git/refs/heads/main"))
            .and(body_partial_json(serde_json::json!({ "force": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets#main").unwrap();
        let outcome = adapter(&server)
            .await
            .force_push(&target, "ghp_test", "newsha")
            .await
            .unwrap();
        assert_eq!(outcome.previous_sha, "oldsha");
        assert_eq!(outcome.new_sha, "newsha");
    }

    #[tokio::test]
    async fn test_bulk_close_collects_numbers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/pulls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "number": 7, "title": "fix", "updated_at": "2026-07-30T10:00:00Z" },
                { "number": 9, "title": "feat", "updated_at": "2026-07-29T10:00:00Z" },
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/widgets/pulls/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/octo/widgets/pulls/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets@open_prs").unwrap();
        let closed = adapter(&server)
            .await
            .bulk_close_prs(&target, "ghp_test", None)
            .await
            .unwrap();
        assert_eq!(closed, vec![7, 9]);
    }

    #[tokio::test]
    async fn test_find_deleted_branch_sha_from_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "type": "CreateEvent", "payload": { "ref": "feature-x", "ref_type": "branch" } },
                { "type": "PushEvent", "payload": { "ref": "refs/heads/feature-x", "head": "cafe1234" } },
            ])))
            .mount(&server)
            .await;

        let target = TargetKind::parse("octo/widgets").unwrap();
        let sha = adapter(&server)
            .await
            .find_deleted_branch_sha(&target, "ghs_installation", "feature-x")
            .await
            .unwrap();
        assert_eq!(sha.as_deref(), Some("cafe1234"));
    }
}
