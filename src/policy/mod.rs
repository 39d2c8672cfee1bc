//! Policy engine: pure evaluation of an enumerated rule set.
//!
//! Rule sets arrive per request or from the configured default. Evaluation
//! mode is `ANY` (one matched rule requires approval) or `ALL` (every rule
//! must match). Matched rule ids are reported as `type:value` strings.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    /// Any matched rule requires approval.
    #[serde(rename = "ANY", alias = "any")]
    Any,
    /// All rules must match.
    #[serde(rename = "ALL", alias = "all")]
    All,
}

impl Default for PolicyMode {
    fn default() -> Self {
        Self::Any
    }
}

/// A single policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule type.
    #[serde(rename = "type")]
    pub rule_type: String,
    /// Rule threshold or keyword list.
    pub value: Value,
    /// Action taken on match. Only `require_approval` is defined.
    #[serde(default = "default_action")]
    pub action: String,
}

fn default_action() -> String {
    "require_approval".to_string()
}

/// A versioned rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Rule-set version.
    #[serde(default)]
    pub version: Option<String>,
    /// Rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Evaluation mode.
    #[serde(default)]
    pub mode: PolicyMode,
}

impl Policy {
    /// The built-in default rule set.
    pub fn default_rules() -> Self {
        serde_json::from_value(json!({
            "version": "1.0",
            "rules": [
                { "type": "max_risk", "value": 0.7, "action": "require_approval" },
                { "type": "block_keywords", "value": ["contract", "pricing"], "action": "require_approval" },
                { "type": "edited_within_hours", "value": 2, "action": "require_approval" },
                { "type": "max_blocks", "value": 200, "action": "require_approval" },
            ],
            "mode": "ANY",
        }))
        .expect("default policy is valid")
    }

    /// Parses a caller-supplied policy blob. A bare `{"max_risk": x}` object
    /// is accepted for back-compat and lifted into a one-rule set.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("rules").is_some() {
            return serde_json::from_value(value.clone()).ok();
        }
        if let Some(max_risk) = value.get("max_risk") {
            return serde_json::from_value(json!({
                "version": "1.0",
                "rules": [
                    { "type": "max_risk", "value": max_risk, "action": "require_approval" }
                ],
                "mode": "ANY",
            }))
            .ok();
        }
        None
    }

    /// The rule set as a JSON blob, for persistence on the change record.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Evaluation context assembled by the change engine.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Normalized risk score.
    pub risk_score: f64,
    /// Item title.
    pub title: Option<String>,
    /// Child/blocks count.
    pub blocks_count: i64,
    /// Parent object type, where the provider reports one.
    pub parent_type: Option<String>,
    /// Hours since the item was last edited.
    pub edited_age_hours: f64,
}

/// Evaluates the rule set. Returns whether approval is required and the
/// matched rule ids.
pub fn evaluate(ctx: &PolicyContext, policy: &Policy) -> (bool, Vec<String>) {
    let title = ctx.title.as_deref().unwrap_or("").to_lowercase();
    let mut hits: Vec<String> = Vec::new();

    for rule in &policy.rules {
        let matched = match rule.rule_type.as_str() {
            "max_risk" => rule
                .value
                .as_f64()
                .map(|v| ctx.risk_score > v)
                .unwrap_or(false),
            "block_keywords" => rule
                .value
                .as_array()
                .map(|keywords| {
                    keywords
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|k| title.contains(&k.to_lowercase()))
                })
                .unwrap_or(false),
            "edited_within_hours" => rule
                .value
                .as_f64()
                .map(|v| ctx.edited_age_hours <= v)
                .unwrap_or(false),
            "max_blocks" => rule
                .value
                .as_i64()
                .map(|v| ctx.blocks_count > v)
                .unwrap_or(false),
            "min_blocks" => rule
                .value
                .as_i64()
                .map(|v| ctx.blocks_count < v)
                .unwrap_or(false),
            "require_db_parent" => ctx.parent_type.as_deref() != Some("database"),
            _ => false,
        };

        if matched && rule.action == "require_approval" {
            hits.push(format!("{}:{}", rule.rule_type, rule.value));
        }
    }

    let requires_approval = match policy.mode {
        PolicyMode::All => !policy.rules.is_empty() && hits.len() == policy.rules.len(),
        PolicyMode::Any => !hits.is_empty(),
    };
    (requires_approval, hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(risk: f64) -> PolicyContext {
        PolicyContext {
            risk_score: risk,
            title: Some("quarterly report".to_string()),
            blocks_count: 10,
            parent_type: None,
            edited_age_hours: 100.0,
        }
    }

    #[test]
    fn test_max_risk_triggers() {
        let policy = Policy::default_rules();
        let (requires, hits) = evaluate(&ctx(0.9), &policy);
        assert!(requires);
        assert_eq!(hits, vec!["max_risk:0.7"]);
    }

    #[test]
    fn test_quiet_context_passes() {
        let policy = Policy::default_rules();
        let (requires, hits) = evaluate(&ctx(0.1), &policy);
        assert!(!requires);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_block_keywords_case_insensitive() {
        let policy = Policy::default_rules();
        let mut context = ctx(0.1);
        context.title = Some("Pricing Overview".to_string());
        let (requires, hits) = evaluate(&context, &policy);
        assert!(requires);
        assert!(hits[0].starts_with("block_keywords:"));
    }

    #[test]
    fn test_edited_within_hours() {
        let policy = Policy::default_rules();
        let mut context = ctx(0.1);
        context.edited_age_hours = 0.5;
        let (requires, _) = evaluate(&context, &policy);
        assert!(requires);
    }

    #[test]
    fn test_all_mode_needs_every_rule() {
        let mut policy = Policy::default_rules();
        policy.mode = PolicyMode::All;
        // Only one rule matches.
        let (requires, hits) = evaluate(&ctx(0.9), &policy);
        assert!(!requires);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_bare_max_risk_back_compat() {
        let policy = Policy::from_value(&serde_json::json!({ "max_risk": 0.5 })).unwrap();
        assert_eq!(policy.rules.len(), 1);
        let (requires, _) = evaluate(&ctx(0.6), &policy);
        assert!(requires);
    }

    #[test]
    fn test_min_blocks_and_db_parent() {
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "rules": [
                { "type": "min_blocks", "value": 5 },
                { "type": "require_db_parent", "value": true },
            ],
            "mode": "ANY",
        }))
        .unwrap();
        let mut context = ctx(0.0);
        context.blocks_count = 2;
        context.parent_type = Some("page".to_string());
        let (requires, hits) = evaluate(&context, &policy);
        assert!(requires);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_unknown_rule_type_is_inert() {
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "rules": [{ "type": "lunar_phase", "value": "full" }],
        }))
        .unwrap();
        let (requires, hits) = evaluate(&ctx(0.9), &policy);
        assert!(!requires);
        assert!(hits.is_empty());
    }
}
