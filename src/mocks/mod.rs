//! Test doubles: in-memory store, scripted provider, capturing channel.
//!
//! The in-memory store implements the full [`Store`] contract, including
//! encryption at the boundary, so invariant tests can inspect at-rest
//! values the same way they would against the real backend.

use crate::crypto::{looks_encrypted, TokenVault};
use crate::errors::{CoreError, CoreResult};
use crate::notify::{Notification, NotificationChannel};
use crate::providers::{
    ForcePushOutcome, MergeOutcome, PrSummary, Provider, ProviderError, ProviderResult, TargetKind,
};
use crate::store::{CorrelationQuery, Store};
use crate::tenants::generate_api_key;
use crate::types::{
    ApiKeyRecord, ApprovalToken, ApprovalTokenKind, AuditRecord, Change, ChangeStatus,
    InstallationRecord, OauthSetupSession, ProviderKind, TenantSettings,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A pending GitHub change with sensible defaults for tests.
pub fn sample_change(change_id: &str) -> Change {
    let now = Utc::now();
    Change {
        change_id: change_id.to_string(),
        provider: ProviderKind::GitHub,
        target_id: "octo/widgets#feature-x".to_string(),
        title: Some("octo/widgets#feature-x".to_string()),
        status: ChangeStatus::Pending,
        risk_score: 0.42,
        requires_approval: true,
        reasons: vec!["github_branch_delete".to_string()],
        policy_json: json!({}),
        summary_json: json!({ "operation_type": "branch_delete" }),
        metadata: json!({ "object": "branch", "isDefault": false }),
        token: Some("ghp_sample_token".to_string()),
        revert_token: None,
        created_at: now,
        expires_at: now + Duration::hours(2),
        last_edited_time: None,
        revert_window: Some(24),
        revert_expires_at: Some(now + Duration::hours(24)),
        api_key: None,
        webhook_url: None,
        human_preview: Some("⚠️ DELETE BRANCH\nTarget: octo/widgets#feature-x\n".to_string()),
        branch_head_sha: None,
        chat_message_id: None,
    }
}

#[derive(Default)]
struct MemoryInner {
    changes: HashMap<String, Change>,
    tokens: HashMap<String, ApprovalToken>,
    audit: Vec<AuditRecord>,
    api_keys: HashMap<String, ApiKeyRecord>,
    settings: HashMap<String, TenantSettings>,
    installations: HashMap<i64, InstallationRecord>,
    oauth: HashMap<String, OauthSetupSession>,
}

/// In-memory store with the same encryption-at-boundary behavior as the
/// Postgres backend.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    vault: TokenVault,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store with a fresh random vault key.
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let key_b64 = base64::engine::general_purpose::STANDARD.encode(key);
        Self::with_vault(TokenVault::new(&SecretString::new(key_b64)).expect("valid key"))
    }

    /// Creates a store over an existing vault.
    pub fn with_vault(vault: TokenVault) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            vault,
        }
    }

    /// At-rest row snapshot, with credentials still in ciphertext.
    pub fn raw_change(&self, change_id: &str) -> Option<Change> {
        self.inner.lock().changes.get(change_id).cloned()
    }

    /// Token row snapshot.
    pub fn raw_token(&self, token: &str) -> Option<ApprovalToken> {
        self.inner.lock().tokens.get(token).cloned()
    }

    /// First unspent token of a kind bound to a change, for tests that need
    /// the capability the engine issued.
    pub fn raw_token_of_kind(&self, change_id: &str, kind: ApprovalTokenKind) -> Option<String> {
        self.inner
            .lock()
            .tokens
            .values()
            .find(|t| t.change_id == change_id && t.kind == kind && !t.used)
            .map(|t| t.token.clone())
    }

    /// Inserts a preexisting legacy row verbatim (no encryption pass), for
    /// migration tests.
    pub fn insert_raw_change(&self, change: Change) {
        self.inner.lock().changes.insert(change.change_id.clone(), change);
    }

    fn encrypt_field(&self, value: &Option<String>) -> Option<String> {
        match value {
            Some(v) if !v.is_empty() && !looks_encrypted(v) => self.vault.encrypt(v).ok(),
            Some(v) if !v.is_empty() => Some(v.clone()),
            _ => None,
        }
    }

    fn decrypt_change(&self, mut change: Change) -> Change {
        change.token = change.token.and_then(|t| {
            if looks_encrypted(&t) {
                self.vault.decrypt_opt(&t)
            } else {
                Some(t)
            }
        });
        change.revert_token = change.revert_token.and_then(|t| {
            if looks_encrypted(&t) {
                self.vault.decrypt_opt(&t)
            } else {
                Some(t)
            }
        });
        change
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_change(&self, change: &Change) -> CoreResult<()> {
        let mut stored = change.clone();
        stored.token = self.encrypt_field(&change.token);
        stored.revert_token = self.encrypt_field(&change.revert_token);
        self.inner
            .lock()
            .changes
            .insert(stored.change_id.clone(), stored);
        Ok(())
    }

    async fn get_change(&self, change_id: &str) -> CoreResult<Option<Change>> {
        Ok(self
            .inner
            .lock()
            .changes
            .get(change_id)
            .cloned()
            .map(|c| self.decrypt_change(c)))
    }

    async fn get_change_by_revert_token(&self, token: &str) -> CoreResult<Option<Change>> {
        let inner = self.inner.lock();
        // Fast path: plaintext equality for legacy rows.
        if let Some(change) = inner
            .changes
            .values()
            .find(|c| c.revert_token.as_deref() == Some(token))
        {
            return Ok(Some(self.decrypt_change(change.clone())));
        }
        // Slow path: decrypt and compare in constant time.
        for change in inner.changes.values() {
            if let Some(stored) = &change.revert_token {
                if looks_encrypted(stored) {
                    if let Some(plain) = self.vault.decrypt_opt(stored) {
                        if constant_time_eq::constant_time_eq(plain.as_bytes(), token.as_bytes()) {
                            return Ok(Some(self.decrypt_change(change.clone())));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    async fn set_change_status(&self, change_id: &str, status: ChangeStatus) -> CoreResult<()> {
        if let Some(change) = self.inner.lock().changes.get_mut(change_id) {
            change.status = status;
        }
        Ok(())
    }

    async fn set_revert_token(&self, change_id: &str, token: &str) -> CoreResult<()> {
        let encrypted = self
            .vault
            .encrypt(token)
            .map_err(|e| CoreError::internal("encryption failed").with_cause(e))?;
        if let Some(change) = self.inner.lock().changes.get_mut(change_id) {
            change.revert_token = Some(encrypted);
        }
        Ok(())
    }

    async fn update_summary_json(&self, change_id: &str, summary: &Value) -> CoreResult<()> {
        if let Some(change) = self.inner.lock().changes.get_mut(change_id) {
            change.summary_json = summary.clone();
        }
        Ok(())
    }

    async fn set_change_approved(&self, change_id: &str) -> CoreResult<()> {
        if let Some(change) = self.inner.lock().changes.get_mut(change_id) {
            change.requires_approval = false;
        }
        Ok(())
    }

    async fn set_chat_message_id(&self, change_id: &str, message_id: &str) -> CoreResult<()> {
        if let Some(change) = self.inner.lock().changes.get_mut(change_id) {
            change.chat_message_id = Some(message_id.to_string());
        }
        Ok(())
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>> {
        let mut expired = Vec::new();
        for change in self.inner.lock().changes.values_mut() {
            if change.status == ChangeStatus::Pending {
                if let Some(deadline) = change.revert_expires_at {
                    if deadline < now {
                        change.status = ChangeStatus::Expired;
                        expired.push(change.change_id.clone());
                    }
                }
            }
        }
        Ok(expired)
    }

    async fn find_correlated_change(
        &self,
        query: &CorrelationQuery,
    ) -> CoreResult<Option<Change>> {
        let inner = self.inner.lock();
        let mut best: Option<&Change> = None;
        for change in inner.changes.values() {
            let summary_text = change.summary_json.to_string();
            if change.target_id.contains(&query.repo_full_name)
                && summary_text.contains("\"operation_type\"")
                && summary_text.contains(&query.operation_type)
                && change.created_at > query.since
                && query.statuses.contains(&change.status)
            {
                if best.map(|b| change.created_at > b.created_at).unwrap_or(true) {
                    best = Some(change);
                }
            }
        }
        Ok(best.cloned().map(|c| self.decrypt_change(c)))
    }

    async fn find_branch_head_sha(
        &self,
        repo_full_name: &str,
        branch: &str,
    ) -> CoreResult<Option<String>> {
        let inner = self.inner.lock();
        let mut best: Option<&Change> = None;
        for change in inner.changes.values() {
            if change.target_id == repo_full_name
                && change.summary_json.get("branch_name").and_then(Value::as_str) == Some(branch)
                && change.branch_head_sha.is_some()
            {
                if best.map(|b| change.created_at > b.created_at).unwrap_or(true) {
                    best = Some(change);
                }
            }
        }
        Ok(best.and_then(|c| c.branch_head_sha.clone()))
    }

    async fn migrate_tokens_to_encrypted(&self) -> CoreResult<u64> {
        let mut migrated = 0u64;
        for change in self.inner.lock().changes.values_mut() {
            for field in [&mut change.token, &mut change.revert_token] {
                if let Some(value) = field {
                    if !value.is_empty() && !looks_encrypted(value) {
                        if let Ok(encrypted) = self.vault.encrypt(value) {
                            *field = Some(encrypted);
                            migrated += 1;
                        }
                    }
                }
            }
        }
        Ok(migrated)
    }

    async fn create_approval_token(
        &self,
        change_id: &str,
        kind: ApprovalTokenKind,
        ttl: Duration,
    ) -> CoreResult<String> {
        let token = format!("tok_{}", Uuid::new_v4().simple());
        self.inner.lock().tokens.insert(
            token.clone(),
            ApprovalToken {
                token: token.clone(),
                change_id: change_id.to_string(),
                kind,
                expires_at: Utc::now() + ttl,
                used: false,
                used_at: None,
            },
        );
        Ok(token)
    }

    async fn insert_approval_token(
        &self,
        token: &str,
        change_id: &str,
        kind: ApprovalTokenKind,
        ttl: Duration,
    ) -> CoreResult<()> {
        self.inner.lock().tokens.insert(
            token.to_string(),
            ApprovalToken {
                token: token.to_string(),
                change_id: change_id.to_string(),
                kind,
                expires_at: Utc::now() + ttl,
                used: false,
                used_at: None,
            },
        );
        Ok(())
    }

    async fn verify_and_consume_token(&self, change_id: &str, token: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.tokens.get_mut(token) {
            Some(record)
                if !record.used
                    && record.change_id == change_id
                    && record.expires_at > Utc::now() =>
            {
                record.used = true;
                record.used_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_approval_token(&self, token: &str) -> CoreResult<Option<ApprovalToken>> {
        Ok(self.inner.lock().tokens.get(token).cloned())
    }

    async fn gc_tokens(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.tokens.len();
        inner.tokens.retain(|_, t| !t.used && t.expires_at >= now);
        Ok((before - inner.tokens.len()) as u64)
    }

    async fn insert_audit(&self, change_id: &str, event: &str, meta: &Value) -> CoreResult<()> {
        self.inner.lock().audit.push(AuditRecord {
            change_id: change_id.to_string(),
            event: event.to_string(),
            meta: meta.clone(),
            ts: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(&self, change_id: &str) -> CoreResult<Vec<AuditRecord>> {
        Ok(self
            .inner
            .lock()
            .audit
            .iter()
            .filter(|a| a.change_id == change_id)
            .cloned()
            .collect())
    }

    async fn create_api_key(&self, email: &str) -> CoreResult<ApiKeyRecord> {
        let record = ApiKeyRecord {
            api_key: generate_api_key(),
            email: email.to_string(),
            created_at: Utc::now(),
            usage_count: 0,
            is_active: true,
            installation_id: None,
        };
        self.inner
            .lock()
            .api_keys
            .insert(record.api_key.clone(), record.clone());
        Ok(record)
    }

    async fn validate_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>> {
        let mut inner = self.inner.lock();
        Ok(inner.api_keys.get_mut(api_key).and_then(|record| {
            if record.is_active {
                record.usage_count += 1;
                Some(record.clone())
            } else {
                None
            }
        }))
    }

    async fn get_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>> {
        Ok(self
            .inner
            .lock()
            .api_keys
            .get(api_key)
            .filter(|r| r.is_active)
            .cloned())
    }

    async fn link_installation(&self, api_key: &str, installation_id: i64) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.api_keys.get_mut(api_key) {
            record.installation_id = Some(installation_id);
        }
        if let Some(install) = inner.installations.get_mut(&installation_id) {
            install.api_key = Some(api_key.to_string());
        }
        Ok(())
    }

    async fn get_settings(&self, api_key: &str) -> CoreResult<Option<TenantSettings>> {
        Ok(self.inner.lock().settings.get(api_key).cloned().map(|mut s| {
            s.slack_bot_token = s.slack_bot_token.and_then(|v| {
                if looks_encrypted(&v) {
                    self.vault.decrypt_opt(&v)
                } else {
                    Some(v)
                }
            });
            s.webhook_secret = s.webhook_secret.and_then(|v| {
                if looks_encrypted(&v) {
                    self.vault.decrypt_opt(&v)
                } else {
                    Some(v)
                }
            });
            s.slack_webhook_url = s.slack_webhook_url.and_then(|v| {
                if looks_encrypted(&v) {
                    self.vault.decrypt_opt(&v)
                } else {
                    Some(v)
                }
            });
            s
        }))
    }

    async fn upsert_settings(&self, settings: &TenantSettings) -> CoreResult<()> {
        let mut stored = settings.clone();
        stored.slack_bot_token = self.encrypt_field(&settings.slack_bot_token);
        stored.webhook_secret = self.encrypt_field(&settings.webhook_secret);
        stored.slack_webhook_url = self.encrypt_field(&settings.slack_webhook_url);
        self.inner
            .lock()
            .settings
            .insert(stored.api_key.clone(), stored);
        Ok(())
    }

    async fn upsert_installation(&self, record: &InstallationRecord) -> CoreResult<()> {
        self.inner
            .lock()
            .installations
            .insert(record.installation_id, record.clone());
        Ok(())
    }

    async fn delete_installation(&self, installation_id: i64) -> CoreResult<()> {
        self.inner.lock().installations.remove(&installation_id);
        Ok(())
    }

    async fn get_installation(
        &self,
        installation_id: i64,
    ) -> CoreResult<Option<InstallationRecord>> {
        Ok(self.inner.lock().installations.get(&installation_id).cloned())
    }

    async fn find_installation_by_repo(
        &self,
        repo_full_name: &str,
    ) -> CoreResult<Option<InstallationRecord>> {
        Ok(self
            .inner
            .lock()
            .installations
            .values()
            .find(|i| i.repositories.iter().any(|r| r == repo_full_name))
            .cloned())
    }

    async fn create_oauth_session(&self, api_key: &str, ttl: Duration) -> CoreResult<String> {
        let state = Uuid::new_v4().to_string();
        self.inner.lock().oauth.insert(
            state.clone(),
            OauthSetupSession {
                state: state.clone(),
                api_key: api_key.to_string(),
                expires_at: Utc::now() + ttl,
                used: false,
                slack_connected: false,
                github_installed: false,
                installation_id: None,
            },
        );
        Ok(state)
    }

    async fn get_oauth_session(&self, state: &str) -> CoreResult<Option<OauthSetupSession>> {
        Ok(self.inner.lock().oauth.get(state).cloned())
    }

    async fn complete_slack_oauth(&self, state: &str) -> CoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        match inner.oauth.get_mut(state) {
            Some(session)
                if session.expires_at > Utc::now() && !session.slack_connected =>
            {
                session.slack_connected = true;
                session.used = session.github_installed;
                Ok(Some(session.api_key.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_github_installation(
        &self,
        state: &str,
        installation_id: i64,
    ) -> CoreResult<Option<String>> {
        let api_key = {
            let mut inner = self.inner.lock();
            match inner.oauth.get_mut(state) {
                Some(session)
                    if session.expires_at > Utc::now() && !session.github_installed =>
                {
                    session.github_installed = true;
                    session.installation_id = Some(installation_id);
                    session.used = session.slack_connected;
                    Some(session.api_key.clone())
                }
                _ => None,
            }
        };
        if let Some(api_key) = &api_key {
            self.link_installation(api_key, installation_id).await?;
        }
        Ok(api_key)
    }
}

/// Scripted provider. Metadata and mutator outcomes are configured up
/// front; every mutator call is recorded for assertions.
pub struct MockProvider {
    metadata: Mutex<Value>,
    children: Mutex<i64>,
    branch_sha: Mutex<String>,
    open_prs: Mutex<Vec<PrSummary>>,
    events_sha: Mutex<Option<String>>,
    fail_mutators: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider").finish_non_exhaustive()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Creates a provider with branch-delete defaults.
    pub fn new() -> Self {
        Self {
            metadata: Mutex::new(json!({
                "object": "branch",
                "owner": "octo",
                "repo": "widgets",
                "branch": "feature-x",
                "name": "feature-x",
                "isDefault": false,
                "default_branch": "main",
            })),
            children: Mutex::new(0),
            branch_sha: Mutex::new("feadbeef".to_string()),
            open_prs: Mutex::new(vec![
                PrSummary {
                    number: 7,
                    title: "fix".to_string(),
                    updated_at: None,
                },
                PrSummary {
                    number: 9,
                    title: "feat".to_string(),
                    updated_at: None,
                },
            ]),
            events_sha: Mutex::new(None),
            fail_mutators: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the scripted metadata.
    pub fn set_metadata(&self, metadata: Value) {
        *self.metadata.lock() = metadata;
    }

    /// Scripts the SHA returned by branch deletion.
    pub fn set_branch_sha(&self, sha: &str) {
        *self.branch_sha.lock() = sha.to_string();
    }

    /// Scripts the Events-API SHA recovery result.
    pub fn set_events_sha(&self, sha: Option<&str>) {
        *self.events_sha.lock() = sha.map(String::from);
    }

    /// Makes every subsequent mutator fail.
    pub fn fail_mutators(&self, fail: bool) {
        *self.fail_mutators.lock() = fail;
    }

    /// Recorded mutator calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) -> ProviderResult<()> {
        self.calls.lock().push(call.into());
        if *self.fail_mutators.lock() {
            Err(ProviderError::Transient("scripted failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn get_metadata(&self, _target: &TargetKind, _credential: &str) -> ProviderResult<Value> {
        Ok(self.metadata.lock().clone())
    }

    async fn get_children_count(
        &self,
        _target: &TargetKind,
        _credential: &str,
    ) -> ProviderResult<i64> {
        Ok(*self.children.lock())
    }

    async fn archive(&self, target: &TargetKind, _credential: &str) -> ProviderResult<()> {
        self.record(format!("archive:{target}"))
    }

    async fn unarchive(&self, target: &TargetKind, _credential: &str) -> ProviderResult<()> {
        self.record(format!("unarchive:{target}"))
    }

    async fn delete_branch(&self, target: &TargetKind, _credential: &str) -> ProviderResult<String> {
        self.record(format!("delete_branch:{target}"))?;
        Ok(self.branch_sha.lock().clone())
    }

    async fn restore_branch(
        &self,
        target: &TargetKind,
        _credential: &str,
        sha: &str,
    ) -> ProviderResult<()> {
        self.record(format!("restore_branch:{target}:{sha}"))
    }

    async fn list_open_prs(
        &self,
        _target: &TargetKind,
        _credential: &str,
    ) -> ProviderResult<Vec<PrSummary>> {
        Ok(self.open_prs.lock().clone())
    }

    async fn bulk_close_prs(
        &self,
        target: &TargetKind,
        _credential: &str,
        pr_numbers: Option<Vec<u64>>,
    ) -> ProviderResult<Vec<u64>> {
        self.record(format!("bulk_close:{target}"))?;
        Ok(pr_numbers
            .unwrap_or_else(|| self.open_prs.lock().iter().map(|p| p.number).collect()))
    }

    async fn bulk_reopen(
        &self,
        target: &TargetKind,
        _credential: &str,
        pr_numbers: &[u64],
    ) -> ProviderResult<()> {
        self.record(format!("bulk_reopen:{target}:{pr_numbers:?}"))
    }

    async fn force_push(
        &self,
        target: &TargetKind,
        _credential: &str,
        new_sha: &str,
    ) -> ProviderResult<ForcePushOutcome> {
        self.record(format!("force_push:{target}:{new_sha}"))?;
        Ok(ForcePushOutcome {
            previous_sha: "prev-sha".to_string(),
            new_sha: new_sha.to_string(),
        })
    }

    async fn merge(
        &self,
        target: &TargetKind,
        _credential: &str,
        _commit_message: Option<&str>,
    ) -> ProviderResult<MergeOutcome> {
        self.record(format!("merge:{target}"))?;
        Ok(MergeOutcome {
            merge_sha: Some("merge-sha".to_string()),
            target_is_default: self
                .metadata
                .lock()
                .get("isTargetDefault")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn delete_repository(
        &self,
        target: &TargetKind,
        _credential: &str,
    ) -> ProviderResult<()> {
        self.record(format!("delete_repository:{target}"))
    }

    async fn revert_force_push(
        &self,
        target: &TargetKind,
        _credential: &str,
        before_sha: &str,
    ) -> ProviderResult<()> {
        self.record(format!("revert_force_push:{target}:{before_sha}"))
    }

    async fn create_counter_commit(
        &self,
        target: &TargetKind,
        _credential: &str,
        merge_commit_sha: &str,
    ) -> ProviderResult<()> {
        self.record(format!("create_counter_commit:{target}:{merge_commit_sha}"))
    }

    async fn delete_secret(
        &self,
        target: &TargetKind,
        _credential: &str,
        secret_name: &str,
    ) -> ProviderResult<()> {
        self.record(format!("delete_secret:{target}:{secret_name}"))
    }

    async fn set_visibility(
        &self,
        target: &TargetKind,
        _credential: &str,
        private: bool,
    ) -> ProviderResult<()> {
        self.record(format!("set_visibility:{target}:{private}"))
    }

    async fn put_branch_protection(
        &self,
        target: &TargetKind,
        _credential: &str,
        branch: &str,
        _protection: &Value,
    ) -> ProviderResult<()> {
        self.record(format!("put_branch_protection:{target}:{branch}"))
    }

    async fn put_workflow_file(
        &self,
        target: &TargetKind,
        _credential: &str,
        path: &str,
        _content_b64: &str,
        _message: &str,
        _prior_sha: Option<&str>,
    ) -> ProviderResult<()> {
        self.record(format!("put_workflow_file:{target}:{path}"))
    }

    async fn find_deleted_branch_sha(
        &self,
        _target: &TargetKind,
        _credential: &str,
        _branch: &str,
    ) -> ProviderResult<Option<String>> {
        Ok(self.events_sha.lock().clone())
    }
}

/// Capturing notification channel.
pub struct CaptureChannel {
    name: &'static str,
    fail: bool,
    delivered: Mutex<Vec<Notification>>,
}

impl std::fmt::Debug for CaptureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureChannel").field("name", &self.name).finish()
    }
}

impl CaptureChannel {
    /// Creates a channel that records every delivery.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail: false,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Creates a channel that fails every delivery.
    pub fn failing(name: &'static str) -> Self {
        Self {
            name,
            fail: true,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Captured notifications.
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for CaptureChannel {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>> {
        if self.fail {
            return Err(CoreError::bad_gateway("scripted channel failure"));
        }
        self.delivered.lock().push(notification.clone());
        Ok(None)
    }
}
