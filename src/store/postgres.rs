//! PostgreSQL store backend.
//!
//! Schema is auto-migrated on startup and tolerates legacy deployments
//! (`page_id`, missing `target_id`) by adding and backfilling columns.
//! Credential encryption happens here, at the boundary, so callers only
//! ever handle plaintext in process memory.

use super::{CorrelationQuery, Store};
use crate::crypto::{looks_encrypted, TokenVault};
use crate::errors::{CoreError, CoreResult};
use crate::tenants::generate_api_key;
use crate::types::{
    ApiKeyRecord, ApprovalToken, ApprovalTokenKind, AuditRecord, Change, ChangeStatus,
    InstallationRecord, OauthSetupSession, ProviderKind, TenantSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use tracing::warn;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS changes(
    change_id TEXT PRIMARY KEY,
    target_id TEXT,
    provider TEXT,
    title TEXT,
    status TEXT,
    risk_score DOUBLE PRECISION DEFAULT 0,
    requires_approval BOOLEAN DEFAULT FALSE,
    reasons TEXT DEFAULT '[]',
    policy_json TEXT DEFAULT '{}',
    summary_json TEXT DEFAULT '{}',
    metadata TEXT DEFAULT '{}',
    token TEXT,
    revert_token TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ,
    last_edited_time TIMESTAMPTZ,
    revert_window BIGINT,
    revert_expires_at TIMESTAMPTZ,
    api_key TEXT,
    webhook_url TEXT,
    human_preview TEXT,
    branch_head_sha TEXT,
    chat_message_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_changes_api_key ON changes(api_key);
CREATE INDEX IF NOT EXISTS idx_changes_status ON changes(status);
CREATE INDEX IF NOT EXISTS idx_changes_target ON changes(target_id);

CREATE TABLE IF NOT EXISTS audit(
    id BIGSERIAL PRIMARY KEY,
    change_id TEXT,
    event TEXT,
    meta_json TEXT,
    ts TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS approval_tokens(
    token TEXT PRIMARY KEY,
    change_id TEXT NOT NULL REFERENCES changes(change_id) ON DELETE CASCADE,
    kind TEXT NOT NULL DEFAULT 'approve',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL,
    used BOOLEAN DEFAULT FALSE,
    used_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_approval_tokens_change_id ON approval_tokens(change_id);

CREATE TABLE IF NOT EXISTS api_keys(
    api_key TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    usage_count BIGINT DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    is_active BOOLEAN DEFAULT TRUE,
    github_installation_id BIGINT
);

CREATE TABLE IF NOT EXISTS notification_settings(
    api_key TEXT PRIMARY KEY REFERENCES api_keys(api_key) ON DELETE CASCADE,
    slack_webhook_url TEXT,
    slack_bot_token TEXT,
    slack_channel TEXT,
    slack_enabled BOOLEAN DEFAULT FALSE,
    email TEXT,
    email_enabled BOOLEAN DEFAULT TRUE,
    webhook_url TEXT,
    webhook_secret TEXT,
    webhook_enabled BOOLEAN DEFAULT FALSE,
    notification_channels TEXT DEFAULT '["email"]',
    protected_branches TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS github_installations(
    installation_id BIGINT PRIMARY KEY,
    account_login TEXT,
    api_key TEXT REFERENCES api_keys(api_key) ON DELETE SET NULL,
    installed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    repositories_json TEXT DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS oauth_states(
    state TEXT PRIMARY KEY,
    api_key TEXT NOT NULL REFERENCES api_keys(api_key) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL,
    used BOOLEAN DEFAULT FALSE,
    is_slack_connected BOOLEAN DEFAULT FALSE,
    is_github_installed BOOLEAN DEFAULT FALSE,
    github_installation_id BIGINT
);

CREATE INDEX IF NOT EXISTS idx_oauth_states_expires ON oauth_states(expires_at);
"#;

/// Legacy-deployment migrations: add columns older schemas are missing and
/// backfill `target_id` from the deprecated `page_id`.
const LEGACY_MIGRATIONS: &str = r#"
DO $$
BEGIN
    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'target_id'
    ) THEN
        ALTER TABLE changes ADD COLUMN target_id TEXT;
    END IF;

    IF EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'page_id'
    ) THEN
        UPDATE changes SET target_id = COALESCE(target_id, page_id);
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'metadata'
    ) THEN
        ALTER TABLE changes ADD COLUMN metadata TEXT DEFAULT '{}';
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'revert_window'
    ) THEN
        ALTER TABLE changes ADD COLUMN revert_window BIGINT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'revert_expires_at'
    ) THEN
        ALTER TABLE changes ADD COLUMN revert_expires_at TIMESTAMPTZ;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'changes' AND column_name = 'chat_message_id'
    ) THEN
        ALTER TABLE changes ADD COLUMN chat_message_id TEXT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'api_keys' AND column_name = 'github_installation_id'
    ) THEN
        ALTER TABLE api_keys ADD COLUMN github_installation_id BIGINT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE table_name = 'notification_settings' AND column_name = 'protected_branches'
    ) THEN
        ALTER TABLE notification_settings ADD COLUMN protected_branches TEXT;
    END IF;
END $$;
"#;

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: Pool,
    vault: TokenVault,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

fn db_err(e: impl std::error::Error + Send + Sync + 'static) -> CoreError {
    CoreError::internal("database operation failed").with_cause(e)
}

fn json_to_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn text_to_json(text: Option<String>) -> Value {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

impl PostgresStore {
    /// Connects to the database, runs migrations, and returns the store.
    pub async fn connect(database_url: &str, vault: TokenVault) -> CoreResult<Self> {
        let parsed = url::Url::parse(database_url)
            .map_err(|_| CoreError::bad_request("DATABASE_URL is not a valid URL"))?;

        let mut cfg = Config::new();
        cfg.host = Some(parsed.host_str().unwrap_or("localhost").to_string());
        cfg.port = Some(parsed.port().unwrap_or(5432));
        cfg.user = Some(parsed.username().to_string());
        cfg.password = Some(parsed.password().unwrap_or("").to_string());
        cfg.dbname = Some(parsed.path().trim_start_matches('/').to_string());

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(db_err)?;

        let store = Self { pool, vault };
        store.migrate().await?;
        Ok(store)
    }

    async fn client(&self) -> CoreResult<deadpool_postgres::Client> {
        self.pool.get().await.map_err(db_err)
    }

    async fn migrate(&self) -> CoreResult<()> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await.map_err(db_err)?;
        client.batch_execute(LEGACY_MIGRATIONS).await.map_err(db_err)?;
        Ok(())
    }

    fn encrypt_field(&self, value: &Option<String>) -> CoreResult<Option<String>> {
        match value {
            Some(v) if !v.is_empty() => {
                if looks_encrypted(v) {
                    // Already ciphertext (idempotent re-save).
                    Ok(Some(v.clone()))
                } else {
                    Ok(Some(self.vault.encrypt(v).map_err(db_err)?))
                }
            }
            _ => Ok(None),
        }
    }

    fn decrypt_field(&self, value: Option<String>) -> Option<String> {
        match value {
            Some(v) if looks_encrypted(&v) => self.vault.decrypt_opt(&v),
            other => other,
        }
    }

    fn row_to_change(&self, row: &Row) -> Change {
        let provider: String = row.get("provider");
        let status: String = row.get("status");
        let reasons: Value = text_to_json(row.get("reasons"));

        Change {
            change_id: row.get("change_id"),
            provider: provider.parse().unwrap_or(ProviderKind::GitHub),
            target_id: row.get::<_, Option<String>>("target_id").unwrap_or_default(),
            title: row.get("title"),
            status: status.parse().unwrap_or(ChangeStatus::Pending),
            risk_score: row.get::<_, Option<f64>>("risk_score").unwrap_or(0.0),
            requires_approval: row
                .get::<_, Option<bool>>("requires_approval")
                .unwrap_or(false),
            reasons: reasons
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            policy_json: text_to_json(row.get("policy_json")),
            summary_json: text_to_json(row.get("summary_json")),
            metadata: text_to_json(row.get("metadata")),
            token: self.decrypt_field(row.get("token")),
            revert_token: self.decrypt_field(row.get("revert_token")),
            created_at: row.get("created_at"),
            expires_at: row
                .get::<_, Option<DateTime<Utc>>>("expires_at")
                .unwrap_or_else(Utc::now),
            last_edited_time: row.get("last_edited_time"),
            revert_window: row.get("revert_window"),
            revert_expires_at: row.get("revert_expires_at"),
            api_key: row.get("api_key"),
            webhook_url: row.get("webhook_url"),
            human_preview: row.get("human_preview"),
            branch_head_sha: row.get("branch_head_sha"),
            chat_message_id: row.get("chat_message_id"),
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_change(&self, change: &Change) -> CoreResult<()> {
        let token = self.encrypt_field(&change.token)?;
        let revert_token = self.encrypt_field(&change.revert_token)?;
        let reasons = json_to_text(&Value::Array(
            change.reasons.iter().map(|r| Value::String(r.clone())).collect(),
        ));
        let policy_json = json_to_text(&change.policy_json);
        let summary_json = json_to_text(&change.summary_json);
        let metadata = json_to_text(&change.metadata);

        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO changes(
                    change_id, target_id, provider, title, status, risk_score,
                    requires_approval, reasons, policy_json, summary_json, metadata,
                    token, revert_token, created_at, expires_at, last_edited_time,
                    revert_window, revert_expires_at, api_key, webhook_url,
                    human_preview, branch_head_sha, chat_message_id
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)
                ON CONFLICT(change_id) DO UPDATE SET
                    target_id = EXCLUDED.target_id,
                    provider = EXCLUDED.provider,
                    title = EXCLUDED.title,
                    status = EXCLUDED.status,
                    risk_score = EXCLUDED.risk_score,
                    requires_approval = EXCLUDED.requires_approval,
                    reasons = EXCLUDED.reasons,
                    policy_json = EXCLUDED.policy_json,
                    summary_json = EXCLUDED.summary_json,
                    metadata = EXCLUDED.metadata,
                    token = EXCLUDED.token,
                    revert_token = EXCLUDED.revert_token,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at,
                    last_edited_time = EXCLUDED.last_edited_time,
                    revert_window = EXCLUDED.revert_window,
                    revert_expires_at = EXCLUDED.revert_expires_at,
                    api_key = EXCLUDED.api_key,
                    webhook_url = EXCLUDED.webhook_url,
                    human_preview = EXCLUDED.human_preview,
                    branch_head_sha = EXCLUDED.branch_head_sha,
                    chat_message_id = EXCLUDED.chat_message_id
                "#,
                &[
                    &change.change_id,
                    &change.target_id,
                    &change.provider.to_string(),
                    &change.title,
                    &change.status.as_str(),
                    &change.risk_score,
                    &change.requires_approval,
                    &reasons,
                    &policy_json,
                    &summary_json,
                    &metadata,
                    &token,
                    &revert_token,
                    &change.created_at,
                    &change.expires_at,
                    &change.last_edited_time,
                    &change.revert_window,
                    &change.revert_expires_at,
                    &change.api_key,
                    &change.webhook_url,
                    &change.human_preview,
                    &change.branch_head_sha,
                    &change.chat_message_id,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_change(&self, change_id: &str) -> CoreResult<Option<Change>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM changes WHERE change_id = $1", &[&change_id])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| self.row_to_change(&r)))
    }

    async fn get_change_by_revert_token(&self, token: &str) -> CoreResult<Option<Change>> {
        let client = self.client().await?;

        // Fast path: legacy plaintext rows match directly.
        if let Some(row) = client
            .query_opt("SELECT * FROM changes WHERE revert_token = $1", &[&token])
            .await
            .map_err(db_err)?
        {
            return Ok(Some(self.row_to_change(&row)));
        }

        // Slow path: decrypt-and-compare over rows with a revert token.
        // O(n) until the encryption migration has drained the population.
        let rows = client
            .query(
                "SELECT * FROM changes WHERE revert_token IS NOT NULL",
                &[],
            )
            .await
            .map_err(db_err)?;
        for row in rows {
            let stored: Option<String> = row.get("revert_token");
            if let Some(stored) = stored {
                if looks_encrypted(&stored) {
                    if let Some(plain) = self.vault.decrypt_opt(&stored) {
                        if constant_time_eq::constant_time_eq(plain.as_bytes(), token.as_bytes()) {
                            return Ok(Some(self.row_to_change(&row)));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    async fn set_change_status(&self, change_id: &str, status: ChangeStatus) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE changes SET status = $1 WHERE change_id = $2",
                &[&status.as_str(), &change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_revert_token(&self, change_id: &str, token: &str) -> CoreResult<()> {
        let encrypted = self.vault.encrypt(token).map_err(db_err)?;
        let client = self.client().await?;
        client
            .execute(
                "UPDATE changes SET revert_token = $1 WHERE change_id = $2",
                &[&encrypted, &change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_summary_json(&self, change_id: &str, summary: &Value) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE changes SET summary_json = $1 WHERE change_id = $2",
                &[&json_to_text(summary), &change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_change_approved(&self, change_id: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE changes SET requires_approval = FALSE WHERE change_id = $1",
                &[&change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_chat_message_id(&self, change_id: &str, message_id: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE changes SET chat_message_id = $1 WHERE change_id = $2",
                &[&message_id, &change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                UPDATE changes SET status = 'expired'
                WHERE status = 'pending'
                  AND revert_expires_at IS NOT NULL
                  AND revert_expires_at < $1
                RETURNING change_id
                "#,
                &[&now],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get("change_id")).collect())
    }

    async fn find_correlated_change(
        &self,
        query: &CorrelationQuery,
    ) -> CoreResult<Option<Change>> {
        let client = self.client().await?;
        let target_pattern = format!("%{}%", query.repo_full_name);
        let op_pattern = format!("%{}%", query.operation_type);
        let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();

        let row = client
            .query_opt(
                r#"
                SELECT * FROM changes
                WHERE target_id LIKE $1
                  AND summary_json LIKE '%"operation_type"%'
                  AND summary_json LIKE $2
                  AND created_at > $3
                  AND status = ANY($4)
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                &[&target_pattern, &op_pattern, &query.since, &statuses],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| self.row_to_change(&r)))
    }

    async fn find_branch_head_sha(
        &self,
        repo_full_name: &str,
        branch: &str,
    ) -> CoreResult<Option<String>> {
        let client = self.client().await?;
        let branch_pattern = format!("%\"branch_name\":\"{branch}\"%");
        let row = client
            .query_opt(
                r#"
                SELECT branch_head_sha FROM changes
                WHERE target_id = $1
                  AND summary_json LIKE $2
                  AND branch_head_sha IS NOT NULL
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                &[&repo_full_name, &branch_pattern],
            )
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| r.get("branch_head_sha")))
    }

    async fn migrate_tokens_to_encrypted(&self) -> CoreResult<u64> {
        let client = self.client().await?;
        let mut migrated = 0u64;

        for column in ["token", "revert_token"] {
            let select = format!(
                "SELECT change_id, {column} FROM changes WHERE {column} IS NOT NULL AND {column} != ''"
            );
            let update = format!("UPDATE changes SET {column} = $1 WHERE change_id = $2");
            let rows = client.query(select.as_str(), &[]).await.map_err(db_err)?;
            for row in rows {
                let change_id: String = row.get("change_id");
                let value: String = row.get(column);
                if looks_encrypted(&value) {
                    continue;
                }
                match self.vault.encrypt(&value) {
                    Ok(encrypted) => {
                        client
                            .execute(update.as_str(), &[&encrypted, &change_id])
                            .await
                            .map_err(db_err)?;
                        migrated += 1;
                    }
                    Err(e) => warn!(change_id, column, error = %e, "token migration skipped row"),
                }
            }
        }

        for column in ["slack_webhook_url", "slack_bot_token", "webhook_secret"] {
            let select = format!(
                "SELECT api_key, {column} FROM notification_settings WHERE {column} IS NOT NULL AND {column} != ''"
            );
            let update =
                format!("UPDATE notification_settings SET {column} = $1 WHERE api_key = $2");
            let rows = client.query(select.as_str(), &[]).await.map_err(db_err)?;
            for row in rows {
                let api_key: String = row.get("api_key");
                let value: String = row.get(column);
                if looks_encrypted(&value) {
                    continue;
                }
                match self.vault.encrypt(&value) {
                    Ok(encrypted) => {
                        client
                            .execute(update.as_str(), &[&encrypted, &api_key])
                            .await
                            .map_err(db_err)?;
                        migrated += 1;
                    }
                    Err(e) => warn!(column, error = %e, "settings migration skipped row"),
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
        let expires_at = Utc::now() + ttl;
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO approval_tokens(token, change_id, kind, expires_at) VALUES ($1, $2, $3, $4)",
                &[&token, &change_id, &kind.as_str(), &expires_at],
            )
            .await
            .map_err(db_err)?;
        Ok(token)
    }

    async fn insert_approval_token(
        &self,
        token: &str,
        change_id: &str,
        kind: ApprovalTokenKind,
        ttl: Duration,
    ) -> CoreResult<()> {
        let expires_at = Utc::now() + ttl;
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO approval_tokens(token, change_id, kind, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT(token) DO UPDATE SET
                    change_id = EXCLUDED.change_id,
                    kind = EXCLUDED.kind,
                    expires_at = EXCLUDED.expires_at
                "#,
                &[&token, &change_id, &kind.as_str(), &expires_at],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn verify_and_consume_token(&self, change_id: &str, token: &str) -> CoreResult<bool> {
        // Read-and-flip in one statement: exactly one concurrent caller
        // observes an affected row.
        let client = self.client().await?;
        let affected = client
            .execute(
                r#"
                UPDATE approval_tokens
                SET used = TRUE, used_at = NOW()
                WHERE token = $1 AND change_id = $2 AND used = FALSE AND expires_at > NOW()
                "#,
                &[&token, &change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    async fn get_approval_token(&self, token: &str) -> CoreResult<Option<ApprovalToken>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM approval_tokens WHERE token = $1", &[&token])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| {
            let kind: String = r.get("kind");
            ApprovalToken {
                token: r.get("token"),
                change_id: r.get("change_id"),
                kind: kind.parse().unwrap_or(ApprovalTokenKind::Approve),
                expires_at: r.get("expires_at"),
                used: r.get::<_, Option<bool>>("used").unwrap_or(false),
                used_at: r.get("used_at"),
            }
        }))
    }

    async fn gc_tokens(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM approval_tokens WHERE used = TRUE OR expires_at < $1",
                &[&now],
            )
            .await
            .map_err(db_err)
    }

    async fn insert_audit(&self, change_id: &str, event: &str, meta: &Value) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO audit(change_id, event, meta_json, ts) VALUES ($1, $2, $3, $4)",
                &[&change_id, &event, &json_to_text(meta), &Utc::now()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_audit(&self, change_id: &str) -> CoreResult<Vec<AuditRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT change_id, event, meta_json, ts FROM audit WHERE change_id = $1 ORDER BY id",
                &[&change_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| AuditRecord {
                change_id: r.get("change_id"),
                event: r.get("event"),
                meta: text_to_json(r.get("meta_json")),
                ts: r.get("ts"),
            })
            .collect())
    }

    async fn create_api_key(&self, email: &str) -> CoreResult<ApiKeyRecord> {
        let api_key = generate_api_key();
        let created_at = Utc::now();
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO api_keys(api_key, email, created_at) VALUES ($1, $2, $3)",
                &[&api_key, &email, &created_at],
            )
            .await
            .map_err(db_err)?;
        Ok(ApiKeyRecord {
            api_key,
            email: email.to_string(),
            created_at,
            usage_count: 0,
            is_active: true,
            installation_id: None,
        })
    }

    async fn validate_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                r#"
                UPDATE api_keys SET usage_count = usage_count + 1
                WHERE api_key = $1 AND is_active = TRUE
                RETURNING api_key, email, created_at, usage_count, is_active, github_installation_id
                "#,
                &[&api_key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(row_to_api_key))
    }

    async fn get_api_key(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT api_key, email, created_at, usage_count, is_active, github_installation_id FROM api_keys WHERE api_key = $1 AND is_active = TRUE",
                &[&api_key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(row_to_api_key))
    }

    async fn link_installation(&self, api_key: &str, installation_id: i64) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE api_keys SET github_installation_id = $1 WHERE api_key = $2",
                &[&installation_id, &api_key],
            )
            .await
            .map_err(db_err)?;
        client
            .execute(
                "UPDATE github_installations SET api_key = $1 WHERE installation_id = $2",
                &[&api_key, &installation_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_settings(&self, api_key: &str) -> CoreResult<Option<TenantSettings>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM notification_settings WHERE api_key = $1",
                &[&api_key],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| TenantSettings {
            api_key: r.get("api_key"),
            slack_webhook_url: self.decrypt_field(r.get("slack_webhook_url")),
            slack_bot_token: self.decrypt_field(r.get("slack_bot_token")),
            slack_channel: r.get("slack_channel"),
            slack_enabled: r.get::<_, Option<bool>>("slack_enabled").unwrap_or(false),
            email: r.get("email"),
            email_enabled: r.get::<_, Option<bool>>("email_enabled").unwrap_or(true),
            webhook_url: r.get("webhook_url"),
            webhook_secret: self.decrypt_field(r.get("webhook_secret")),
            webhook_enabled: r.get::<_, Option<bool>>("webhook_enabled").unwrap_or(false),
            notification_channels: text_to_json(r.get("notification_channels"))
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            protected_branches: r.get("protected_branches"),
        }))
    }

    async fn upsert_settings(&self, settings: &TenantSettings) -> CoreResult<()> {
        let slack_webhook_url = self.encrypt_field(&settings.slack_webhook_url)?;
        let slack_bot_token = self.encrypt_field(&settings.slack_bot_token)?;
        let webhook_secret = self.encrypt_field(&settings.webhook_secret)?;
        let channels = json_to_text(&Value::Array(
            settings
                .notification_channels
                .iter()
                .map(|c| Value::String(c.clone()))
                .collect(),
        ));

        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO notification_settings(
                    api_key, slack_webhook_url, slack_bot_token, slack_channel, slack_enabled,
                    email, email_enabled, webhook_url, webhook_secret, webhook_enabled,
                    notification_channels, protected_branches, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,NOW())
                ON CONFLICT(api_key) DO UPDATE SET
                    slack_webhook_url = EXCLUDED.slack_webhook_url,
                    slack_bot_token = EXCLUDED.slack_bot_token,
                    slack_channel = EXCLUDED.slack_channel,
                    slack_enabled = EXCLUDED.slack_enabled,
                    email = EXCLUDED.email,
                    email_enabled = EXCLUDED.email_enabled,
                    webhook_url = EXCLUDED.webhook_url,
                    webhook_secret = EXCLUDED.webhook_secret,
                    webhook_enabled = EXCLUDED.webhook_enabled,
                    notification_channels = EXCLUDED.notification_channels,
                    protected_branches = EXCLUDED.protected_branches,
                    updated_at = NOW()
                "#,
                &[
                    &settings.api_key,
                    &slack_webhook_url,
                    &slack_bot_token,
                    &settings.slack_channel,
                    &settings.slack_enabled,
                    &settings.email,
                    &settings.email_enabled,
                    &settings.webhook_url,
                    &webhook_secret,
                    &settings.webhook_enabled,
                    &channels,
                    &settings.protected_branches,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_installation(&self, record: &InstallationRecord) -> CoreResult<()> {
        let repositories = json_to_text(&Value::Array(
            record
                .repositories
                .iter()
                .map(|r| Value::String(r.clone()))
                .collect(),
        ));
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO github_installations(installation_id, account_login, api_key, installed_at, repositories_json)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT(installation_id) DO UPDATE SET
                    account_login = EXCLUDED.account_login,
                    repositories_json = EXCLUDED.repositories_json
                "#,
                &[
                    &record.installation_id,
                    &record.account_login,
                    &record.api_key,
                    &record.installed_at,
                    &repositories,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_installation(&self, installation_id: i64) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM github_installations WHERE installation_id = $1",
                &[&installation_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_installation(
        &self,
        installation_id: i64,
    ) -> CoreResult<Option<InstallationRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM github_installations WHERE installation_id = $1",
                &[&installation_id],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(row_to_installation))
    }

    async fn find_installation_by_repo(
        &self,
        repo_full_name: &str,
    ) -> CoreResult<Option<InstallationRecord>> {
        let client = self.client().await?;
        let pattern = format!("%\"{repo_full_name}\"%");
        let row = client
            .query_opt(
                "SELECT * FROM github_installations WHERE repositories_json LIKE $1 LIMIT 1",
                &[&pattern],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(row_to_installation))
    }

    async fn create_oauth_session(&self, api_key: &str, ttl: Duration) -> CoreResult<String> {
        let state = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + ttl;
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO oauth_states(state, api_key, expires_at) VALUES ($1, $2, $3)",
                &[&state, &api_key, &expires_at],
            )
            .await
            .map_err(db_err)?;
        Ok(state)
    }

    async fn get_oauth_session(&self, state: &str) -> CoreResult<Option<OauthSetupSession>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM oauth_states WHERE state = $1", &[&state])
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| OauthSetupSession {
            state: r.get("state"),
            api_key: r.get("api_key"),
            expires_at: r.get("expires_at"),
            used: r.get::<_, Option<bool>>("used").unwrap_or(false),
            slack_connected: r
                .get::<_, Option<bool>>("is_slack_connected")
                .unwrap_or(false),
            github_installed: r
                .get::<_, Option<bool>>("is_github_installed")
                .unwrap_or(false),
            installation_id: r.get("github_installation_id"),
        }))
    }

    async fn complete_slack_oauth(&self, state: &str) -> CoreResult<Option<String>> {
        // Conditional flip guards against two callbacks racing on one state.
        let client = self.client().await?;
        let row = client
            .query_opt(
                r#"
                UPDATE oauth_states
                SET is_slack_connected = TRUE, used = is_github_installed
                WHERE state = $1 AND expires_at > NOW() AND is_slack_connected = FALSE
                RETURNING api_key
                "#,
                &[&state],
            )
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("api_key")))
    }

    async fn complete_github_installation(
        &self,
        state: &str,
        installation_id: i64,
    ) -> CoreResult<Option<String>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                r#"
                UPDATE oauth_states
                SET is_github_installed = TRUE, github_installation_id = $2, used = is_slack_connected
                WHERE state = $1 AND expires_at > NOW() AND is_github_installed = FALSE
                RETURNING api_key
                "#,
                &[&state, &installation_id],
            )
            .await
            .map_err(db_err)?;

        if let Some(row) = &row {
            let api_key: String = row.get("api_key");
            self.link_installation(&api_key, installation_id).await?;
        }
        Ok(row.map(|r| r.get("api_key")))
    }
}

fn row_to_api_key(row: Row) -> ApiKeyRecord {
    ApiKeyRecord {
        api_key: row.get("api_key"),
        email: row.get("email"),
        created_at: row.get("created_at"),
        usage_count: row.get::<_, Option<i64>>("usage_count").unwrap_or(0),
        is_active: row.get::<_, Option<bool>>("is_active").unwrap_or(true),
        installation_id: row.get("github_installation_id"),
    }
}

fn row_to_installation(row: Row) -> InstallationRecord {
    InstallationRecord {
        installation_id: row.get("installation_id"),
        account_login: row
            .get::<_, Option<String>>("account_login")
            .unwrap_or_default(),
        repositories: text_to_json(row.get("repositories_json"))
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        api_key: row.get("api_key"),
        installed_at: row.get("installed_at"),
    }
}
