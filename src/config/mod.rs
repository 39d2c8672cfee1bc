//! Configuration for the SafeRun core.
//!
//! All knobs are sourced from environment variables at boot and passed down
//! from the composition root; nothing in the crate reads the environment
//! after construction.

use crate::errors::{CoreError, CoreResult};
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::time::Duration;

/// Default GitHub API base URL.
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

/// Default upstream request timeout.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Default per-attempt notifier timeout.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default rate-limit window.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

/// Default rate-limit ceiling per window.
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 1000;

/// Default approval deadline for pending changes.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(2 * 3600);

/// Default revert window in hours.
pub const DEFAULT_REVERT_WINDOW_HOURS: i64 = 24;

/// Default expiry-sweep period.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Bot logins whose webhook events are dropped to break revert loops.
pub const DEFAULT_BOT_LOGINS: &[&str] = &["saferun-ai[bot]", "SafeRun-AI[bot]"];

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// PostgreSQL via the shared connection pool.
    Postgres,
    /// In-process store (tests and local development).
    Memory,
}

impl StorageBackend {
    fn parse(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(CoreError::bad_request(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

/// GitHub App credentials for webhook ingress and installation tokens.
#[derive(Clone)]
pub struct GitHubAppConfig {
    /// App ID (JWT issuer).
    pub app_id: String,
    /// Private key in PEM format.
    pub private_key: SecretString,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: SecretString,
}

impl std::fmt::Debug for GitHubAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppConfig")
            .field("app_id", &self.app_id)
            .field("private_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// SMTP settings for the optional email channel.
#[derive(Clone)]
pub struct SmtpConfig {
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: SecretString,
    /// From address.
    pub from_address: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// Top-level configuration for the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// 32-byte AEAD key, base64-encoded. Boot fails if absent or wrong length.
    pub encryption_key: SecretString,
    /// Database connection string.
    pub database_url: Option<String>,
    /// Storage backend selector.
    pub storage_backend: StorageBackend,
    /// Base URL for approve links shown to humans.
    pub app_base_url: String,
    /// Base URL for API endpoints (revert links).
    pub api_base_url: String,
    /// GitHub API base (overridable for tests).
    pub github_api_base: String,
    /// Upstream request timeout.
    pub provider_timeout: Duration,
    /// Per-attempt notifier timeout.
    pub notify_timeout: Duration,
    /// Rate-limit window.
    pub rate_limit_window: Duration,
    /// Rate-limit ceiling per window.
    pub rate_limit_max: u32,
    /// GitHub App credentials (webhook ingress disabled without them).
    pub github_app: Option<GitHubAppConfig>,
    /// Slack request signing secret for chat callbacks.
    pub slack_signing_secret: Option<SecretString>,
    /// Admin API keys allowed to bypass the approval flag on apply.
    pub admin_api_keys: Vec<String>,
    /// SMTP settings for the optional email channel.
    pub smtp: Option<SmtpConfig>,
    /// Default policy rule set as a JSON blob.
    pub default_policy_json: Option<String>,
    /// Bot logins filtered out of webhook ingress.
    pub bot_logins: Vec<String>,
}

impl CoreConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Loads configuration from the environment.
    ///
    /// Honored keys: `SR_ENCRYPTION_KEY`, `DATABASE_URL`,
    /// `SR_STORAGE_BACKEND`, `APP_BASE_URL`, `API_BASE_URL`,
    /// `SR_GITHUB_API_BASE`, `SR_RATE_LIMIT_WINDOW_SECS`, `SR_RATE_LIMIT_MAX`,
    /// `GITHUB_APP_ID`, `GITHUB_PRIVATE_KEY`, `GITHUB_WEBHOOK_SECRET`,
    /// `SLACK_SIGNING_SECRET`, `SR_ADMIN_API_KEYS`, `SMTP_HOST`, `SMTP_PORT`,
    /// `SMTP_USERNAME`, `SMTP_PASSWORD`, `SMTP_FROM`, `DEFAULT_POLICY_JSON`,
    /// `SR_BOT_LOGINS`.
    pub fn from_env() -> CoreResult<Self> {
        let mut builder = Self::builder();

        if let Ok(key) = env::var("SR_ENCRYPTION_KEY") {
            builder = builder.encryption_key(key);
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            builder = builder.database_url(url);
        }
        if let Ok(backend) = env::var("SR_STORAGE_BACKEND") {
            builder = builder.storage_backend(StorageBackend::parse(&backend)?);
        }
        if let Ok(url) = env::var("APP_BASE_URL") {
            builder = builder.app_base_url(url);
        }
        if let Ok(url) = env::var("API_BASE_URL") {
            builder = builder.api_base_url(url);
        }
        if let Ok(url) = env::var("SR_GITHUB_API_BASE") {
            builder = builder.github_api_base(url);
        }
        if let Ok(secs) = env::var("SR_RATE_LIMIT_WINDOW_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| CoreError::bad_request("SR_RATE_LIMIT_WINDOW_SECS must be an integer"))?;
            builder = builder.rate_limit_window(Duration::from_secs(secs));
        }
        if let Ok(max) = env::var("SR_RATE_LIMIT_MAX") {
            let max: u32 = max
                .parse()
                .map_err(|_| CoreError::bad_request("SR_RATE_LIMIT_MAX must be an integer"))?;
            builder = builder.rate_limit_max(max);
        }
        if let (Ok(app_id), Ok(private_key), Ok(webhook_secret)) = (
            env::var("GITHUB_APP_ID"),
            env::var("GITHUB_PRIVATE_KEY"),
            env::var("GITHUB_WEBHOOK_SECRET"),
        ) {
            builder = builder.github_app(GitHubAppConfig {
                app_id,
                private_key: SecretString::new(private_key),
                webhook_secret: SecretString::new(webhook_secret),
            });
        }
        if let Ok(secret) = env::var("SLACK_SIGNING_SECRET") {
            builder = builder.slack_signing_secret(secret);
        }
        if let Ok(keys) = env::var("SR_ADMIN_API_KEYS") {
            builder = builder.admin_api_keys(
                keys.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        if let (Ok(host), Ok(username), Ok(password), Ok(from)) = (
            env::var("SMTP_HOST"),
            env::var("SMTP_USERNAME"),
            env::var("SMTP_PASSWORD"),
            env::var("SMTP_FROM"),
        ) {
            let port = env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(587);
            builder = builder.smtp(SmtpConfig {
                host,
                port,
                username,
                password: SecretString::new(password),
                from_address: from,
            });
        }
        if let Ok(policy) = env::var("DEFAULT_POLICY_JSON") {
            builder = builder.default_policy_json(policy);
        }
        if let Ok(logins) = env::var("SR_BOT_LOGINS") {
            builder = builder.bot_logins(
                logins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }

        builder.build()
    }

    /// Validates the configuration. Fails closed on a missing or
    /// wrong-length encryption key.
    pub fn validate(&self) -> CoreResult<()> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(self.encryption_key.expose_secret())
            .map_err(|_| CoreError::bad_request("SR_ENCRYPTION_KEY must be valid base64"))?;
        if key.len() != 32 {
            return Err(CoreError::bad_request(
                "SR_ENCRYPTION_KEY must decode to exactly 32 bytes",
            ));
        }

        if self.storage_backend == StorageBackend::Postgres && self.database_url.is_none() {
            return Err(CoreError::bad_request(
                "DATABASE_URL is required for the postgres backend",
            ));
        }

        for (name, value) in [
            ("APP_BASE_URL", &self.app_base_url),
            ("API_BASE_URL", &self.api_base_url),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(CoreError::bad_request(format!(
                    "{name} must start with http:// or https://"
                )));
            }
        }

        if self.rate_limit_max == 0 {
            return Err(CoreError::bad_request("SR_RATE_LIMIT_MAX must be positive"));
        }

        Ok(())
    }
}

/// Builder for [`CoreConfig`].
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    encryption_key: Option<SecretString>,
    database_url: Option<String>,
    storage_backend: Option<StorageBackend>,
    app_base_url: Option<String>,
    api_base_url: Option<String>,
    github_api_base: Option<String>,
    provider_timeout: Option<Duration>,
    notify_timeout: Option<Duration>,
    rate_limit_window: Option<Duration>,
    rate_limit_max: Option<u32>,
    github_app: Option<GitHubAppConfig>,
    slack_signing_secret: Option<SecretString>,
    admin_api_keys: Option<Vec<String>>,
    smtp: Option<SmtpConfig>,
    default_policy_json: Option<String>,
    bot_logins: Option<Vec<String>>,
}

impl CoreConfigBuilder {
    /// Sets the base64-encoded 32-byte encryption key.
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(SecretString::new(key.into()));
        self
    }

    /// Sets the database URL.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the storage backend.
    pub fn storage_backend(mut self, backend: StorageBackend) -> Self {
        self.storage_backend = Some(backend);
        self
    }

    /// Sets the human-facing base URL.
    pub fn app_base_url(mut self, url: impl Into<String>) -> Self {
        self.app_base_url = Some(url.into());
        self
    }

    /// Sets the API base URL.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Sets the GitHub API base URL.
    pub fn github_api_base(mut self, url: impl Into<String>) -> Self {
        self.github_api_base = Some(url.into());
        self
    }

    /// Sets the upstream request timeout.
    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = Some(timeout);
        self
    }

    /// Sets the per-attempt notifier timeout.
    pub fn notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = Some(timeout);
        self
    }

    /// Sets the rate-limit window.
    pub fn rate_limit_window(mut self, window: Duration) -> Self {
        self.rate_limit_window = Some(window);
        self
    }

    /// Sets the rate-limit ceiling.
    pub fn rate_limit_max(mut self, max: u32) -> Self {
        self.rate_limit_max = Some(max);
        self
    }

    /// Sets the GitHub App credentials.
    pub fn github_app(mut self, app: GitHubAppConfig) -> Self {
        self.github_app = Some(app);
        self
    }

    /// Sets the Slack signing secret.
    pub fn slack_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.slack_signing_secret = Some(SecretString::new(secret.into()));
        self
    }

    /// Sets the admin API key allow-list.
    pub fn admin_api_keys(mut self, keys: Vec<String>) -> Self {
        self.admin_api_keys = Some(keys);
        self
    }

    /// Sets the SMTP settings.
    pub fn smtp(mut self, smtp: SmtpConfig) -> Self {
        self.smtp = Some(smtp);
        self
    }

    /// Sets the default policy JSON blob.
    pub fn default_policy_json(mut self, policy: impl Into<String>) -> Self {
        self.default_policy_json = Some(policy.into());
        self
    }

    /// Sets the filtered bot logins.
    pub fn bot_logins(mut self, logins: Vec<String>) -> Self {
        self.bot_logins = Some(logins);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> CoreResult<CoreConfig> {
        let config = CoreConfig {
            encryption_key: self
                .encryption_key
                .ok_or_else(|| CoreError::bad_request("SR_ENCRYPTION_KEY not configured"))?,
            database_url: self.database_url,
            storage_backend: self.storage_backend.unwrap_or(StorageBackend::Postgres),
            app_base_url: self
                .app_base_url
                .unwrap_or_else(|| "http://localhost:8500".to_string()),
            api_base_url: self
                .api_base_url
                .unwrap_or_else(|| "http://localhost:8500".to_string()),
            github_api_base: self
                .github_api_base
                .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string()),
            provider_timeout: self.provider_timeout.unwrap_or(DEFAULT_PROVIDER_TIMEOUT),
            notify_timeout: self.notify_timeout.unwrap_or(DEFAULT_NOTIFY_TIMEOUT),
            rate_limit_window: self.rate_limit_window.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW),
            rate_limit_max: self.rate_limit_max.unwrap_or(DEFAULT_RATE_LIMIT_MAX),
            github_app: self.github_app,
            slack_signing_secret: self.slack_signing_secret,
            admin_api_keys: self.admin_api_keys.unwrap_or_default(),
            smtp: self.smtp,
            default_policy_json: self.default_policy_json,
            bot_logins: self
                .bot_logins
                .unwrap_or_else(|| DEFAULT_BOT_LOGINS.iter().map(|s| s.to_string()).collect()),
        };

        config.validate()?;
        Ok(config)
    }
}
