//! # SafeRun Core
//!
//! Safety middleware between AI agents (or CI pipelines, CLIs, SDKs) and
//! privileged third-party APIs. Every mutating operation is first submitted
//! as a dry-run, scored for risk, gated by policy, and suspended as a
//! pending change until a human approves or rejects it. Approved operations
//! execute, reversible ones stay revertable within a bounded window, and
//! webhooks from the upstream detect out-of-band mutations and open
//! post-hoc revert paths.
//!
//! This crate is the change lifecycle engine: the state machine, risk and
//! policy gate, approval token system, persistence and ownership model,
//! expiry scheduler, provider adapter contract, and webhook ingress. HTTP
//! routing, the chat UI, SDK clients, and the CLI are external
//! collaborators wired around [`CoreRuntime`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use saferun_core::{CoreConfig, CoreRuntime};
//! use saferun_core::engine::{DryRunRequest, Operation};
//! use saferun_core::types::ProviderKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::from_env()?;
//!     let runtime = CoreRuntime::bootstrap(config).await?;
//!
//!     let result = runtime
//!         .engine()
//!         .dry_run(DryRunRequest {
//!             provider: ProviderKind::GitHub,
//!             operation: Operation::DeleteBranch,
//!             target_id: "octo/widgets#feature-x".to_string(),
//!             credential: std::env::var("GITHUB_TOKEN")?,
//!             caller_api_key: "sr_example".to_string(),
//!             reason: None,
//!             policy: None,
//!             webhook_url: None,
//!             commit_sha: None,
//!             commit_message: None,
//!         })
//!         .await?;
//!     println!("change {} risk {:.2}", result.change_id, result.risk_score);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod approvals;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod expiry;
pub mod mocks;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod providers;
pub mod ratelimit;
pub mod risk;
pub mod store;
pub mod tenants;
pub mod types;
pub mod webhooks;

pub use approvals::{ApprovalAuth, ApprovalGateway};
pub use config::{CoreConfig, StorageBackend};
pub use crypto::TokenVault;
pub use engine::ChangeEngine;
pub use errors::{CoreError, CoreResult, ErrorKind};
pub use expiry::ExpiryScheduler;
pub use notify::Notifier;
pub use observability::MetricsRegistry;
pub use ratelimit::RateLimiter;
pub use store::Store;
pub use tenants::Tenants;
pub use webhooks::WebhookIngress;

use engine::EngineOptions;
use mocks::MemoryStore;
use notify::{
    CustomUrlChannel, GenericWebhookChannel, NotificationChannel, SlackBotChannel,
    SlackWebhookChannel,
};
use providers::{AppTokenMinter, GitHubAdapter, Provider};
use std::collections::HashMap;
use std::sync::Arc;
use store::PostgresStore;
use types::ProviderKind;

/// Capacity of the notification queue.
const NOTIFY_QUEUE_CAPACITY: usize = 256;

/// Default Slack API base.
const SLACK_API_BASE: &str = "https://slack.com/api";

/// Composition root: constructs the store, vault, notifier, providers, and
/// engines at boot and hands them to callers as dependencies. No
/// process-wide mutable state beyond the logger and metrics registry.
pub struct CoreRuntime {
    config: CoreConfig,
    store: Arc<dyn Store>,
    engine: Arc<ChangeEngine>,
    gateway: Arc<ApprovalGateway>,
    ingress: Arc<WebhookIngress>,
    scheduler: Arc<ExpiryScheduler>,
    tenants: Tenants,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
    notifier: Notifier,
}

impl std::fmt::Debug for CoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntime")
            .field("storage_backend", &self.config.storage_backend)
            .finish_non_exhaustive()
    }
}

impl CoreRuntime {
    /// Builds the full runtime from configuration. Fails closed on a bad
    /// encryption key or missing database URL.
    pub async fn bootstrap(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let vault = TokenVault::new(&config.encryption_key)
            .map_err(|e| CoreError::bad_request(e.to_string()))?;

        let store: Arc<dyn Store> = match config.storage_backend {
            StorageBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| CoreError::bad_request("DATABASE_URL not configured"))?;
                Arc::new(PostgresStore::connect(url, vault.clone()).await?)
            }
            StorageBackend::Memory => Arc::new(MemoryStore::with_vault(vault.clone())),
        };

        let metrics = Arc::new(MetricsRegistry::new());

        let channels: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(SlackBotChannel::new(SLACK_API_BASE, config.notify_timeout)),
            Arc::new(SlackWebhookChannel::new(config.notify_timeout)),
            Arc::new(GenericWebhookChannel::new(config.notify_timeout)),
            Arc::new(CustomUrlChannel::new(config.notify_timeout)),
        ];
        let (notifier, _notify_task) = Notifier::spawn(
            store.clone(),
            channels,
            metrics.clone(),
            NOTIFY_QUEUE_CAPACITY,
        );

        let github = Arc::new(
            GitHubAdapter::new(config.github_api_base.clone(), config.provider_timeout)
                .map_err(providers::ProviderError::into_core)?,
        );
        let mut provider_map: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        provider_map.insert(ProviderKind::GitHub, github.clone());

        let minter = config.github_app.as_ref().map(|app| {
            Arc::new(AppTokenMinter::new(
                app.app_id.clone(),
                app.private_key.clone(),
                config.github_api_base.clone(),
                reqwest::Client::new(),
            ))
        });

        let engine = Arc::new(ChangeEngine::new(
            store.clone(),
            provider_map,
            notifier.clone(),
            metrics.clone(),
            minter.clone(),
            EngineOptions::from_config(&config),
        ));
        let gateway = Arc::new(ApprovalGateway::new(engine.clone()));

        let ingress = Arc::new(WebhookIngress::new(
            store.clone(),
            notifier.clone(),
            metrics.clone(),
            github,
            minter,
            config.bot_logins.clone(),
            config.api_base_url.clone(),
            config::DEFAULT_REVERT_WINDOW_HOURS,
        ));

        let scheduler = Arc::new(ExpiryScheduler::new(
            store.clone(),
            notifier.clone(),
            metrics.clone(),
            config::DEFAULT_SWEEP_PERIOD,
        ));

        let tenants = Tenants::new(store.clone());
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max,
        ));

        Ok(Self {
            config,
            store,
            engine,
            gateway,
            ingress,
            scheduler,
            tenants,
            rate_limiter,
            metrics,
            notifier,
        })
    }

    /// The effective configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The persistence layer.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// The change engine.
    pub fn engine(&self) -> Arc<ChangeEngine> {
        self.engine.clone()
    }

    /// The approval gateway.
    pub fn gateway(&self) -> Arc<ApprovalGateway> {
        self.gateway.clone()
    }

    /// The webhook ingress.
    pub fn ingress(&self) -> Arc<WebhookIngress> {
        self.ingress.clone()
    }

    /// The expiry scheduler. Call [`ExpiryScheduler::spawn`] to start the
    /// periodic sweep; the first tick runs immediately.
    pub fn scheduler(&self) -> Arc<ExpiryScheduler> {
        self.scheduler.clone()
    }

    /// The tenant registry.
    pub fn tenants(&self) -> &Tenants {
        &self.tenants
    }

    /// The admission rate limiter.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// The metrics registry (`render_prometheus` backs `GET /metrics`).
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// The notification publish handle.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }
}
