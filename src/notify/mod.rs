//! Notifier: delivers change events to subscriber channels.
//!
//! Publishing enqueues onto a bounded queue drained by a background task;
//! the request path never waits on delivery, and a full queue drops the
//! event with a log line rather than blocking. Fan-out across channels is
//! concurrent, with failures isolated per channel and never surfaced to the
//! caller path.

use crate::errors::{CoreError, CoreResult};
use crate::observability::MetricsRegistry;
use crate::store::Store;
use crate::types::{Change, TenantSettings};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Delivery attempts per channel (one try + retries).
const DELIVERY_ATTEMPTS: u32 = 3;

/// Base backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Events the notifier publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A dry-run created a pending change.
    DryRun,
    /// A change was applied.
    Applied,
    /// A change was reverted.
    Reverted,
    /// A pending change expired unapproved.
    Expired,
    /// An operation executed with a revert window open.
    ExecutedWithRevert,
    /// A high-risk operation executed out of band.
    ExecutedHighRisk,
}

impl ChangeEvent {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Applied => "applied",
            Self::Reverted => "reverted",
            Self::Expired => "expired",
            Self::ExecutedWithRevert => "executed_with_revert",
            Self::ExecutedHighRisk => "executed_high_risk",
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            Self::DryRun => "Approval required",
            Self::Applied => "Operation applied",
            Self::Reverted => "Operation reverted",
            Self::Expired => "Approval window expired",
            Self::ExecutedWithRevert => "Operation executed - revert available",
            Self::ExecutedHighRisk => "HIGH RISK operation executed - revert available",
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One queued notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Event type.
    pub event: ChangeEvent,
    /// Change snapshot at publish time.
    pub change: Change,
    /// Extras: `approve_url`, `reject_url`, `revert_url`,
    /// `revert_window_hours`.
    pub extras: Value,
    /// Tenant whose settings select the channels.
    pub api_key: Option<String>,
}

/// JSON body shared by the webhook-style channels.
pub fn webhook_body(notification: &Notification) -> Value {
    let change = &notification.change;
    json!({
        "event": notification.event.as_str(),
        "change_id": change.change_id,
        "provider": change.provider.to_string(),
        "target_id": change.target_id,
        "title": change.title,
        "status": change.status.as_str(),
        "risk_score": change.risk_score,
        "reasons": change.reasons,
        "human_preview": change.human_preview,
        "extras": notification.extras,
    })
}

/// Signs a body with HMAC-SHA256 under the tenant's shared secret.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// A delivery channel. Implementations skip quietly (returning `Ok(None)`)
/// when the tenant has not configured them; `Some(id)` reports an outbound
/// message id worth storing for in-place updates.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Delivers one notification.
    async fn deliver(
        &self,
        notification: &Notification,
        settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>>;
}

async fn with_retry<F, Fut>(channel: &str, mut attempt: F) -> CoreResult<Option<String>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<Option<String>>>,
{
    let mut last_err = None;
    for n in 0..DELIVERY_ATTEMPTS {
        match attempt().await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                debug!(channel, attempt = n + 1, error = %e, "delivery attempt failed");
                last_err = Some(e);
                if n + 1 < DELIVERY_ATTEMPTS {
                    tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(n)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::internal("delivery failed")))
}

/// Rich chat channel via the workspace bot API. Sends Block Kit messages
/// with action buttons and updates them in place on state changes.
pub struct SlackBotChannel {
    http: reqwest::Client,
    base_url: String,
}

impl fmt::Debug for SlackBotChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackBotChannel")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SlackBotChannel {
    /// Creates the channel with a per-attempt timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Builds the Block Kit message for an event.
    pub fn build_blocks(notification: &Notification) -> Value {
        let change = &notification.change;
        let mut blocks = vec![
            json!({
                "type": "header",
                "text": { "type": "plain_text", "text": notification.event.headline() }
            }),
            json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*Target:* {}\n*Risk:* {:.1} / 10\n{}",
                        change.target_id,
                        change.risk_score * 10.0,
                        change.human_preview.as_deref().unwrap_or(""),
                    )
                }
            }),
        ];

        let mut buttons = Vec::new();
        if notification.event == ChangeEvent::DryRun {
            if let Some(url) = notification.extras.get("approve_url").and_then(Value::as_str) {
                buttons.push(json!({
                    "type": "button",
                    "style": "primary",
                    "text": { "type": "plain_text", "text": "Approve" },
                    "action_id": "approve",
                    "url": url,
                }));
            }
            if let Some(url) = notification.extras.get("reject_url").and_then(Value::as_str) {
                buttons.push(json!({
                    "type": "button",
                    "style": "danger",
                    "text": { "type": "plain_text", "text": "Reject" },
                    "action_id": "reject",
                    "url": url,
                }));
            }
        }
        if matches!(
            notification.event,
            ChangeEvent::ExecutedWithRevert | ChangeEvent::ExecutedHighRisk
        ) {
            if let Some(url) = notification.extras.get("revert_url").and_then(Value::as_str) {
                buttons.push(json!({
                    "type": "button",
                    "style": "danger",
                    "text": { "type": "plain_text", "text": "Revert" },
                    "action_id": "revert",
                    "url": url,
                }));
            }
        }
        if !buttons.is_empty() {
            blocks.push(json!({ "type": "actions", "elements": buttons }));
        }

        Value::Array(blocks)
    }
}

#[async_trait]
impl NotificationChannel for SlackBotChannel {
    fn name(&self) -> &'static str {
        "slack_bot"
    }

    async fn deliver(
        &self,
        notification: &Notification,
        settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>> {
        let settings = match settings {
            Some(s) if s.slack_enabled && s.slack_bot_token.is_some() => s,
            _ => return Ok(None),
        };
        let bot_token = settings.slack_bot_token.as_deref().unwrap_or_default();
        let channel = settings.slack_channel.as_deref().unwrap_or("#saferun-alerts");
        let blocks = Self::build_blocks(notification);

        // Update the original message in place when we have its id.
        let (path, mut payload) = match &notification.change.chat_message_id {
            Some(ts) => (
                "/chat.update",
                json!({ "channel": channel, "ts": ts, "blocks": blocks }),
            ),
            None => (
                "/chat.postMessage",
                json!({ "channel": channel, "blocks": blocks }),
            ),
        };
        payload["text"] = json!(notification.event.headline());

        with_retry(self.name(), || {
            let payload = payload.clone();
            async move {
                let response = self
                    .http
                    .post(format!("{}{}", self.base_url, path))
                    .bearer_auth(bot_token)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| CoreError::bad_gateway(format!("chat API call failed: {e}")))?;
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| CoreError::bad_gateway(format!("chat API bad body: {e}")))?;
                if body.get("ok").and_then(Value::as_bool) != Some(true) {
                    let error = body
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    return Err(CoreError::bad_gateway(format!("chat API error: {error}")));
                }
                Ok(body.get("ts").and_then(Value::as_str).map(String::from))
            }
        })
        .await
    }
}

/// URL-only chat channel: no interactivity, approve/reject links embedded in
/// the text.
pub struct SlackWebhookChannel {
    http: reqwest::Client,
}

impl fmt::Debug for SlackWebhookChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackWebhookChannel").finish()
    }
}

impl SlackWebhookChannel {
    /// Creates the channel with a per-attempt timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn render_text(notification: &Notification) -> String {
        let change = &notification.change;
        let mut text = format!(
            "{}\n{} - risk {:.1}/10",
            notification.event.headline(),
            change.target_id,
            change.risk_score * 10.0,
        );
        for (label, key) in [
            ("Approve", "approve_url"),
            ("Reject", "reject_url"),
            ("Revert", "revert_url"),
        ] {
            if let Some(url) = notification.extras.get(key).and_then(Value::as_str) {
                text.push_str(&format!("\n{label}: {url}"));
            }
        }
        text
    }
}

#[async_trait]
impl NotificationChannel for SlackWebhookChannel {
    fn name(&self) -> &'static str {
        "slack_webhook"
    }

    async fn deliver(
        &self,
        notification: &Notification,
        settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>> {
        let url = match settings.and_then(|s| s.slack_webhook_url.clone()) {
            Some(url) => url,
            None => return Ok(None),
        };
        let payload = json!({ "text": Self::render_text(notification) });

        with_retry(self.name(), || {
            let payload = payload.clone();
            let url = url.clone();
            async move {
                self.http
                    .post(&url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| CoreError::bad_gateway(format!("webhook post failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| CoreError::bad_gateway(format!("webhook rejected: {e}")))?;
                Ok(None)
            }
        })
        .await
    }
}

/// Generic webhook channel: JSON body signed with HMAC-SHA256 under the
/// tenant's shared secret (`X-Signature` header).
pub struct GenericWebhookChannel {
    http: reqwest::Client,
}

impl fmt::Debug for GenericWebhookChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericWebhookChannel").finish()
    }
}

impl GenericWebhookChannel {
    /// Creates the channel with a per-attempt timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotificationChannel for GenericWebhookChannel {
    fn name(&self) -> &'static str {
        "generic_webhook"
    }

    async fn deliver(
        &self,
        notification: &Notification,
        settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>> {
        let settings = match settings {
            Some(s) if s.webhook_enabled && s.webhook_url.is_some() => s,
            _ => return Ok(None),
        };
        let url = settings.webhook_url.clone().unwrap_or_default();
        let body = serde_json::to_vec(&webhook_body(notification))
            .map_err(|e| CoreError::internal(format!("body encoding failed: {e}")))?;
        let signature = settings
            .webhook_secret
            .as_deref()
            .map(|secret| sign_body(secret, &body));

        with_retry(self.name(), || {
            let body = body.clone();
            let url = url.clone();
            let signature = signature.clone();
            async move {
                let mut req = self
                    .http
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
                if let Some(signature) = signature {
                    req = req.header("X-Signature", signature);
                }
                req.send()
                    .await
                    .map_err(|e| CoreError::bad_gateway(format!("webhook post failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| CoreError::bad_gateway(format!("webhook rejected: {e}")))?;
                Ok(None)
            }
        })
        .await
    }
}

/// Per-change custom URL channel: single fire-and-forget POST to the URL
/// supplied at dry-run time. No retries, no signature.
pub struct CustomUrlChannel {
    http: reqwest::Client,
}

impl fmt::Debug for CustomUrlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomUrlChannel").finish()
    }
}

impl CustomUrlChannel {
    /// Creates the channel with a per-attempt timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotificationChannel for CustomUrlChannel {
    fn name(&self) -> &'static str {
        "custom_url"
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _settings: Option<&TenantSettings>,
    ) -> CoreResult<Option<String>> {
        let url = match &notification.change.webhook_url {
            Some(url) => url.clone(),
            None => return Ok(None),
        };
        self.http
            .post(&url)
            .json(&webhook_body(notification))
            .send()
            .await
            .map_err(|e| CoreError::bad_gateway(format!("custom webhook post failed: {e}")))?;
        Ok(None)
    }
}

/// Handle for publishing notifications onto the background queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    /// Spawns the drain task and returns the publish handle.
    pub fn spawn(
        store: Arc<dyn Store>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        metrics: Arc<MetricsRegistry>,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notification>(queue_capacity);

        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let settings = match &notification.api_key {
                    Some(api_key) => store.get_settings(api_key).await.ok().flatten(),
                    None => None,
                };

                let mut set = JoinSet::new();
                for channel in &channels {
                    let channel = channel.clone();
                    let notification = notification.clone();
                    let settings = settings.clone();
                    set.spawn(async move {
                        let outcome = channel.deliver(&notification, settings.as_ref()).await;
                        (channel.name(), outcome)
                    });
                }

                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((name, Ok(message_id))) => {
                            metrics.record_delivery(name, true);
                            if name == "slack_bot" {
                                if let Some(id) = message_id {
                                    if notification.change.chat_message_id.is_none() {
                                        if let Err(e) = store
                                            .set_chat_message_id(
                                                &notification.change.change_id,
                                                &id,
                                            )
                                            .await
                                        {
                                            warn!(error = %e, "failed to store chat message id");
                                        }
                                    }
                                }
                            }
                        }
                        Ok((name, Err(e))) => {
                            metrics.record_delivery(name, false);
                            warn!(channel = name, error = %e, "notification delivery failed");
                        }
                        Err(e) => warn!(error = %e, "notification task panicked"),
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Enqueues a notification. Never blocks; a full queue drops the event
    /// with a warning.
    pub fn publish(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "notification queue full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{sample_change, CaptureChannel, MemoryStore};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification(event: ChangeEvent) -> Notification {
        Notification {
            event,
            change: sample_change("c-notify"),
            extras: json!({
                "approve_url": "https://app.example/approvals/c-notify?token=tok_x",
                "reject_url": "https://app.example/approvals/c-notify/reject?token=tok_x",
            }),
            api_key: Some("sr_tenant".to_string()),
        }
    }

    #[test]
    fn test_signature_is_deterministic_hmac() {
        let body = br#"{"event":"applied"}"#;
        let a = sign_body("secret", body);
        let b = sign_body("secret", body);
        assert_eq!(a, b);
        assert_ne!(a, sign_body("other", body));
        // 32-byte SHA-256 output as hex.
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_dry_run_blocks_carry_approve_and_reject() {
        let blocks = SlackBotChannel::build_blocks(&notification(ChangeEvent::DryRun));
        let rendered = blocks.to_string();
        assert!(rendered.contains("\"action_id\":\"approve\""));
        assert!(rendered.contains("\"action_id\":\"reject\""));
        assert!(!rendered.contains("\"action_id\":\"revert\""));
    }

    #[test]
    fn test_executed_blocks_carry_revert() {
        let mut n = notification(ChangeEvent::ExecutedWithRevert);
        n.extras = json!({ "revert_url": "https://api.example/webhooks/github/revert/c-notify" });
        let rendered = SlackBotChannel::build_blocks(&n).to_string();
        assert!(rendered.contains("\"action_id\":\"revert\""));
        assert!(!rendered.contains("\"action_id\":\"approve\""));
    }

    #[tokio::test]
    async fn test_generic_webhook_signs_body() {
        let n = notification(ChangeEvent::Applied);
        // The signature the receiver must be able to recompute.
        let body = serde_json::to_vec(&webhook_body(&n)).unwrap();
        let expected_signature = sign_body("shared-secret", &body);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(wiremock::matchers::header(
                "X-Signature",
                expected_signature.as_str(),
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let settings = TenantSettings {
            api_key: "sr_tenant".to_string(),
            webhook_enabled: true,
            webhook_url: Some(format!("{}/hook", server.uri())),
            webhook_secret: Some("shared-secret".to_string()),
            ..Default::default()
        };

        let channel = GenericWebhookChannel::new(Duration::from_secs(2));
        channel.deliver(&n, Some(&settings)).await.unwrap();
        // Dropping the server verifies the expectation, signature included.
    }

    #[tokio::test]
    async fn test_unconfigured_channels_skip() {
        let channel = GenericWebhookChannel::new(Duration::from_secs(2));
        let outcome = channel
            .deliver(&notification(ChangeEvent::Applied), None)
            .await
            .unwrap();
        assert_eq!(outcome, None);

        let bot = SlackBotChannel::new("https://slack.invalid", Duration::from_secs(2));
        assert_eq!(
            bot.deliver(&notification(ChangeEvent::Applied), None)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_notifier_fans_out_and_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        let good = Arc::new(CaptureChannel::new("capture"));
        let failing = Arc::new(CaptureChannel::failing("broken"));
        let metrics = Arc::new(MetricsRegistry::new());

        let (notifier, _handle) = Notifier::spawn(
            store,
            vec![good.clone(), failing],
            metrics.clone(),
            16,
        );

        notifier.publish(notification(ChangeEvent::Applied));

        // Drain task is asynchronous; wait for the capture to land.
        for _ in 0..50 {
            if !good.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let delivered = good.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, ChangeEvent::Applied);

        let text = metrics.render_prometheus();
        assert!(text.contains("channel=\"capture\",outcome=\"ok\"} 1"));
        assert!(text.contains("channel=\"broken\",outcome=\"error\"} 1"));
    }

    #[test]
    fn test_slack_webhook_text_embeds_urls() {
        let text = SlackWebhookChannel::render_text(&notification(ChangeEvent::DryRun));
        assert!(text.contains("Approve: https://app.example/approvals/c-notify?token=tok_x"));
        assert!(text.contains("Reject: "));
    }
}
