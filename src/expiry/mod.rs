//! Expiry scheduler: periodic sweep over pending changes and spent tokens.
//!
//! A single periodic task. The transition itself is one conditional UPDATE
//! in the store, so even if several processes run the sweep, each change
//! transitions (and notifies) at most once.

use crate::notify::{ChangeEvent, Notification, Notifier};
use crate::observability::MetricsRegistry;
use crate::store::Store;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The expiry sweep.
pub struct ExpiryScheduler {
    store: Arc<dyn Store>,
    notifier: Notifier,
    metrics: Arc<MetricsRegistry>,
    period: Duration,
}

impl std::fmt::Debug for ExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryScheduler")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl ExpiryScheduler {
    /// Creates the scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Notifier,
        metrics: Arc<MetricsRegistry>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
            period,
        }
    }

    /// One sweep: expire stale pending changes, publish one `expired` event
    /// each, then drop consumed and expired approval tokens.
    pub async fn tick(&self) -> crate::errors::CoreResult<Vec<String>> {
        let now = Utc::now();
        let expired = self.store.expire_pending(now).await?;

        for change_id in &expired {
            self.metrics.record_change_status("expired");
            if let Err(e) = self.store.insert_audit(change_id, "expired", &json!({})).await {
                warn!(change_id, error = %e, "audit write failed for expired change");
            }
            match self.store.get_change(change_id).await {
                Ok(Some(change)) => {
                    let api_key = change.api_key.clone();
                    self.notifier.publish(Notification {
                        event: ChangeEvent::Expired,
                        change,
                        extras: json!({}),
                        api_key,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(change_id, error = %e, "load failed for expired change"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired pending changes");
        }

        match self.store.gc_tokens(now).await {
            Ok(removed) if removed > 0 => debug!(removed, "garbage-collected approval tokens"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "token GC failed"),
        }

        Ok(expired)
    }

    /// Spawns the periodic loop. The first tick runs immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{sample_change, CaptureChannel, MemoryStore};
    use crate::types::{ApprovalTokenKind, ChangeStatus};
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    struct Harness {
        scheduler: ExpiryScheduler,
        store: Arc<MemoryStore>,
        capture: Arc<CaptureChannel>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let capture = Arc::new(CaptureChannel::new("capture"));
        let metrics = Arc::new(MetricsRegistry::new());
        let (notifier, _handle) =
            Notifier::spawn(store.clone(), vec![capture.clone()], metrics.clone(), 64);
        Harness {
            scheduler: ExpiryScheduler::new(
                store.clone(),
                notifier,
                metrics,
                Duration::from_secs(300),
            ),
            store,
            capture,
        }
    }

    #[tokio::test]
    async fn test_back_to_back_ticks_expire_once() {
        let h = harness();
        let mut change = sample_change("c-stale");
        change.revert_expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        h.store.upsert_change(&change).await.unwrap();

        let first = h.scheduler.tick().await.unwrap();
        assert_eq!(first, vec!["c-stale".to_string()]);
        let stored = h.store.get_change("c-stale").await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Expired);

        let second = h.scheduler.tick().await.unwrap();
        assert!(second.is_empty());

        for _ in 0..50 {
            if !h.capture.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Exactly one expired notification across both ticks.
        let delivered = h.capture.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, ChangeEvent::Expired);
    }

    #[tokio::test]
    async fn test_fresh_pending_untouched() {
        let h = harness();
        h.store.upsert_change(&sample_change("c-fresh")).await.unwrap();

        let expired = h.scheduler.tick().await.unwrap();
        assert!(expired.is_empty());
        let stored = h.store.get_change("c-fresh").await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_tick_collects_spent_tokens() {
        let h = harness();
        h.store.upsert_change(&sample_change("c-tok")).await.unwrap();
        let token = h
            .store
            .create_approval_token("c-tok", ApprovalTokenKind::Approve, ChronoDuration::hours(2))
            .await
            .unwrap();
        assert!(h.store.verify_and_consume_token("c-tok", &token).await.unwrap());

        h.scheduler.tick().await.unwrap();
        assert!(h.store.raw_token(&token).is_none());
    }

    #[tokio::test]
    async fn test_executed_changes_never_expire() {
        let h = harness();
        let mut change = sample_change("c-exec");
        change.status = ChangeStatus::Executed;
        change.revert_expires_at = Some(Utc::now() - ChronoDuration::hours(1));
        h.store.upsert_change(&change).await.unwrap();

        let expired = h.scheduler.tick().await.unwrap();
        assert!(expired.is_empty());
        // Past the revert deadline it simply stays executed.
        let stored = h.store.get_change("c-exec").await.unwrap().unwrap();
        assert_eq!(stored.status, ChangeStatus::Executed);
    }
}
