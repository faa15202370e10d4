//! The queue-consumer loop: pop, decode, fan out across subscribers.

use std::sync::Arc;

use health::HealthHandle;
use sqlx::postgres::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coalescer::Coalescer;
use alert_common::dedup::DedupStore;
use alert_common::matcher;
use alert_common::preference;
use alert_common::queue::SlotQueue;
use alert_common::slot::RawSlotEvent;

/// One consumer worker. Each worker owns one queue handle and loops on the
/// blocking pop; a process runs several in parallel.
pub struct SlotConsumer {
    /// An identifier for this worker, used in logs.
    name: String,
    queue: Arc<dyn SlotQueue + Send + Sync>,
    pool: PgPool,
    dedup: DedupStore,
    coalescer: Arc<Coalescer>,
    /// The liveness check handle, reported on every loop iteration.
    liveness: HealthHandle,
    shutdown: watch::Receiver<bool>,
}

impl SlotConsumer {
    pub fn new(
        name: String,
        queue: Arc<dyn SlotQueue + Send + Sync>,
        pool: PgPool,
        dedup: DedupStore,
        coalescer: Arc<Coalescer>,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            queue,
            pool,
            dedup,
            coalescer,
            liveness,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips. The loop itself never fails:
    /// every per-event error is logged and counted, and the next pop follows.
    pub async fn run(mut self) {
        info!("consumer {} starting", self.name);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.liveness.report_healthy().await;

            let popped = tokio::select! {
                _ = self.shutdown.changed() => break,
                popped = self.queue.pop() => popped,
            };

            match popped {
                Ok(Some(payload)) => self.process(&payload).await,
                Ok(None) => continue,
                Err(e) => {
                    metrics::counter!("queue_pop_errors_total").increment(1);
                    error!("queue pop failed in {}: {}", self.name, e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
        info!("consumer {} stopped", self.name);
    }

    /// Handle one popped payload. The queue has already forgotten the event,
    /// so failures here are final: counted, never redelivered. A retry storm
    /// of duplicate fan-outs would be worse than a dropped event, which the
    /// scraper republishes on its next run anyway.
    pub async fn process(&self, payload: &str) {
        let slot = match RawSlotEvent::from_json(payload) {
            Ok(slot) => slot,
            Err(e) => {
                metrics::counter!("slot_events_undecodable_total").increment(1);
                warn!("dropping undecodable slot event: {}", e);
                return;
            }
        };
        metrics::counter!("slot_events_total").increment(1);

        // Fresh read every event: preference edits must take effect on the
        // very next dispatch cycle.
        let preferences = match preference::load_active(&self.pool).await {
            Ok(preferences) => preferences,
            Err(e) => {
                metrics::counter!("slot_events_failed_total").increment(1);
                error!("failed to load active preferences: {}", e);
                return;
            }
        };

        for pref in &preferences {
            match matcher::matches(&slot, &pref.filters) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    metrics::counter!("preference_match_errors_total").increment(1);
                    warn!(
                        subscriber_id = pref.subscriber_id,
                        "skipping subscriber with malformed preference: {}", e
                    );
                    continue;
                }
            }

            let check = match self
                .dedup
                .check_for_duplicate(pref.subscriber_id, &slot)
                .await
            {
                Ok(check) => check,
                Err(e) => {
                    metrics::counter!("slot_events_failed_total").increment(1);
                    error!("dedup check failed, abandoning event: {}", e);
                    return;
                }
            };
            if check.is_duplicate {
                let reason = check
                    .reason
                    .map(|reason| reason.to_string())
                    .unwrap_or_default();
                metrics::counter!("duplicate_alerts_suppressed_total", &[("reason", reason)])
                    .increment(1);
                debug!(
                    subscriber_id = pref.subscriber_id,
                    "suppressing duplicate alert"
                );
                continue;
            }

            self.coalescer
                .add(pref.subscriber_id, slot.clone(), pref.notification.instant)
                .await;
        }
    }
}
