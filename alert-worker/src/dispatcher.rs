//! Consolidated email dispatch for one subscriber's batch of slots.
//!
//! The dispatcher re-reads the subscriber's preference, applies the
//! per-subscriber rate caps and the active-hours gate, renders one plain-text
//! email and records the outcome: dedup records and history rows on success,
//! history rows only on failure so a later republication can retry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use sqlx::postgres::PgPool;
use tracing::{debug, error, warn};

use alert_common::dedup::DedupStore;
use alert_common::email::{EmailError, EmailSender};
use alert_common::history::{AlertRecord, AlertRecorder, DeliveryStatus};
use alert_common::preference::{self, Preference, TimeWindow};
use alert_common::slot::{format_price, parse_hhmm, Slot};
use alert_common::store::StoreError;
use thiserror::Error;

/// Wall-clock source, injectable so the active-hours gate is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock {}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    RateLimited,
    OutsideActiveHours,
    Failed,
    /// The subscriber disappeared or went inactive between matching and
    /// dispatch; nothing was sent or recorded.
    Skipped,
}

#[derive(Error, Debug)]
enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Email(#[from] EmailError),
}

/// The batch coalescer talks to dispatch through this seam; tests substitute
/// a recording implementation.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, subscriber_id: i64, slots: Vec<Slot>) -> DispatchOutcome;
}

pub struct EmailDispatcher {
    pool: PgPool,
    dedup: DedupStore,
    recorder: AlertRecorder,
    sender: Arc<dyn EmailSender + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl EmailDispatcher {
    pub fn new(
        pool: PgPool,
        dedup: DedupStore,
        recorder: AlertRecorder,
        sender: Arc<dyn EmailSender + Send + Sync>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            dedup,
            recorder,
            sender,
            clock,
        }
    }

    async fn dispatch_inner(
        &self,
        subscriber_id: i64,
        slots: &[Slot],
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(pref) = preference::load_by_id(&self.pool, subscriber_id).await? else {
            debug!(subscriber_id, "preference vanished before dispatch");
            return Ok(DispatchOutcome::Skipped);
        };
        if !pref.is_active() {
            debug!(subscriber_id, "subscriber inactive, dropping batch");
            return Ok(DispatchOutcome::Skipped);
        }

        if let Some(reason) = self.rate_limit_reason(&pref).await? {
            self.record_all(&pref, slots, DeliveryStatus::Failed, Some(reason.clone()))
                .await?;
            metrics::counter!("alerts_rate_limited_total").increment(1);
            warn!(subscriber_id, "alert suppressed by rate cap: {}", reason);
            return Ok(DispatchOutcome::RateLimited);
        }

        if let Some(window) = &pref.notification.active_hours {
            if !self.within_active_hours(window) {
                // The slots were seen and judged; mark them deduplicated so
                // they don't come back as fresh alerts when the window opens.
                for slot in slots {
                    self.dedup.record_notification(subscriber_id, slot).await?;
                }
                metrics::counter!("alerts_suppressed_active_hours_total").increment(1);
                debug!(subscriber_id, "dispatch outside active hours");
                return Ok(DispatchOutcome::OutsideActiveHours);
            }
        }

        let subject = subject_for(slots.len());
        let body = build_body(slots);

        match self.sender.send(&pref.email, subject, &body).await {
            Ok(()) => {
                for slot in slots {
                    self.dedup.record_notification(subscriber_id, slot).await?;
                }
                self.mark_notified(slots).await?;
                self.record_all(&pref, slots, DeliveryStatus::Sent, None)
                    .await?;
                metrics::counter!("alerts_sent_total").increment(1);
                Ok(DispatchOutcome::Sent)
            }
            Err(e) => {
                // No dedup write: a republished event may succeed later.
                self.record_all(&pref, slots, DeliveryStatus::Failed, Some(e.to_string()))
                    .await?;
                metrics::counter!("alerts_failed_total").increment(1);
                error!(subscriber_id, error = %e, "email send failed");
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    async fn rate_limit_reason(&self, pref: &Preference) -> Result<Option<String>, StoreError> {
        if let Some(cap) = pref.notification.max_per_hour {
            let sent = self
                .recorder
                .count_for_subscriber(pref.subscriber_id, chrono::Duration::hours(1))
                .await?;
            if sent >= cap {
                return Ok(Some(format!("hourly alert cap of {cap} reached")));
            }
        }
        if let Some(cap) = pref.notification.max_per_day {
            let sent = self
                .recorder
                .count_for_subscriber(pref.subscriber_id, chrono::Duration::hours(24))
                .await?;
            if sent >= cap {
                return Ok(Some(format!("daily alert cap of {cap} reached")));
            }
        }
        Ok(None)
    }

    /// A malformed window is treated as no window at all; the bad record is
    /// logged once per dispatch rather than silencing the subscriber.
    fn within_active_hours(&self, window: &TimeWindow) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&window.start), parse_hhmm(&window.end)) else {
            warn!(
                "ignoring malformed active-hours window {}..{}",
                window.start, window.end
            );
            return true;
        };

        let now = self.clock.now();
        let minutes = (now.hour() * 60 + now.minute()) as u16;
        if start <= end {
            start <= minutes && minutes < end
        } else {
            // Overnight window, e.g. 22:00..06:00.
            minutes >= start || minutes < end
        }
    }

    async fn record_all(
        &self,
        pref: &Preference,
        slots: &[Slot],
        status: DeliveryStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let rows: Vec<AlertRecord> = slots
            .iter()
            .map(|slot| {
                AlertRecord::new(pref.subscriber_id, slot, &pref.email, status, reason.clone())
            })
            .collect();
        self.recorder.append(&rows).await
    }

    /// Flag the sent slots in the scraper's collection so retention can skip
    /// them. Queue events carry no row id, so the match is by slot identity;
    /// a slot deleted in the meantime is simply a no-op here.
    async fn mark_notified(&self, slots: &[Slot]) -> Result<(), StoreError> {
        for slot in slots {
            sqlx::query(
                r#"
UPDATE
    court_slots
SET
    notified = TRUE
WHERE
    venue_id = $1
    AND date = $2
    AND start_time = $3
    AND court_id = $4
                "#,
            )
            .bind(&slot.venue_id)
            .bind(&slot.date)
            .bind(&slot.start_time)
            .bind(&slot.court_id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::query("UPDATE", error))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatch for EmailDispatcher {
    async fn dispatch(&self, subscriber_id: i64, slots: Vec<Slot>) -> DispatchOutcome {
        if slots.is_empty() {
            return DispatchOutcome::Skipped;
        }
        match self.dispatch_inner(subscriber_id, &slots).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(subscriber_id, error = %e, "dispatch aborted");
                DispatchOutcome::Failed
            }
        }
    }
}

pub fn subject_for(slot_count: usize) -> &'static str {
    if slot_count == 1 {
        "Tennis Court Available"
    } else {
        "Multiple Tennis Courts Available"
    }
}

/// Render the consolidated plain-text body: quick links first, then slots
/// grouped by venue and date. Arrival order is preserved inside each group.
pub fn build_body(slots: &[Slot]) -> String {
    let mut body = String::new();

    if slots.len() == 1 {
        body.push_str("A tennis court slot just opened up.\n");
    } else {
        body.push_str(&format!(
            "{} tennis court slots just opened up.\n",
            slots.len()
        ));
    }

    let links: Vec<&str> = slots
        .iter()
        .filter(|slot| !slot.booking_url.is_empty())
        .map(|slot| slot.booking_url.as_str())
        .collect();
    if !links.is_empty() {
        body.push_str("\nQuick links:\n");
        for link in links {
            body.push_str(&format!("- {link}\n"));
        }
    }

    // Group by venue then by date, keeping first-seen order at both levels.
    let mut venues: Vec<(&str, Vec<(&str, Vec<&Slot>)>)> = Vec::new();
    for slot in slots {
        let venue_idx = match venues.iter().position(|(name, _)| *name == slot.venue_name) {
            Some(idx) => idx,
            None => {
                venues.push((slot.venue_name.as_str(), Vec::new()));
                venues.len() - 1
            }
        };
        let dates = &mut venues[venue_idx].1;
        let date_idx = match dates.iter().position(|(date, _)| *date == slot.date) {
            Some(idx) => idx,
            None => {
                dates.push((slot.date.as_str(), Vec::new()));
                dates.len() - 1
            }
        };
        dates[date_idx].1.push(slot);
    }

    for (venue, dates) in venues {
        body.push_str(&format!("\n{venue}\n"));
        for (date, slots) in dates {
            body.push_str(&format!("  {date}\n"));
            for slot in slots {
                body.push_str(&format!(
                    "    {}  {}-{}  {}\n",
                    slot.court_name,
                    slot.start_time,
                    slot.end_time,
                    format_price(slot.price, &slot.currency)
                ));
            }
        }
    }

    body
}
