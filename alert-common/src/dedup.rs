//! Duplicate-alert suppression.
//!
//! A record is kept per `(subscriber, slot key)` after a successful send.
//! Two equivalence relations decide whether a fresh event is a repeat:
//! *exact* (the full slot identity, peripheral fields included) and *similar*
//! (the `(venue, court, date, start time)` key tuple alone, so a
//! republication that only changed price, end time or URL still counts as
//! the same opportunity). Records expire a configured TTL after
//! `last_sent_at`; expiry is enforced by cutoff comparison on read and a
//! periodic prune on the write side.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgPool;

use crate::slot::Slot;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// The identical slot re-appeared, e.g. after the source's UI refreshed.
    Exact,
    /// A republication where only peripheral fields changed (price, end
    /// time formatting, URL).
    Similar,
}

impl fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DuplicateReason::Exact => write!(f, "exact"),
            DuplicateReason::Similar => write!(f, "similar"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub reason: Option<DuplicateReason>,
}

impl DuplicateCheck {
    fn miss() -> Self {
        Self {
            is_duplicate: false,
            reason: None,
        }
    }

    fn hit(reason: DuplicateReason) -> Self {
        Self {
            is_duplicate: true,
            reason: Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct DedupStore {
    pool: PgPool,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Look for a live duplicate record. Exact is checked before similar.
    /// Exact compares the whole slot, peripheral fields included; the slot
    /// key alone would make the two relations indistinguishable. A miss
    /// writes nothing; recording is a separate step that only happens after
    /// a successful dispatch.
    pub async fn check_for_duplicate(
        &self,
        subscriber_id: i64,
        slot: &Slot,
    ) -> Result<DuplicateCheck, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).expect("dedup ttl out of chrono range");

        let exact: Option<(i64,)> = sqlx::query_as(
            r#"
SELECT
    1::bigint
FROM
    deduplication_records
WHERE
    subscriber_id = $1
    AND slot_key = $2
    AND end_time = $3
    AND price = $4
    AND booking_url = $5
    AND last_sent_at > $6
            "#,
        )
        .bind(subscriber_id)
        .bind(slot.slot_key())
        .bind(&slot.end_time)
        .bind(slot.price)
        .bind(&slot.booking_url)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))?;

        if exact.is_some() {
            return Ok(DuplicateCheck::hit(DuplicateReason::Exact));
        }

        let similar: Option<(i64,)> = sqlx::query_as(
            r#"
SELECT
    1::bigint
FROM
    deduplication_records
WHERE
    subscriber_id = $1
    AND venue_id = $2
    AND court_id = $3
    AND date = $4
    AND start_time = $5
    AND last_sent_at > $6
            "#,
        )
        .bind(subscriber_id)
        .bind(&slot.venue_id)
        .bind(&slot.court_id)
        .bind(&slot.date)
        .bind(&slot.start_time)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))?;

        if similar.is_some() {
            return Ok(DuplicateCheck::hit(DuplicateReason::Similar));
        }
        Ok(DuplicateCheck::miss())
    }

    /// Upsert the record for a slot that was just notified, resetting its TTL
    /// and refreshing the peripheral fields to the version that was sent.
    pub async fn record_notification(
        &self,
        subscriber_id: i64,
        slot: &Slot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO deduplication_records
    (subscriber_id, slot_key, venue_id, court_id, date, start_time, end_time,
     price, booking_url, last_sent_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
ON CONFLICT (subscriber_id, slot_key) DO UPDATE
SET
    end_time = EXCLUDED.end_time,
    price = EXCLUDED.price,
    booking_url = EXCLUDED.booking_url,
    last_sent_at = NOW()
            "#,
        )
        .bind(subscriber_id)
        .bind(slot.slot_key())
        .bind(&slot.venue_id)
        .bind(&slot.court_id)
        .bind(&slot.date)
        .bind(&slot.start_time)
        .bind(&slot.end_time)
        .bind(slot.price)
        .bind(&slot.booking_url)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::query("INSERT", error))?;

        Ok(())
    }

    /// Drop records whose TTL has elapsed. Returns the number deleted.
    pub async fn prune_expired(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).expect("dedup ttl out of chrono range");

        let result = sqlx::query(
            r#"
DELETE FROM
    deduplication_records
WHERE
    last_sent_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::RawSlotEvent;
    use sqlx::PgPool;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    fn slot_a() -> Slot {
        RawSlotEvent::from_json(
            r#"{
                "venueId": "central",
                "venueName": "Central",
                "courtId": "court1",
                "date": "2025-06-16",
                "startTime": "10:00",
                "endTime": "11:00",
                "price": 25.0,
                "bookingUrl": "https://example.com/a"
            }"#,
        )
        .expect("failed to build slot")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn fresh_slot_is_not_a_duplicate(db: PgPool) {
        let store = DedupStore::new(db, WEEK);

        let check = store.check_for_duplicate(1, &slot_a()).await.unwrap();
        assert!(!check.is_duplicate);
        assert_eq!(check.reason, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn recorded_slot_is_an_exact_duplicate(db: PgPool) {
        let store = DedupStore::new(db, WEEK);
        let slot = slot_a();

        store.record_notification(1, &slot).await.unwrap();

        let check = store.check_for_duplicate(1, &slot).await.unwrap();
        assert!(check.is_duplicate);
        assert_eq!(check.reason, Some(DuplicateReason::Exact));

        // A different subscriber is unaffected.
        let other = store.check_for_duplicate(2, &slot).await.unwrap();
        assert!(!other.is_duplicate);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn republication_with_new_price_is_similar(db: PgPool) {
        let store = DedupStore::new(db, WEEK);
        let slot = slot_a();
        store.record_notification(1, &slot).await.unwrap();

        // Same venue/court/date/start, different price, end time and URL.
        let mut republished = slot.clone();
        republished.price = 20.0;
        republished.end_time = "11:30".to_owned();
        republished.booking_url = "https://example.com/b".to_owned();

        let check = store.check_for_duplicate(1, &republished).await.unwrap();
        assert!(check.is_duplicate);
        assert_eq!(check.reason, Some(DuplicateReason::Similar));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn price_change_alone_downgrades_exact_to_similar(db: PgPool) {
        let store = DedupStore::new(db, WEEK);
        let slot = slot_a();
        store.record_notification(1, &slot).await.unwrap();

        let mut cheaper = slot.clone();
        cheaper.price = 19.0;

        let check = store.check_for_duplicate(1, &cheaper).await.unwrap();
        assert_eq!(check.reason, Some(DuplicateReason::Similar));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn different_start_time_is_not_suppressed(db: PgPool) {
        let store = DedupStore::new(db, WEEK);
        let slot = slot_a();
        store.record_notification(1, &slot).await.unwrap();

        let mut later = slot.clone();
        later.start_time = "12:00".to_owned();
        later.end_time = "13:00".to_owned();

        let check = store.check_for_duplicate(1, &later).await.unwrap();
        assert!(!check.is_duplicate);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn expired_record_no_longer_suppresses(db: PgPool) {
        // Zero TTL: every record is already expired.
        let store = DedupStore::new(db.clone(), Duration::from_secs(0));
        let slot = slot_a();
        store.record_notification(1, &slot).await.unwrap();

        let check = store.check_for_duplicate(1, &slot).await.unwrap();
        assert!(!check.is_duplicate);

        let pruned = store.prune_expired().await.unwrap();
        assert_eq!(pruned, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn record_notification_is_idempotent(db: PgPool) {
        let store = DedupStore::new(db, WEEK);
        let slot = slot_a();

        store.record_notification(1, &slot).await.unwrap();
        store.record_notification(1, &slot).await.unwrap();

        let pruned = DedupStore::new(store.pool.clone(), Duration::from_secs(0))
            .prune_expired()
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }
}
