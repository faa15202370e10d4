//! Append-only alert history.
//!
//! One row per email-send attempt per slot, used for audit and for the
//! per-subscriber rate-limit windows. The recorder never expires rows
//! itself; the janitor prunes past the retention window.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::slot::Slot;
use crate::store::StoreError;

/// Delivery outcome attached to each history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Bounced,
    Pending,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Bounced => write!(f, "bounced"),
            DeliveryStatus::Pending => write!(f, "pending"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "bounced" => Ok(DeliveryStatus::Bounced),
            "pending" => Ok(DeliveryStatus::Pending),
            invalid => Err(format!("{invalid} is not a valid DeliveryStatus")),
        }
    }
}

/// A row to append: the subscriber, a denormalized slot descriptor, the
/// destination address and the outcome.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub subscriber_id: i64,
    pub slot_key: String,
    pub venue_name: String,
    pub court_name: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub price: f64,
    pub currency: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub reason: Option<String>,
}

impl AlertRecord {
    pub fn new(
        subscriber_id: i64,
        slot: &Slot,
        recipient: &str,
        status: DeliveryStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            subscriber_id,
            slot_key: slot.slot_key(),
            venue_name: slot.venue_name.clone(),
            court_name: slot.court_name.clone(),
            date: slot.date.clone(),
            start_time: slot.start_time.clone(),
            end_time: slot.end_time.clone(),
            price: slot.price,
            currency: slot.currency.clone(),
            recipient: recipient.to_owned(),
            status,
            reason,
        }
    }
}

#[derive(Clone)]
pub struct AlertRecorder {
    pool: PgPool,
}

impl AlertRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one row per record. Rows are independent; a failure leaves
    /// earlier rows in place.
    pub async fn append(&self, records: &[AlertRecord]) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                r#"
INSERT INTO alert_history
    (subscriber_id, slot_key, venue_name, court_name, date, start_time, end_time,
     price, currency, recipient, status, reason, sent_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
                "#,
            )
            .bind(record.subscriber_id)
            .bind(&record.slot_key)
            .bind(&record.venue_name)
            .bind(&record.court_name)
            .bind(&record.date)
            .bind(&record.start_time)
            .bind(&record.end_time)
            .bind(record.price)
            .bind(&record.currency)
            .bind(&record.recipient)
            .bind(record.status.to_string())
            .bind(&record.reason)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::query("INSERT", error))?;
        }
        Ok(())
    }

    /// Count send attempts for a subscriber in the trailing window.
    /// Failed attempts count too: a cap bounds outbound pressure, not luck.
    pub async fn count_for_subscriber(
        &self,
        subscriber_id: i64,
        since: chrono::Duration,
    ) -> Result<i64, StoreError> {
        let cutoff = Utc::now() - since;

        let (count,): (i64,) = sqlx::query_as(
            r#"
SELECT
    COUNT(*)
FROM
    alert_history
WHERE
    subscriber_id = $1
    AND sent_at > $2
            "#,
        )
        .bind(subscriber_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::query("SELECT", error))?;

        Ok(count)
    }

    /// Delete rows older than the cutoff. Returns the number deleted.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
DELETE FROM
    alert_history
WHERE
    sent_at <= $1
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

    fn slot() -> Slot {
        RawSlotEvent::from_json(
            r#"{
                "venueId": "central",
                "venueName": "Central",
                "courtId": "court1",
                "date": "2025-06-16",
                "startTime": "10:00",
                "endTime": "11:00",
                "price": 25.0
            }"#,
        )
        .expect("failed to build slot")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn append_and_count(db: PgPool) {
        let recorder = AlertRecorder::new(db);
        let slot = slot();

        let rows = vec![
            AlertRecord::new(7, &slot, "a@example.com", DeliveryStatus::Sent, None),
            AlertRecord::new(
                7,
                &slot,
                "a@example.com",
                DeliveryStatus::Failed,
                Some("smtp timeout".to_owned()),
            ),
            AlertRecord::new(8, &slot, "b@example.com", DeliveryStatus::Sent, None),
        ];
        recorder.append(&rows).await.unwrap();

        let hourly = recorder
            .count_for_subscriber(7, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(hourly, 2);

        let other = recorder
            .count_for_subscriber(9, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(other, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn prune_deletes_only_old_rows(db: PgPool) {
        let recorder = AlertRecorder::new(db);
        let slot = slot();

        recorder
            .append(&[AlertRecord::new(
                7,
                &slot,
                "a@example.com",
                DeliveryStatus::Sent,
                None,
            )])
            .await
            .unwrap();

        // Rows were written just now: a cutoff in the past removes nothing,
        // a cutoff in the future removes everything.
        let kept = recorder
            .prune_older_than(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(kept, 0);

        let removed = recorder
            .prune_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn delivery_status_round_trips() {
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Failed,
            DeliveryStatus::Bounced,
            DeliveryStatus::Pending,
        ] {
            assert_eq!(status.to_string().parse::<DeliveryStatus>(), Ok(status));
        }
        assert!("shipped".parse::<DeliveryStatus>().is_err());
    }
}
