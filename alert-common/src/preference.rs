use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use crate::store::StoreError;

/// A half-open `[start, end)` wall-clock range, both bounds `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_owned(),
            end: end.to_owned(),
        }
    }
}

/// The matching half of a subscriber's preference record.
///
/// Empty collections mean "anything goes" for that dimension, and a
/// `max_price` of zero means no cap. The matcher in [`crate::matcher`] is the
/// only consumer of these semantics.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Filters {
    pub preferred_venues: Vec<String>,
    pub excluded_venues: Vec<String>,
    /// Lower-cased English weekday names.
    pub preferred_days: Vec<String>,
    pub weekday_windows: Vec<TimeWindow>,
    pub weekend_windows: Vec<TimeWindow>,
    pub max_price: f64,
}

/// The delivery half of a subscriber's preference record.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Skip the coalescing window and dispatch each slot on its own.
    pub instant: bool,
    pub max_per_hour: Option<i64>,
    pub max_per_day: Option<i64>,
    /// Dispatch only inside this daily window when set.
    pub active_hours: Option<TimeWindow>,
}

/// One row of `user_preferences`. Exactly one record per subscriber; the
/// record is mutated by the external API plane and only read here.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Preference {
    pub subscriber_id: i64,
    pub email: String,
    pub enabled: bool,
    pub unsubscribed: bool,
    pub filters: Json<Filters>,
    pub notification: Json<NotificationSettings>,
}

/// Load every active preference: notifications enabled and not unsubscribed.
/// Callers must re-read per dispatch cycle rather than hold a long-lived copy.
pub async fn load_active(pool: &PgPool) -> Result<Vec<Preference>, StoreError> {
    sqlx::query_as(
        r#"
SELECT
    subscriber_id, email, enabled, unsubscribed, filters, notification
FROM
    user_preferences
WHERE
    enabled = TRUE
    AND unsubscribed = FALSE
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|error| StoreError::query("SELECT", error))
}

/// Load one subscriber's preference, active or not.
pub async fn load_by_id(
    pool: &PgPool,
    subscriber_id: i64,
) -> Result<Option<Preference>, StoreError> {
    sqlx::query_as(
        r#"
SELECT
    subscriber_id, email, enabled, unsubscribed, filters, notification
FROM
    user_preferences
WHERE
    subscriber_id = $1
        "#,
    )
    .bind(subscriber_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| StoreError::query("SELECT", error))
}

impl Preference {
    /// Active means the external plane has not switched this subscriber off.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.unsubscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_deserialize_with_defaults() {
        let filters: Filters = serde_json::from_str(r#"{"max_price": 30.0}"#).unwrap();
        assert!(filters.preferred_venues.is_empty());
        assert!(filters.weekday_windows.is_empty());
        assert_eq!(filters.max_price, 30.0);

        let empty: Filters = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.max_price, 0.0);
    }

    #[test]
    fn notification_settings_deserialize_with_defaults() {
        let settings: NotificationSettings = serde_json::from_str("{}").unwrap();
        assert!(!settings.instant);
        assert_eq!(settings.max_per_hour, None);
        assert_eq!(settings.active_hours, None);

        let settings: NotificationSettings = serde_json::from_str(
            r#"{"instant": true, "max_per_hour": 5, "active_hours": {"start": "08:00", "end": "22:00"}}"#,
        )
        .unwrap();
        assert!(settings.instant);
        assert_eq!(settings.max_per_hour, Some(5));
        assert_eq!(
            settings.active_hours,
            Some(TimeWindow::new("08:00", "22:00"))
        );
    }
}
