use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of errors produced while decoding and validating slot events.
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("undecodable slot event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0} is not a valid YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("{0} is not a valid HH:MM time")]
    InvalidTime(String),
    #[error("slot interval is empty or inverted: {start}..{end}")]
    EmptyInterval { start: String, end: String },
    #[error("negative price: {0}")]
    NegativePrice(f64),
}

/// A court availability event as published by the scraping fleet.
///
/// The payload is loosely typed JSON; we decode it into explicit optional
/// fields and drop anything we don't recognize. Scrapers written at different
/// times disagree on casing, hence the aliases.
#[derive(Debug, Deserialize)]
pub struct RawSlotEvent {
    #[serde(alias = "venueId")]
    pub venue_id: String,
    #[serde(alias = "venueName")]
    pub venue_name: Option<String>,
    #[serde(alias = "courtId")]
    pub court_id: String,
    #[serde(alias = "courtName")]
    pub court_name: Option<String>,
    pub date: String,
    #[serde(alias = "startTime")]
    pub start_time: String,
    #[serde(alias = "endTime")]
    pub end_time: String,
    pub price: f64,
    pub currency: Option<String>,
    #[serde(alias = "bookingUrl")]
    pub booking_url: Option<String>,
    #[serde(alias = "discoveredAt")]
    pub discovered_at: Option<DateTime<Utc>>,
}

/// A validated, immutable court availability slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub venue_id: String,
    pub venue_name: String,
    pub court_id: String,
    pub court_name: String,
    /// Calendar date in the venue's local interpretation, `YYYY-MM-DD`.
    pub date: String,
    /// Wall-clock `HH:MM`, 24-hour.
    pub start_time: String,
    pub end_time: String,
    pub price: f64,
    pub currency: String,
    pub booking_url: String,
    pub discovered_at: DateTime<Utc>,
}

impl RawSlotEvent {
    /// Decode a queue payload into a validated [`Slot`].
    pub fn from_json(payload: &str) -> Result<Slot, SlotError> {
        let raw: RawSlotEvent = serde_json::from_str(payload)?;
        raw.validate()
    }

    fn validate(self) -> Result<Slot, SlotError> {
        parse_date(&self.date)?;
        let start = parse_hhmm(&self.start_time)
            .ok_or_else(|| SlotError::InvalidTime(self.start_time.clone()))?;
        let end = parse_hhmm(&self.end_time)
            .ok_or_else(|| SlotError::InvalidTime(self.end_time.clone()))?;
        if start >= end {
            return Err(SlotError::EmptyInterval {
                start: self.start_time,
                end: self.end_time,
            });
        }
        if self.price < 0.0 {
            return Err(SlotError::NegativePrice(self.price));
        }

        Ok(Slot {
            venue_name: self.venue_name.unwrap_or_else(|| self.venue_id.clone()),
            court_name: self.court_name.unwrap_or_else(|| self.court_id.clone()),
            venue_id: self.venue_id,
            court_id: self.court_id,
            date: self.date,
            start_time: self.start_time,
            end_time: self.end_time,
            price: self.price,
            currency: self.currency.unwrap_or_else(|| "GBP".to_owned()),
            booking_url: self.booking_url.unwrap_or_default(),
            discovered_at: self.discovered_at.unwrap_or_else(Utc::now),
        })
    }
}

impl Slot {
    /// Canonical fingerprint of the slot's position in space-time.
    /// Two slots with the same key are the same opportunity.
    pub fn slot_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.venue_id, self.date, self.start_time, self.court_id
        )
    }

    /// The weekday the slot falls on.
    pub fn weekday(&self) -> Result<Weekday, SlotError> {
        Ok(parse_date(&self.date)?.weekday())
    }

    pub fn is_weekend(&self) -> Result<bool, SlotError> {
        Ok(matches!(self.weekday()?, Weekday::Sat | Weekday::Sun))
    }
}

/// Parse a `HH:MM` 24-hour string into minutes since midnight.
/// Returns None for anything else, including `H:MM` and out-of-range values.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (hh, mm) = s.split_once(':')?;
    if hh.len() != 2 || mm.len() != 2 {
        return None;
    }
    let hours: u16 = hh.parse().ok()?;
    let minutes: u16 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, SlotError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| SlotError::InvalidDate(s.to_owned()))
}

/// Render a monetary value for display, two decimal places.
pub fn format_price(price: f64, currency: &str) -> String {
    match currency {
        "GBP" => format!("£{:.2}", price),
        "EUR" => format!("€{:.2}", price),
        "USD" => format!("${:.2}", price),
        other => format!("{:.2} {}", price, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_event() {
        let payload = r#"{
            "venueId": "central",
            "venueName": "Central Park Courts",
            "courtId": "court1",
            "courtName": "Court 1",
            "date": "2025-06-16",
            "startTime": "10:00",
            "endTime": "11:00",
            "price": 25.0,
            "currency": "GBP",
            "bookingUrl": "https://booking.example.com/central/court1"
        }"#;

        let slot = RawSlotEvent::from_json(payload).expect("failed to decode");
        assert_eq!(slot.venue_name, "Central Park Courts");
        assert_eq!(slot.slot_key(), "central|2025-06-16|10:00|court1");
        assert_eq!(slot.currency, "GBP");
    }

    #[test]
    fn decode_tolerates_unknown_fields_and_fills_defaults() {
        let payload = r#"{
            "venue_id": "riverside",
            "court_id": "c2",
            "date": "2025-06-21",
            "start_time": "09:00",
            "end_time": "10:00",
            "price": 12.5,
            "scraper_version": "1.4.2",
            "surface": "clay"
        }"#;

        let slot = RawSlotEvent::from_json(payload).expect("failed to decode");
        assert_eq!(slot.venue_name, "riverside");
        assert_eq!(slot.court_name, "c2");
        assert_eq!(slot.currency, "GBP");
        assert_eq!(slot.booking_url, "");
    }

    #[test]
    fn decode_rejects_inverted_interval() {
        let payload = r#"{
            "venueId": "central",
            "courtId": "c1",
            "date": "2025-06-16",
            "startTime": "11:00",
            "endTime": "10:00",
            "price": 25.0
        }"#;

        assert!(matches!(
            RawSlotEvent::from_json(payload),
            Err(SlotError::EmptyInterval { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_date_and_time() {
        let bad_date = r#"{"venueId":"v","courtId":"c","date":"16/06/2025","startTime":"10:00","endTime":"11:00","price":1.0}"#;
        assert!(matches!(
            RawSlotEvent::from_json(bad_date),
            Err(SlotError::InvalidDate(_))
        ));

        let bad_time = r#"{"venueId":"v","courtId":"c","date":"2025-06-16","startTime":"10am","endTime":"11:00","price":1.0}"#;
        assert!(matches!(
            RawSlotEvent::from_json(bad_time),
            Err(SlotError::InvalidTime(_))
        ));
    }

    #[test]
    fn parse_hhmm_handles_boundaries() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("23:59"), Some(23 * 60 + 59));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("10:60"), None);
        assert_eq!(parse_hhmm("9:30"), None);
        assert_eq!(parse_hhmm("0930"), None);
    }

    #[test]
    fn weekday_and_weekend() {
        let mut slot = RawSlotEvent::from_json(
            r#"{"venueId":"v","courtId":"c","date":"2025-06-21","startTime":"10:00","endTime":"11:00","price":1.0}"#,
        )
        .unwrap();
        assert_eq!(slot.weekday().unwrap(), Weekday::Sat);
        assert!(slot.is_weekend().unwrap());

        slot.date = "2025-06-16".to_owned();
        assert_eq!(slot.weekday().unwrap(), Weekday::Mon);
        assert!(!slot.is_weekend().unwrap());
    }

    #[test]
    fn format_price_rounds_to_two_decimals() {
        assert_eq!(format_price(25.0, "GBP"), "£25.00");
        assert_eq!(format_price(12.345, "GBP"), "£12.35");
        assert_eq!(format_price(9.999, "GBP"), "£10.00");
        assert_eq!(format_price(7.5, "CHF"), "7.50 CHF");
    }
}
