//! The preference matcher shared by the notifier and the retention worker.
//!
//! Both sides must agree on what "of interest" means: the notifier asks it to
//! decide whether to alert, retention asks it to decide whether a stale slot
//! is still wanted by anyone. Keeping a single pure function here is what
//! makes that agreement structural instead of aspirational.

use chrono::Weekday;
use thiserror::Error;

use crate::preference::Filters;
use crate::slot::{parse_hhmm, Slot};

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("{0} is not a valid HH:MM time")]
    InvalidTime(String),
    #[error("{0} is not a valid YYYY-MM-DD date")]
    InvalidDate(String),
}

/// Decide whether a slot satisfies a subscriber's filters.
///
/// The decision is the conjunction of four predicates, evaluated in order
/// with short-circuit: venue, day, time window, price. Deterministic, and a
/// function of the two arguments only. Malformed times or dates surface as
/// an error; callers treat the subject as non-matching and count it.
pub fn matches(slot: &Slot, filters: &Filters) -> Result<bool, MatchError> {
    Ok(venue_matches(slot, filters)
        && day_matches(slot, filters)?
        && time_matches(slot, filters)?
        && price_matches(slot, filters))
}

/// Exclusions win over preferences; an empty preferred set accepts any venue.
/// Venues are named by id or display name, compared case-insensitively.
fn venue_matches(slot: &Slot, filters: &Filters) -> bool {
    let names_slot = |token: &String| {
        token.eq_ignore_ascii_case(&slot.venue_id) || token.eq_ignore_ascii_case(&slot.venue_name)
    };

    if filters.excluded_venues.iter().any(names_slot) {
        return false;
    }
    filters.preferred_venues.is_empty() || filters.preferred_venues.iter().any(names_slot)
}

fn day_matches(slot: &Slot, filters: &Filters) -> Result<bool, MatchError> {
    if filters.preferred_days.is_empty() {
        return Ok(true);
    }
    let weekday = weekday_name(slot.weekday().map_err(|_| {
        MatchError::InvalidDate(slot.date.clone())
    })?);
    Ok(filters
        .preferred_days
        .iter()
        .any(|day| day.eq_ignore_ascii_case(weekday)))
}

/// The slot's `[start, end)` must overlap at least one configured window for
/// the applicable day class. Touching intervals do not overlap.
fn time_matches(slot: &Slot, filters: &Filters) -> Result<bool, MatchError> {
    let windows = if slot.is_weekend().map_err(|_| MatchError::InvalidDate(slot.date.clone()))? {
        &filters.weekend_windows
    } else {
        &filters.weekday_windows
    };
    if windows.is_empty() {
        return Ok(true);
    }

    let start = minutes(&slot.start_time)?;
    let end = minutes(&slot.end_time)?;

    for window in windows {
        let w_start = minutes(&window.start)?;
        let w_end = minutes(&window.end)?;
        if start < w_end && w_start < end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A zero cap means no cap, not free-only.
fn price_matches(slot: &Slot, filters: &Filters) -> bool {
    filters.max_price == 0.0 || slot.price <= filters.max_price
}

fn minutes(hhmm: &str) -> Result<u16, MatchError> {
    parse_hhmm(hhmm).ok_or_else(|| MatchError::InvalidTime(hhmm.to_owned()))
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// True when any of the supplied filter sets matches the slot. Used by
/// retention to decide whether a slot is safe to delete; match errors are
/// reported to the caller rather than swallowed.
pub fn matches_any<'f, I>(slot: &Slot, filters: I) -> Result<bool, MatchError>
where
    I: IntoIterator<Item = &'f Filters>,
{
    for candidate in filters {
        if matches(slot, candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}
