//! Week-of matching: timezone-aware date windows for imprecise provider dates.
//!
//! Providers routinely advertise "week of June 10" sessions whose exact start
//! times are off by a day or only known to the hour. Matching is therefore a
//! half-open 7-day window test anchored on the Monday of the requested week,
//! evaluated in the provider's local timezone:
//!
//! ```text
//! window_start = Monday 00:00 (local) of week_of + offset_days
//! match        = window_start <= session_start < window_start + 7 days
//! ```
//!
//! Bare `YYYY-MM-DD` inputs are read as local midnight in the given zone so
//! that a Monday date stays a Monday regardless of the zone's UTC offset.
//! Nothing in this module panics or errors on bad input: unparseable dates
//! and unknown zones simply never match.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::provider::types::ProviderSessionCandidate;

/// Parse an IANA zone name.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Coerce a date or timestamp string into an instant.
///
/// Accepts RFC 3339 (`2024-06-10T14:00:00-05:00`), naive local timestamps
/// (`2024-06-10T14:00:00` / `2024-06-10 14:00:00`) and bare dates.
pub fn parse_instant(input: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return localize(tz, naive).map(|dt| dt.with_timezone(&Utc));
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| local_midnight(tz, date))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve a naive local time, stepping past a DST gap if needed.
fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Tz>> {
    localize(tz, date.and_hms_opt(0, 0, 0)?)
}

/// Monday (local calendar date) of the week containing `instant`.
pub fn monday_of(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let local = instant.with_timezone(&tz).date_naive();
    local - Duration::days(i64::from(local.weekday().num_days_from_monday()))
}

/// Half-open `[start, end)` window for the week containing `week_of`,
/// shifted by `offset_days`.
pub fn week_window(
    week_of: DateTime<Utc>,
    tz: Tz,
    offset_days: i64,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start_date = monday_of(week_of, tz) + Duration::days(offset_days);
    let start = local_midnight(tz, start_date)?;
    let end = local_midnight(tz, start_date + Duration::days(7))?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Typed form of [`match_week`].
pub fn in_week(week_of: DateTime<Utc>, session_start: DateTime<Utc>, tz: Tz, offset_days: i64) -> bool {
    match week_window(week_of, tz, offset_days) {
        Some((start, end)) => start <= session_start && session_start < end,
        None => false,
    }
}

/// Whether `session_start` falls inside the week of `week_of`.
pub fn match_week(week_of: &str, session_start: &str, timezone: &str, offset_days: i64) -> bool {
    let Some(tz) = parse_timezone(timezone) else {
        return false;
    };
    match (parse_instant(week_of, tz), parse_instant(session_start, tz)) {
        (Some(week), Some(session)) => in_week(week, session, tz, offset_days),
        _ => false,
    }
}

/// Canonical Monday key (`YYYY-MM-DD`) for grouping.
pub fn week_key(instant: DateTime<Utc>, tz: Tz) -> String {
    monday_of(instant, tz).format("%Y-%m-%d").to_string()
}

/// String form of [`week_key`]; `None` for unparseable input.
pub fn get_week_key(timestamp: &str, timezone: &str) -> Option<String> {
    let tz = parse_timezone(timezone)?;
    parse_instant(timestamp, tz).map(|instant| week_key(instant, tz))
}

/// Partition candidates by week key, each bucket sorted by start time.
///
/// Candidates without a start timestamp are skipped.
pub fn group_sessions_by_week(
    candidates: &[ProviderSessionCandidate],
    tz: Tz,
) -> BTreeMap<String, Vec<ProviderSessionCandidate>> {
    let mut groups: BTreeMap<String, Vec<ProviderSessionCandidate>> = BTreeMap::new();
    for candidate in candidates {
        if let Some(start) = candidate.start_at {
            groups
                .entry(week_key(start, tz))
                .or_default()
                .push(candidate.clone());
        }
    }
    for bucket in groups.values_mut() {
        bucket.sort_by_key(|c| c.start_at);
    }
    groups
}

/// Move candidates inside the requested week to the front.
///
/// In-week candidates keep their original relative order, as do the rest;
/// candidates without a start time count as out of week. An unparseable
/// `date` leaves the list untouched.
pub fn rank_candidates(
    mut candidates: Vec<ProviderSessionCandidate>,
    date: &str,
    tz: Tz,
    offset_days: i64,
) -> Vec<ProviderSessionCandidate> {
    let Some(week_of) = parse_instant(date, tz) else {
        return candidates;
    };

    let rank: HashMap<String, usize> = candidates
        .iter()
        .filter(|c| {
            c.start_at
                .is_some_and(|start| in_week(week_of, start, tz, offset_days))
        })
        .enumerate()
        .map(|(pos, c)| (c.id.clone(), pos))
        .collect();

    // sort_by_key is stable, so unranked candidates keep their order
    candidates.sort_by_key(|c| rank.get(&c.id).copied().unwrap_or(usize::MAX));
    candidates
}
