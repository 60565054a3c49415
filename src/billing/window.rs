//! Civil calendar windows in Japan Standard Time (UTC+9)
//!
//! Boundaries are computed from a constant offset, never from the host
//! timezone or a tz database:
//! 1. shift `now` forward by nine hours to get the wall clock "as if UTC"
//! 2. truncate to the day, Monday or first of the month
//! 3. shift back by nine hours to recover the absolute instant
//!
//! JST has no daylight saving, so the constant offset is exact.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

use super::types::PeriodKind;

/// Offset of the civil calendar quotas reset on
pub const CIVIL_OFFSET_HOURS: i64 = 9;

fn civil_offset() -> Duration {
    Duration::hours(CIVIL_OFFSET_HOURS)
}

/// The civil offset as a chrono timezone, for display
pub fn civil_timezone() -> FixedOffset {
    FixedOffset::east_opt((CIVIL_OFFSET_HOURS * 3600) as i32).unwrap_or_else(|| Utc.fix())
}

fn civil_date(now: DateTime<Utc>) -> NaiveDate {
    (now + civil_offset()).date_naive()
}

fn civil_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)) - civil_offset()
}

/// 00:00 of the civil day `now` falls on
pub fn civil_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    civil_midnight(civil_date(now))
}

/// 00:00 on the Monday of the civil week `now` falls on
pub fn civil_week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = civil_date(now);
    let since_monday = date.weekday().num_days_from_monday() as i64;
    civil_midnight(date - Duration::days(since_monday))
}

/// 00:00 on the 1st of the civil month `now` falls on
pub fn civil_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = civil_date(now);
    civil_midnight(date.with_day(1).unwrap_or(date))
}

/// All period boundaries for one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivilBounds {
    pub day_start: DateTime<Utc>,
    pub week_start: DateTime<Utc>,
    pub month_start: DateTime<Utc>,
}

pub fn civil_bounds(now: DateTime<Utc>) -> CivilBounds {
    CivilBounds {
        day_start: civil_day_start(now),
        week_start: civil_week_start(now),
        month_start: civil_month_start(now),
    }
}

impl PeriodKind {
    /// Start of the civil period containing `now`
    pub fn boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily => civil_day_start(now),
            Self::Weekly => civil_week_start(now),
            Self::Monthly => civil_month_start(now),
        }
    }
}

/// Half-open interval `[start, end)` usage is counted over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QuotaWindow {
    /// Window for `period` at `now`.
    ///
    /// An anchor later than the civil boundary (billing-cycle start, trial
    /// conversion) moves the start forward so usage from before the anchor
    /// is not counted against the new period.
    pub fn resolve(period: PeriodKind, now: DateTime<Utc>, anchor: Option<DateTime<Utc>>) -> Self {
        let boundary = period.boundary(now);
        let start = match anchor {
            Some(anchor) if anchor > boundary => anchor,
            _ => boundary,
        };
        Self { start, end: now }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
