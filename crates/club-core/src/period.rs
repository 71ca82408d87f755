//! Calendar arithmetic for billing periods.
//!
//! Periods are defined on the club's local calendar (the configured time zone)
//! and stored in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::interval::ValidationError;

/// Local hour at which a paid period opens on the first of the month.
pub const PERIOD_START_HOUR: u32 = 12;

/// A paid entitlement window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Computes the window bought by a payment.
///
/// The period opens on the first day of `start_month` at 12:00 local time and
/// closes on the last day of month `start_month + paid_months - 1` at 23:59.
pub fn billing_period(
    start_year: i32,
    start_month: u32,
    paid_months: i64,
    tz: Tz,
) -> Result<BillingPeriod, ValidationError> {
    if !(1..=12).contains(&start_month) {
        return Err(ValidationError::InvalidMonth(start_month));
    }
    if paid_months < 1 {
        return Err(ValidationError::NonPositiveMonths(paid_months));
    }

    let first = i64::from(start_year) * 12 + i64::from(start_month - 1);
    let last = first + paid_months - 1;
    let end_year = i32::try_from(last.div_euclid(12))
        .map_err(|_| ValidationError::NonPositiveMonths(paid_months))?;
    let end_month = u32::try_from(last.rem_euclid(12) + 1)
        .map_err(|_| ValidationError::InvalidMonth(start_month))?;

    let start = local_to_utc(tz, start_year, start_month, 1, PERIOD_START_HOUR, 0)?;
    let end_day = last_day_of_month(end_year, end_month);
    let end = local_to_utc(tz, end_year, end_month, end_day, 23, 59)?;

    Ok(BillingPeriod { start, end })
}

/// Returns the number of the last day of the given month.
pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |last| last.day())
}

/// Returns the UTC bounds `[start, end)` of the local calendar day containing `now`.
pub fn local_day_bounds(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = now.with_timezone(&tz).date_naive();
    let start = start_of_local_day(date, tz).unwrap_or(now);
    let end = date
        .succ_opt()
        .and_then(|next| start_of_local_day(next, tz))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

/// Returns the UTC bounds `[start, end)` of the last local day of the month containing `now`.
pub fn last_day_bounds(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&tz);
    let day = last_day_of_month(local.year(), local.month());
    NaiveDate::from_ymd_opt(local.year(), local.month(), day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map_or_else(
            || local_day_bounds(now, tz),
            |start| local_day_bounds(start.with_timezone(&Utc), tz),
        )
}

/// Returns the UTC instant of local midnight on the first day of the month containing `now`.
pub fn local_month_start(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
        .and_then(|first| start_of_local_day(first, tz))
        .unwrap_or_else(|| local_day_bounds(now, tz).0)
}

/// Converts a local wall-clock time to UTC.
pub fn local_to_utc(
    tz: Tz,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Result<DateTime<Utc>, ValidationError> {
    let nonexistent = || ValidationError::NonexistentLocalTime {
        year,
        month,
        day,
        hour,
        minute,
    };
    let naive: NaiveDateTime = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or_else(nonexistent)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(nonexistent)
}

fn start_of_local_day(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
