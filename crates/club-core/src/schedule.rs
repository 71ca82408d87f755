//! Calendar and fixed-interval triggers.
//!
//! Triggers are written as short strings so they read well in configuration:
//!
//! - `every 10m`, `every 2h`, `every 30s`
//! - `monthly 1 12:00` (day of month, local time)
//! - `monthly last 12:00` (last day of every month)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::period::{last_day_of_month, local_to_utc};

/// How far ahead a monthly trigger searches for its next instant.
const MONTH_SEARCH_LIMIT: i64 = 48;

/// Day-of-month field of a calendar trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthDay {
    Day(u32),
    Last,
}

/// When a scheduled job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fixed interval, measured from the previous firing.
    Every(Duration),
    /// Fixed calendar fields, evaluated in the club's time zone.
    Monthly { day: MonthDay, hour: u32, minute: u32 },
}

impl Trigger {
    /// Returns the first firing instant strictly after `after`.
    ///
    /// Months that lack the requested day (e.g. the 31st) are skipped.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match *self {
            Self::Every(period) => Some(after + period),
            Self::Monthly { day, hour, minute } => {
                let local = after.with_timezone(&tz);
                let base = i64::from(local.year()) * 12 + i64::from(local.month0());
                (0..MONTH_SEARCH_LIMIT).find_map(|offset| {
                    let index = base + offset;
                    let year = i32::try_from(index.div_euclid(12)).ok()?;
                    let month = u32::try_from(index.rem_euclid(12) + 1).ok()?;
                    let last = last_day_of_month(year, month);
                    let day = match day {
                        MonthDay::Day(n) if n <= last => n,
                        MonthDay::Day(_) => return None,
                        MonthDay::Last => last,
                    };
                    local_to_utc(tz, year, month, day, hour, minute)
                        .ok()
                        .filter(|candidate| *candidate > after)
                })
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(period) => {
                let secs = period.num_seconds();
                if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
            Self::Monthly { day, hour, minute } => {
                let day = match day {
                    MonthDay::Day(n) => n.to_string(),
                    MonthDay::Last => "last".to_string(),
                };
                write!(f, "monthly {day} {hour:02}:{minute:02}")
            }
        }
    }
}

/// Error type for malformed trigger strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trigger {input:?}: {reason}")]
pub struct TriggerParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Trigger {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| TriggerParseError {
            input: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.split_whitespace().collect();
        match parts.as_slice() {
            ["every", amount] => {
                let split = amount
                    .find(|c: char| !c.is_ascii_digit())
                    .ok_or_else(|| fail("missing unit (s, m or h)"))?;
                let (value, unit) = amount.split_at(split);
                let value: i64 = value.parse().map_err(|_| fail("invalid number"))?;
                if value <= 0 {
                    return Err(fail("interval must be positive"));
                }
                let period = match unit {
                    "s" => Duration::seconds(value),
                    "m" => Duration::minutes(value),
                    "h" => Duration::hours(value),
                    _ => return Err(fail("unit must be s, m or h")),
                };
                Ok(Self::Every(period))
            }
            ["monthly", day, time] => {
                let day = if *day == "last" {
                    MonthDay::Last
                } else {
                    let n: u32 = day.parse().map_err(|_| fail("invalid day of month"))?;
                    if !(1..=31).contains(&n) {
                        return Err(fail("day of month must be 1-31 or last"));
                    }
                    MonthDay::Day(n)
                };
                let (hour, minute) = time
                    .split_once(':')
                    .ok_or_else(|| fail("time must be HH:MM"))?;
                let hour: u32 = hour.parse().map_err(|_| fail("invalid hour"))?;
                let minute: u32 = minute.parse().map_err(|_| fail("invalid minute"))?;
                if hour > 23 || minute > 59 {
                    return Err(fail("time out of range"));
                }
                Ok(Self::Monthly { day, hour, minute })
            }
            _ => Err(fail("expected `every <n><unit>` or `monthly <day|last> HH:MM`")),
        }
    }
}

impl Serialize for Trigger {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Trigger {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Moscow;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid test timestamp")
    }

    fn parse(s: &str) -> Trigger {
        s.parse().expect("valid trigger")
    }

    #[test]
    fn every_trigger_adds_its_period() {
        let trigger = parse("every 10m");
        assert_eq!(
            trigger.next_after(utc(2024, 9, 1, 0, 0), Moscow),
            Some(utc(2024, 9, 1, 0, 10))
        );
    }

    #[test]
    fn monthly_trigger_fires_later_the_same_day() {
        let trigger = parse("monthly 1 12:00");
        // 08:00 UTC is 11:00 in Moscow
        assert_eq!(
            trigger.next_after(utc(2024, 9, 1, 8, 0), Moscow),
            Some(utc(2024, 9, 1, 9, 0))
        );
    }

    #[test]
    fn monthly_trigger_is_strictly_after() {
        let trigger = parse("monthly 1 12:00");
        assert_eq!(
            trigger.next_after(utc(2024, 9, 1, 9, 0), Moscow),
            Some(utc(2024, 10, 1, 9, 0))
        );
    }

    #[test]
    fn monthly_trigger_rolls_over_the_year() {
        let trigger = parse("monthly 25 17:00");
        assert_eq!(
            trigger.next_after(utc(2024, 12, 26, 0, 0), Moscow),
            Some(utc(2025, 1, 25, 14, 0))
        );
    }

    #[test]
    fn day_31_skips_short_months() {
        let trigger = parse("monthly 31 12:00");
        assert_eq!(
            trigger.next_after(utc(2024, 4, 1, 0, 0), Moscow),
            Some(utc(2024, 5, 31, 9, 0))
        );
    }

    #[test]
    fn last_day_tracks_month_length() {
        let trigger = parse("monthly last 12:00");
        assert_eq!(
            trigger.next_after(utc(2024, 2, 1, 0, 0), Moscow),
            Some(utc(2024, 2, 29, 9, 0))
        );
        assert_eq!(
            trigger.next_after(utc(2024, 2, 29, 9, 0), Moscow),
            Some(utc(2024, 3, 31, 9, 0))
        );
    }

    #[test]
    fn display_roundtrips() {
        for s in [
            "every 10m",
            "every 2h",
            "every 45s",
            "monthly 1 12:00",
            "monthly last 09:05",
        ] {
            assert_eq!(parse(s).to_string(), s);
        }
    }

    #[test]
    fn malformed_triggers_are_rejected() {
        for s in [
            "",
            "every",
            "every 10",
            "every 0m",
            "every 10d",
            "monthly 0 12:00",
            "monthly 32 12:00",
            "monthly 1 24:00",
            "monthly 1 noon",
            "weekly 1 12:00",
        ] {
            assert!(s.parse::<Trigger>().is_err(), "{s:?} should be rejected");
        }
    }

    #[test]
    fn deserializes_from_string() {
        let trigger: Trigger = serde_json::from_str("\"monthly last 12:00\"").expect("parse");
        assert_eq!(
            trigger,
            Trigger::Monthly {
                day: MonthDay::Last,
                hour: 12,
                minute: 0
            }
        );
    }
}
