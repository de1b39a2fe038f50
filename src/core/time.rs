use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::{AuguryError, Result};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Convert a ds string to NaiveDateTime.
///
/// Accepts `%Y-%m-%d`, `%Y-%m-%d %H:%M:%S` and the `T`-separated form, each
/// optionally with fractional seconds, plus `%Y-%m-%d %H:%M`.
pub fn parse_ds(ds: &str) -> Option<NaiveDateTime> {
    let ds = ds.trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(d) = NaiveDateTime::parse_from_str(ds, fmt) {
            return Some(d);
        }
    }
    NaiveDate::parse_from_str(ds, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_required(ds: &str) -> Result<NaiveDateTime> {
    parse_ds(ds).ok_or_else(|| AuguryError::Data(format!("Unable to parse ds value {:?}", ds)))
}

/// Midnight timestamps render as plain dates.
pub fn format_ds(dt: NaiveDateTime) -> String {
    if dt.time().num_seconds_from_midnight() == 0 && dt.nanosecond() == 0 {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }
}

pub fn duration_seconds(d: Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => d.num_milliseconds() as f64 / 1_000.0,
    }
}

pub fn duration_days(d: Duration) -> f64 {
    duration_seconds(d) / SECONDS_PER_DAY
}

/// Fractional days since the Unix epoch; the Fourier basis is anchored here.
pub fn days_since_epoch(dt: NaiveDateTime) -> f64 {
    dt.and_utc().timestamp_micros() as f64 / 1_000_000.0 / SECONDS_PER_DAY
}

pub fn days(d: f64) -> Duration {
    Duration::microseconds((d * SECONDS_PER_DAY * 1_000_000.0).round() as i64)
}

/// Sampling frequency for generated future timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    /// Fixed interval in seconds ("30S", "900S", ...)
    Seconds(u64),
    Hourly,
    Daily,
    Weekly,
    MonthStart,
    QuarterStart,
    YearStart,
}

impl FromStr for Frequency {
    type Err = AuguryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "H" | "h" => Ok(Frequency::Hourly),
            "D" | "d" => Ok(Frequency::Daily),
            "W" | "w" => Ok(Frequency::Weekly),
            "MS" => Ok(Frequency::MonthStart),
            "QS" => Ok(Frequency::QuarterStart),
            "YS" | "AS" => Ok(Frequency::YearStart),
            _ => {
                let secs = s
                    .strip_suffix('S')
                    .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|&n| n > 0);
                secs.map(Frequency::Seconds)
                    .ok_or_else(|| AuguryError::Frequency(format!("Unknown freq: {}", s)))
            }
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Seconds(n) => write!(f, "{}S", n),
            Frequency::Hourly => write!(f, "H"),
            Frequency::Daily => write!(f, "D"),
            Frequency::Weekly => write!(f, "W"),
            Frequency::MonthStart => write!(f, "MS"),
            Frequency::QuarterStart => write!(f, "QS"),
            Frequency::YearStart => write!(f, "YS"),
        }
    }
}

fn period_anchor(last: NaiveDateTime, months_per_step: u32) -> Result<NaiveDateTime> {
    let month = match months_per_step {
        1 => last.month(),
        3 => (last.month() - 1) / 3 * 3 + 1,
        _ => 1,
    };
    NaiveDate::from_ymd_opt(last.year(), month, 1)
        .map(|d| d.and_time(last.time()))
        .ok_or_else(|| AuguryError::Frequency(format!("No period start for {}", last)))
}

/// Generate `periods` timestamps strictly after `last`.
///
/// Month, quarter and year frequencies land on the first day of the period
/// (keeping the time of day of `last`), stepping by calendar months.
pub fn future_dates(
    last: NaiveDateTime,
    periods: usize,
    freq: Frequency,
) -> Result<Vec<NaiveDateTime>> {
    let fixed = |step: Duration| -> Vec<NaiveDateTime> {
        (1..=periods as i32).map(|i| last + step * i).collect()
    };
    let calendar = |months: u32| -> Result<Vec<NaiveDateTime>> {
        let anchor = period_anchor(last, months)?;
        (1..=periods as u32)
            .map(|i| {
                anchor.checked_add_months(Months::new(i * months)).ok_or_else(|| {
                    AuguryError::Frequency(format!("Date overflow stepping {} months", i * months))
                })
            })
            .collect()
    };
    match freq {
        Frequency::Seconds(n) => {
            let secs = i64::try_from(n)
                .map_err(|_| AuguryError::Frequency(format!("Interval too large: {}S", n)))?;
            Ok(fixed(Duration::seconds(secs)))
        }
        Frequency::Hourly => Ok(fixed(Duration::hours(1))),
        Frequency::Daily => Ok(fixed(Duration::days(1))),
        Frequency::Weekly => Ok(fixed(Duration::weeks(1))),
        Frequency::MonthStart => calendar(1),
        Frequency::QuarterStart => calendar(3),
        Frequency::YearStart => calendar(12),
    }
}

/// Guess the sampling frequency from timestamp alignment.
///
/// Coarsest match wins: year start, quarter start, month start, a single
/// weekday, whole days, whole hours.
pub fn infer_frequency(times: &[NaiveDateTime]) -> Result<Frequency> {
    if times.is_empty() {
        return Err(AuguryError::Frequency("No timestamps to infer from".to_string()));
    }
    let minute = times.iter().all(|t| t.second() == 0 && t.nanosecond() == 0);
    let hour = minute && times.iter().all(|t| t.minute() == 0);
    let day = hour && times.iter().all(|t| t.hour() == 0);
    let week = day && times.iter().all(|t| t.weekday() == times[0].weekday());
    let month = day && times.iter().all(|t| t.day() == 1);
    let quarter = month && times.iter().all(|t| t.month() % 3 == 1);
    let year = quarter && times.iter().all(|t| t.month() == 1);

    if year {
        Ok(Frequency::YearStart)
    } else if quarter {
        Ok(Frequency::QuarterStart)
    } else if month {
        Ok(Frequency::MonthStart)
    } else if week {
        Ok(Frequency::Weekly)
    } else if day {
        Ok(Frequency::Daily)
    } else if hour {
        Ok(Frequency::Hourly)
    } else {
        Err(AuguryError::Frequency("Unknown frequency".to_string()))
    }
}
