//! Country holiday calendars.
//!
//! The crate ships no holiday data. Callers plug in a [`HolidayCalendar`]
//! (for instance a [`HolidayTable`] loaded from their own source) and the
//! forecaster expands the country's entries into holiday features.

use std::collections::BTreeSet;
use std::fmt::Debug;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::time::parse_required;
use crate::Result;

/// Source of dated country holidays.
pub trait HolidayCalendar: Send + Sync + Debug {
    /// `(date, holiday name)` pairs for `country` that fall in `years`.
    fn lookup(&self, country: &str, years: &[i32]) -> Vec<(NaiveDate, String)>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct HolidayRow {
    country: String,
    date: NaiveDate,
    name: String,
}

/// In-memory holiday calendar keyed by country code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolidayTable {
    rows: BTreeSet<HolidayRow>,
}

impl HolidayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, country: &str, date: &str, name: &str) -> Result<()> {
        let date = parse_required(date)?.date();
        self.rows.insert(HolidayRow {
            country: country.to_string(),
            date,
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn with_holiday(mut self, country: &str, date: &str, name: &str) -> Result<Self> {
        self.insert(country, date, name)?;
        Ok(self)
    }

    /// Distinct holiday names known for a country.
    pub fn holiday_names(&self, country: &str) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .rows
            .iter()
            .filter(|r| r.country == country)
            .map(|r| r.name.as_str())
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl HolidayCalendar for HolidayTable {
    fn lookup(&self, country: &str, years: &[i32]) -> Vec<(NaiveDate, String)> {
        self.rows
            .iter()
            .filter(|r| r.country == country && years.contains(&r.date.year()))
            .map(|r| (r.date, r.name.clone()))
            .collect()
    }
}

/// Look up a country, warning when the calendar knows nothing about it.
pub(crate) fn country_holidays(
    calendar: &dyn HolidayCalendar,
    country: &str,
    years: &[i32],
) -> Vec<(NaiveDate, String)> {
    let found = calendar.lookup(country, years);
    if found.is_empty() {
        warn!(country, "Holidays in {} are not currently supported", country);
    }
    found
}
