use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::time::{days_since_epoch, duration_days, parse_required};
use crate::{AuguryError, Result};

/// Column and component names the model itself produces.
const RESERVED_NAMES: [&str; 11] = [
    "trend",
    "additive_terms",
    "daily",
    "weekly",
    "yearly",
    "holidays",
    "zeros",
    "extra_regressors_additive",
    "yhat",
    "extra_regressors_multiplicative",
    "multiplicative_terms",
];

const FRAME_COLUMNS: [&str; 6] = ["ds", "y", "cap", "floor", "y_scaled", "cap_scaled"];

pub(crate) const ZEROS_COLUMN: &str = "zeros";

/// Separates a term's name from its column index in generated feature names.
/// User-supplied names may not contain it, so generated columns stay unique.
pub const COLUMN_DELIMITER: &str = "_delim_";

pub fn is_reserved_name(name: &str) -> bool {
    if FRAME_COLUMNS.contains(&name) {
        return true;
    }
    let base = name
        .strip_suffix("_lower")
        .or_else(|| name.strip_suffix("_upper"))
        .unwrap_or(name);
    RESERVED_NAMES.contains(&base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalityMode {
    #[default]
    Additive,
    Multiplicative,
}

impl FromStr for SeasonalityMode {
    type Err = AuguryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "additive" => Ok(SeasonalityMode::Additive),
            "multiplicative" => Ok(SeasonalityMode::Multiplicative),
            _ => Err(AuguryError::Configuration(format!(
                "Invalid mode: {}. Must be 'additive' or 'multiplicative'.",
                s
            ))),
        }
    }
}

impl fmt::Display for SeasonalityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeasonalityMode::Additive => f.write_str("additive"),
            SeasonalityMode::Multiplicative => f.write_str("multiplicative"),
        }
    }
}

/// Built-in seasonality switch, resolved once against the training span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeasonalityToggle {
    /// Enabled unless the history is too short or too coarse.
    #[default]
    Auto,
    /// Always enabled with the given Fourier order.
    Forced(usize),
    Disabled,
}

/// A custom seasonality as registered by the caller. Unset prior scale and
/// mode fall back to the model defaults when registered.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonalityConfig {
    pub name: String,
    pub period: f64,
    pub fourier_order: usize,
    pub prior_scale: Option<f64>,
    pub mode: Option<SeasonalityMode>,
    pub condition_name: Option<String>,
}

impl SeasonalityConfig {
    pub fn new(name: &str, period: f64, fourier_order: usize) -> Self {
        Self {
            name: name.to_string(),
            period,
            fourier_order,
            prior_scale: None,
            mode: None,
            condition_name: None,
        }
    }

    pub fn with_prior_scale(mut self, scale: f64) -> Self {
        self.prior_scale = Some(scale);
        self
    }

    pub fn with_mode(mut self, mode: SeasonalityMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Only rows where the boolean column `condition` is true get this seasonality.
    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition_name = Some(condition.to_string());
        self
    }
}

/// A seasonality with every setting resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seasonality {
    pub name: String,
    pub period: f64,
    pub fourier_order: usize,
    pub prior_scale: f64,
    pub mode: SeasonalityMode,
    pub condition_name: Option<String>,
}

/// Holiday occurrences sharing one name and one day window.
#[derive(Debug, Clone, PartialEq)]
pub struct HolidayConfig {
    pub name: String,
    pub dates: Vec<String>,
    pub lower_window: i32,
    pub upper_window: i32,
    pub prior_scale: Option<f64>,
}

impl HolidayConfig {
    pub fn new(name: &str, dates: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            dates,
            lower_window: 0,
            upper_window: 0,
            prior_scale: None,
        }
    }

    /// Days before (`lower <= 0`) and after (`upper >= 0`) each date to include.
    pub fn with_windows(mut self, lower: i32, upper: i32) -> Self {
        self.lower_window = lower;
        self.upper_window = upper;
        self
    }

    pub fn with_prior_scale(mut self, scale: f64) -> Self {
        self.prior_scale = Some(scale);
        self
    }
}

/// One dated holiday occurrence with its window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolidayEvent {
    pub name: String,
    pub date: NaiveDate,
    pub lower_window: i32,
    pub upper_window: i32,
    pub prior_scale: f64,
    /// Country calendar entries only apply to the years being featurized.
    #[serde(default)]
    pub from_calendar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Standardize {
    /// Standardize unless the column is binary 0/1.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressorConfig {
    pub name: String,
    pub prior_scale: Option<f64>,
    pub standardize: Standardize,
    pub mode: Option<SeasonalityMode>,
}

impl RegressorConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prior_scale: None,
            standardize: Standardize::Auto,
            mode: None,
        }
    }

    pub fn with_prior_scale(mut self, scale: f64) -> Self {
        self.prior_scale = Some(scale);
        self
    }

    pub fn with_standardize(mut self, standardize: Standardize) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn with_mode(mut self, mode: SeasonalityMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A registered regressor; `mu`/`std` are fixed by the first fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regressor {
    pub name: String,
    pub prior_scale: f64,
    pub standardize: Standardize,
    pub mode: SeasonalityMode,
    pub mu: f64,
    pub std: f64,
}

impl Regressor {
    /// Compute standardization stats from the training column.
    pub fn fit_stats(&mut self, values: &[f64]) {
        self.mu = 0.0;
        self.std = 1.0;
        if self.standardize == Standardize::Never || values.len() < 2 {
            return;
        }
        let distinct: BTreeSet<u64> = values.iter().map(|v| v.to_bits()).collect();
        let binary = distinct.len() == 2
            && values.iter().all(|&v| v == 0.0 || v == 1.0);
        if self.standardize == Standardize::Auto && binary {
            return;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = var.sqrt();
        if std == 0.0 || !std.is_finite() {
            return;
        }
        self.mu = mean;
        self.std = std;
    }

    pub fn standardize_column(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| (v - self.mu) / self.std).collect()
    }
}

/// Generate Fourier series features: columns `sin(2*pi*i*t/P), cos(2*pi*i*t/P)`
/// for i = 1..=order, where t is in days since the Unix epoch.
pub fn fourier_series(t_days: &[f64], period: f64, order: usize) -> Array2<f64> {
    let mut x = Array2::zeros((t_days.len(), 2 * order));
    for (i, &ti) in t_days.iter().enumerate() {
        for k in 1..=order {
            let c = 2.0 * PI * (k as f64) * ti / period;
            x[[i, 2 * (k - 1)]] = c.sin();
            x[[i, 2 * (k - 1) + 1]] = c.cos();
        }
    }
    x
}

/// Expand holiday configs into dated events, validating names and windows.
pub fn holiday_events(config: &HolidayConfig, default_prior: f64) -> Result<Vec<HolidayEvent>> {
    if config.lower_window > 0 {
        return Err(AuguryError::Configuration(
            "Holiday lower_window should be <= 0".to_string(),
        ));
    }
    if config.upper_window < 0 {
        return Err(AuguryError::Configuration(
            "Holiday upper_window should be >= 0".to_string(),
        ));
    }
    let prior_scale = config.prior_scale.unwrap_or(default_prior);
    check_prior_scale(prior_scale)?;
    config
        .dates
        .iter()
        .map(|d| {
            Ok(HolidayEvent {
                name: config.name.clone(),
                date: parse_required(d)?.date(),
                lower_window: config.lower_window,
                upper_window: config.upper_window,
                prior_scale,
                from_calendar: false,
            })
        })
        .collect()
}

pub fn check_prior_scale(scale: f64) -> Result<()> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(AuguryError::Configuration(format!(
            "Prior scale must be > 0, got {}",
            scale
        )));
    }
    Ok(())
}

/// Resolve the three built-in seasonalities against the history.
///
/// Under `Auto`, yearly needs 370 days of span, weekly needs 14 days with
/// sub-weekly spacing, daily needs 2 days with sub-daily spacing. A custom
/// seasonality of the same name suppresses the built-in.
pub fn auto_seasonalities(
    history: &[NaiveDateTime],
    toggles: [(&str, SeasonalityToggle); 3],
    custom: &[Seasonality],
    prior_scale: f64,
    mode: SeasonalityMode,
) -> Vec<Seasonality> {
    let (first, last) = match (history.first(), history.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return Vec::new(),
    };
    let span = duration_days(last - first);
    let min_dt = history
        .windows(2)
        .map(|w| duration_days(w[1] - w[0]))
        .fold(f64::INFINITY, f64::min);

    let mut out = Vec::new();
    for (name, toggle) in toggles {
        let (period, default_order, disable) = match name {
            "yearly" => (365.25, 10, span < 370.0),
            "weekly" => (7.0, 3, span < 14.0 || min_dt >= 7.0),
            _ => (1.0, 4, span < 2.0 || min_dt >= 1.0),
        };
        let order = match toggle {
            SeasonalityToggle::Auto => {
                if custom.iter().any(|s| s.name == name) {
                    info!(seasonality = name, "Found custom seasonality, disabling built-in");
                    0
                } else if disable {
                    info!(seasonality = name, "Disabling seasonality, history too short or too coarse");
                    0
                } else {
                    default_order
                }
            }
            SeasonalityToggle::Forced(order) => order,
            SeasonalityToggle::Disabled => 0,
        };
        if order > 0 {
            out.push(Seasonality {
                name: name.to_string(),
                period,
                fourier_order: order,
                prior_scale,
                mode,
                condition_name: None,
            });
        }
    }
    out
}

/// One column of the design matrix and the component it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub component: String,
    /// `None` only for the placeholder column of an otherwise empty matrix.
    pub mode: Option<SeasonalityMode>,
    pub prior_scale: f64,
}

/// Column-index side table: component name to its mode and columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTable {
    pub n_columns: usize,
    pub components: BTreeMap<String, ComponentInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub mode: SeasonalityMode,
    pub columns: Vec<usize>,
}

impl ComponentTable {
    /// Build the table from the column metadata, adding the aggregate groups.
    pub fn new(
        columns: &[FeatureColumn],
        holiday_names: &[String],
        regressor_names: &[String],
        holidays_mode: SeasonalityMode,
    ) -> Self {
        let mut components: BTreeMap<String, ComponentInfo> = BTreeMap::new();
        let mut push = |name: &str, mode: SeasonalityMode, col: usize| {
            components
                .entry(name.to_string())
                .or_insert_with(|| ComponentInfo {
                    mode,
                    columns: Vec::new(),
                })
                .columns
                .push(col);
        };
        for (col, c) in columns.iter().enumerate() {
            let Some(mode) = c.mode else { continue };
            push(&c.component, mode, col);
            let terms = match mode {
                SeasonalityMode::Additive => "additive_terms",
                SeasonalityMode::Multiplicative => "multiplicative_terms",
            };
            push(terms, mode, col);
            if holiday_names.contains(&c.component) {
                push("holidays", holidays_mode, col);
            }
            if regressor_names.contains(&c.component) {
                let group = match mode {
                    SeasonalityMode::Additive => "extra_regressors_additive",
                    SeasonalityMode::Multiplicative => "extra_regressors_multiplicative",
                };
                push(group, mode, col);
            }
        }
        for (name, mode) in [
            ("additive_terms", SeasonalityMode::Additive),
            ("multiplicative_terms", SeasonalityMode::Multiplicative),
        ] {
            components.entry(name.to_string()).or_insert(ComponentInfo {
                mode,
                columns: Vec::new(),
            });
        }
        Self {
            n_columns: columns.len(),
            components,
        }
    }

    /// 0/1 membership vector of a component over all columns.
    pub fn indicator(&self, component: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.n_columns];
        if let Some(info) = self.components.get(component) {
            for &c in &info.columns {
                v[c] = 1.0;
            }
        }
        v
    }

    pub fn s_a(&self) -> Vec<f64> {
        self.indicator("additive_terms")
    }

    pub fn s_m(&self) -> Vec<f64> {
        self.indicator("multiplicative_terms")
    }
}

/// Design matrix plus per-column metadata, in fit order: seasonalities,
/// holidays (sorted by column name), regressors.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub x: Array2<f64>,
    pub columns: Vec<FeatureColumn>,
    /// Holiday names present while building.
    pub holiday_names: Vec<String>,
    pub holiday_columns: Vec<FeatureColumn>,
}

impl FeatureMatrix {
    /// The holiday layout to enforce on later builds.
    pub fn trained_holidays(&self) -> TrainedHolidays {
        TrainedHolidays {
            names: self.holiday_names.clone(),
            columns: self.holiday_columns.clone(),
        }
    }

    pub fn prior_scales(&self) -> Vec<f64> {
        self.columns.iter().map(|c| c.prior_scale).collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Holiday layout recorded by the first fit and enforced afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedHolidays {
    pub names: Vec<String>,
    pub columns: Vec<FeatureColumn>,
}

/// Everything that shapes the feature matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub seasonalities: Vec<Seasonality>,
    pub holidays: Vec<HolidayEvent>,
    pub holidays_mode: SeasonalityMode,
    pub regressors: Vec<Regressor>,
}

/// Row-aligned inputs for feature construction. Regressors must already be
/// standardized.
pub struct FeatureInputs<'a> {
    pub dates: &'a [NaiveDateTime],
    pub regressors: &'a BTreeMap<String, Vec<f64>>,
    pub conditions: &'a BTreeMap<String, Vec<bool>>,
}

impl FeatureSpec {
    pub fn regressor_names(&self) -> Vec<String> {
        self.regressors.iter().map(|r| r.name.clone()).collect()
    }

    /// Build the design matrix. With `trained` set, holiday columns are
    /// restricted and padded to the recorded layout.
    pub fn build(
        &self,
        inputs: &FeatureInputs<'_>,
        trained: Option<&TrainedHolidays>,
    ) -> Result<FeatureMatrix> {
        let n = inputs.dates.len();
        let mut blocks: Vec<Array2<f64>> = Vec::new();
        let mut columns: Vec<FeatureColumn> = Vec::new();

        let t_days: Vec<f64> = inputs.dates.iter().map(|d| days_since_epoch(*d)).collect();
        for s in &self.seasonalities {
            let mut block = fourier_series(&t_days, s.period, s.fourier_order);
            if let Some(cond) = &s.condition_name {
                let flags = inputs
                    .conditions
                    .get(cond)
                    .ok_or_else(|| AuguryError::MissingColumn(cond.clone()))?;
                for (mut row, &on) in block.rows_mut().into_iter().zip(flags) {
                    if !on {
                        row.fill(0.0);
                    }
                }
            }
            for i in 0..block.ncols() {
                columns.push(FeatureColumn {
                    name: format!("{}{}{}", s.name, COLUMN_DELIMITER, i + 1),
                    component: s.name.clone(),
                    mode: Some(s.mode),
                    prior_scale: s.prior_scale,
                });
            }
            blocks.push(block);
        }

        let (holiday_block, holiday_columns, holiday_names) =
            self.holiday_features(inputs.dates, trained)?;
        if !holiday_columns.is_empty() {
            blocks.push(holiday_block);
            columns.extend(holiday_columns.iter().cloned());
        }

        for r in &self.regressors {
            let values = inputs
                .regressors
                .get(&r.name)
                .ok_or_else(|| AuguryError::MissingColumn(r.name.clone()))?;
            blocks.push(Array2::from_shape_fn((n, 1), |(i, _)| values[i]));
            columns.push(FeatureColumn {
                name: r.name.clone(),
                component: r.name.clone(),
                mode: Some(r.mode),
                prior_scale: r.prior_scale,
            });
        }

        if columns.is_empty() {
            blocks.push(Array2::zeros((n, 1)));
            columns.push(FeatureColumn {
                name: ZEROS_COLUMN.to_string(),
                component: ZEROS_COLUMN.to_string(),
                mode: None,
                prior_scale: 1.0,
            });
        }

        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        let x = ndarray::concatenate(ndarray::Axis(1), &views)
            .map_err(|e| AuguryError::Data(format!("Failed to assemble features: {}", e)))?;

        Ok(FeatureMatrix {
            x,
            columns,
            holiday_names,
            holiday_columns,
        })
    }

    fn active_events(&self, dates: &[NaiveDateTime], trained: Option<&TrainedHolidays>) -> Vec<&HolidayEvent> {
        let years: BTreeSet<i32> = dates.iter().map(|d| d.year()).collect();
        self.holidays
            .iter()
            .filter(|e| !e.from_calendar || years.contains(&e.date.year()))
            .filter(|e| trained.map_or(true, |t| t.names.contains(&e.name)))
            .collect()
    }

    fn holiday_features(
        &self,
        dates: &[NaiveDateTime],
        trained: Option<&TrainedHolidays>,
    ) -> Result<(Array2<f64>, Vec<FeatureColumn>, Vec<String>)> {
        let n = dates.len();
        let events = self.active_events(dates, trained);

        let mut rows_by_date: HashMap<NaiveDate, Vec<usize>> = HashMap::new();
        for (i, d) in dates.iter().enumerate() {
            rows_by_date.entry(d.date()).or_default().push(i);
        }

        let mut prior_scales: BTreeMap<&str, f64> = BTreeMap::new();
        // column name -> (holiday name, indicator)
        let mut expanded: BTreeMap<String, (String, Vec<f64>)> = BTreeMap::new();
        for e in &events {
            match prior_scales.get(e.name.as_str()) {
                Some(&ps) if ps != e.prior_scale => {
                    return Err(AuguryError::Configuration(format!(
                        "Holiday {:?} does not have consistent prior scale specification",
                        e.name
                    )));
                }
                _ => {
                    prior_scales.insert(&e.name, e.prior_scale);
                }
            }
            for offset in e.lower_window..=e.upper_window {
                let key = format!(
                    "{}{}{}{}",
                    e.name,
                    COLUMN_DELIMITER,
                    if offset >= 0 { "+" } else { "-" },
                    offset.abs()
                );
                let (_, col) = expanded
                    .entry(key)
                    .or_insert_with(|| (e.name.clone(), vec![0.0; n]));
                let occurrence = e.date + Duration::days(offset as i64);
                if let Some(rows) = rows_by_date.get(&occurrence) {
                    for &r in rows {
                        col[r] = 1.0;
                    }
                }
            }
        }

        let names: Vec<String> = prior_scales.keys().map(|s| s.to_string()).collect();
        let built_columns: Vec<FeatureColumn> = expanded
            .iter()
            .map(|(key, (holiday, _))| FeatureColumn {
                name: key.clone(),
                component: holiday.clone(),
                mode: Some(self.holidays_mode),
                prior_scale: prior_scales.get(holiday.as_str()).copied().unwrap_or(1.0),
            })
            .collect();

        let layout = match trained {
            Some(t) => t.columns.clone(),
            None => built_columns,
        };
        let mut x = Array2::zeros((n, layout.len()));
        for (j, c) in layout.iter().enumerate() {
            if let Some((_, col)) = expanded.get(&c.name) {
                for (i, &v) in col.iter().enumerate() {
                    x[[i, j]] = v;
                }
            }
        }
        let names = match trained {
            Some(t) => t.names.clone(),
            None => names,
        };
        Ok((x, layout, names))
    }
}
