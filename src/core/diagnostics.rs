//! Time-series cross-validation and rolling forecast accuracy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::model::FittedModel;
use crate::core::preprocess::sort_by_ds;
use crate::core::time::days;
use crate::{AuguryError, Result};

/// Cutoff dates for simulated historical forecasts, ascending.
///
/// Walks back from `max - horizon` in steps of `period` while the previous
/// cutoff is at least `min + initial`. A cutoff whose window
/// `(cutoff, cutoff + horizon]` holds no observation is moved to the last
/// observation at or before it, minus `horizon`.
pub fn generate_cutoffs(
    ds: &[NaiveDateTime],
    horizon: Duration,
    initial: Duration,
    period: Duration,
) -> Result<Vec<NaiveDateTime>> {
    if horizon <= Duration::zero() || period <= Duration::zero() {
        return Err(AuguryError::Configuration(
            "horizon and period must be positive".to_string(),
        ));
    }
    let (Some(&min), Some(&max)) = (ds.iter().min(), ds.iter().max()) else {
        return Err(AuguryError::InsufficientRows { needed: 1, got: 0 });
    };

    let mut cutoff = max - horizon;
    if cutoff < min {
        return Err(AuguryError::Data("Less data than horizon".to_string()));
    }
    let mut result = vec![cutoff];
    while result.last().is_some_and(|&c| c >= min + initial) {
        cutoff -= period;
        let window_empty = !ds.iter().any(|&d| d > cutoff && d <= cutoff + horizon);
        if window_empty && cutoff > min {
            if let Some(closest) = ds.iter().copied().filter(|&d| d <= cutoff).max() {
                cutoff = closest - horizon;
            }
        }
        result.push(cutoff);
    }
    result.pop();
    if result.is_empty() {
        return Err(AuguryError::Data(
            "Less data than horizon after initial window. Make horizon or initial shorter"
                .to_string(),
        ));
    }
    info!(
        count = result.len(),
        first = %result[result.len() - 1],
        last = %result[0],
        "Making forecasts at cutoffs"
    );
    result.reverse();
    Ok(result)
}

/// Settings for [`cross_validation`].
#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidationOptions {
    pub horizon: Duration,
    /// Spacing between cutoffs; defaults to half the horizon.
    pub period: Option<Duration>,
    /// Training span before the first cutoff; defaults to three horizons or
    /// the longest seasonal period, whichever is larger.
    pub initial: Option<Duration>,
    /// Explicit cutoffs, replacing generated ones.
    pub cutoffs: Option<Vec<NaiveDateTime>>,
    /// Refit cutoffs on the rayon pool.
    pub parallel: bool,
}

impl CrossValidationOptions {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            period: None,
            initial: None,
            cutoffs: None,
            parallel: false,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_cutoffs(mut self, cutoffs: Vec<NaiveDateTime>) -> Self {
        self.cutoffs = Some(cutoffs);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// One out-of-sample prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvRecord {
    pub ds: NaiveDateTime,
    pub cutoff: NaiveDateTime,
    pub y: f64,
    pub yhat: f64,
    pub yhat_lower: Option<f64>,
    pub yhat_upper: Option<f64>,
}

impl CvRecord {
    pub fn horizon(&self) -> Duration {
        self.ds - self.cutoff
    }
}

fn resolve_cutoffs(
    model: &FittedModel,
    dates: &[NaiveDateTime],
    options: &CrossValidationOptions,
) -> Result<Vec<NaiveDateTime>> {
    let horizon = options.horizon;
    let (Some(&min), Some(&max)) = (dates.first(), dates.last()) else {
        return Err(AuguryError::State("Model has no history".to_string()));
    };
    let period_max = model
        .seasonalities()
        .iter()
        .map(|s| s.period)
        .fold(0.0_f64, f64::max);
    let seasonality_span = days(period_max);

    let (cutoffs, initial) = match &options.cutoffs {
        None => {
            let period = options.period.unwrap_or(horizon / 2);
            let initial = options
                .initial
                .unwrap_or_else(|| (horizon * 3).max(seasonality_span));
            (generate_cutoffs(dates, horizon, initial, period)?, initial)
        }
        Some(custom) => {
            let mut custom = custom.clone();
            custom.sort();
            let (Some(&first), Some(&last)) = (custom.first(), custom.last()) else {
                return Err(AuguryError::Configuration(
                    "Cutoff list must not be empty".to_string(),
                ));
            };
            if first <= min {
                return Err(AuguryError::Configuration(
                    "Minimum cutoff value is not strictly greater than min date in history"
                        .to_string(),
                ));
            }
            if last > max - horizon {
                return Err(AuguryError::Configuration(
                    "Maximum cutoff value is greater than end date minus horizon, no value for cross-validation remaining"
                        .to_string(),
                ));
            }
            (custom, first - min)
        }
    };
    if initial < seasonality_span {
        warn!(
            period_days = period_max,
            "Seasonality has period larger than initial window. Consider increasing initial"
        );
    }
    Ok(cutoffs)
}

fn single_cutoff_forecast(
    model: &FittedModel,
    dates: &[NaiveDateTime],
    order: &[usize],
    cutoff: NaiveDateTime,
    horizon: Duration,
    seed: u64,
) -> Result<Vec<CvRecord>> {
    let history = model.history();
    let train_rows: Vec<usize> = order
        .iter()
        .zip(dates)
        .filter(|(_, &d)| d <= cutoff)
        .map(|(&i, _)| i)
        .collect();
    if train_rows.len() < 2 {
        return Err(AuguryError::InsufficientRows {
            needed: 2,
            got: train_rows.len(),
        });
    }
    let (test_rows, test_dates): (Vec<usize>, Vec<NaiveDateTime>) = order
        .iter()
        .zip(dates)
        .filter(|(_, &d)| d > cutoff && d <= cutoff + horizon)
        .map(|(&i, &d)| (i, d))
        .unzip();

    let refit = model
        .to_builder(Some(cutoff))?
        .fit(&history.select_rows(&train_rows))?;
    let test = history.select_rows(&test_rows);
    let mut rng = StdRng::seed_from_u64(seed);
    // the held-out y must not reach the refit model
    let forecast = refit.predict_with_rng(Some(&test.without_y()), &mut rng)?;
    debug!(%cutoff, rows = test_rows.len(), "Evaluated cutoff");

    let y = test
        .y
        .ok_or_else(|| AuguryError::MissingColumn("y".to_string()))?;
    // test rows are already in ds order, so they line up with the forecast
    Ok(test_dates
        .into_iter()
        .enumerate()
        .map(|(i, ds)| CvRecord {
            ds,
            cutoff,
            y: y[i],
            yhat: forecast.yhat[i],
            yhat_lower: forecast.yhat_lower.as_ref().map(|v| v[i]),
            yhat_upper: forecast.yhat_upper.as_ref().map(|v| v[i]),
        })
        .collect())
}

/// Refit copies of `model` on history up to each cutoff and forecast the
/// following `horizon`. Records are sorted by cutoff, then ds.
pub fn cross_validation(
    model: &FittedModel,
    options: &CrossValidationOptions,
) -> Result<Vec<CvRecord>> {
    let (dates, order) = sort_by_ds(model.history())?;
    let cutoffs = resolve_cutoffs(model, &dates, options)?;
    let seed = model.config().seed;

    let run = |(i, cutoff): (usize, &NaiveDateTime)| {
        single_cutoff_forecast(
            model,
            &dates,
            &order,
            *cutoff,
            options.horizon,
            seed.wrapping_add(i as u64),
        )
    };
    let per_cutoff: Vec<Vec<CvRecord>> = if options.parallel {
        cutoffs
            .par_iter()
            .enumerate()
            .map(run)
            .collect::<Result<_>>()?
    } else {
        cutoffs.iter().enumerate().map(run).collect::<Result<_>>()?
    };

    let mut records: Vec<CvRecord> = per_cutoff.into_iter().flatten().collect();
    records.sort_by(|a, b| a.cutoff.cmp(&b.cutoff).then(a.ds.cmp(&b.ds)));
    Ok(records)
}

/// Accuracy measures reported by [`performance_metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Mse,
    Rmse,
    Mae,
    Mape,
    Mdape,
    Smape,
    Coverage,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Mse,
        Metric::Rmse,
        Metric::Mae,
        Metric::Mape,
        Metric::Mdape,
        Metric::Smape,
        Metric::Coverage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Mse => "mse",
            Metric::Rmse => "rmse",
            Metric::Mae => "mae",
            Metric::Mape => "mape",
            Metric::Mdape => "mdape",
            Metric::Smape => "smape",
            Metric::Coverage => "coverage",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = AuguryError;

    fn from_str(s: &str) -> Result<Self> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                AuguryError::Configuration(format!(
                    "Valid values for metrics are: {}, got {:?}",
                    Metric::ALL.map(Metric::as_str).join(", "),
                    s
                ))
            })
    }
}

/// Metrics by forecast horizon, horizons strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    pub horizon: Vec<Duration>,
    pub values: BTreeMap<Metric, Vec<f64>>,
}

impl PerformanceMetrics {
    pub fn get(&self, metric: Metric) -> Option<&[f64]> {
        self.values.get(&metric).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.horizon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.horizon.is_empty()
    }
}

/// Distinct horizons with per-bucket sums and counts.
fn group_by_horizon(x: &[f64], h: &[Duration]) -> Vec<(Duration, f64, usize)> {
    let mut groups: Vec<(Duration, f64, usize)> = Vec::new();
    for (&xi, &hi) in x.iter().zip(h) {
        match groups.last_mut() {
            Some(g) if g.0 == hi => {
                g.1 += xi;
                g.2 += 1;
            }
            _ => groups.push((hi, xi, 1)),
        }
    }
    groups
}

/// Trailing mean over at least `w` points per horizon, weighting the oldest
/// bucket partially. `h` must be sorted.
fn rolling_mean_by_h(x: &[f64], h: &[Duration], w: usize) -> Vec<(Duration, f64)> {
    let groups = group_by_horizon(x, h);
    let mut res: Vec<Option<f64>> = vec![None; groups.len()];
    let mut x_sum = 0.0;
    let mut n_sum = 0usize;
    // index of the newest bucket without a value; -1 once all are filled
    let mut trailing = groups.len() as isize - 1;
    for i in (0..groups.len()).rev() {
        let (_, xs, ns) = groups[i];
        x_sum += xs;
        n_sum += ns;
        while n_sum >= w && trailing >= 0 {
            let excess_n = (n_sum - w) as f64;
            let excess_x = excess_n * xs / ns as f64;
            let t = trailing as usize;
            res[t] = Some((x_sum - excess_x) / w as f64);
            x_sum -= groups[t].1;
            n_sum -= groups[t].2;
            trailing -= 1;
        }
    }
    groups
        .iter()
        .zip(res)
        .filter_map(|(g, v)| v.map(|v| (g.0, v)))
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Trailing median over at least `w` points per horizon. `h` must be sorted.
fn rolling_median_by_h(x: &[f64], h: &[Duration], w: usize) -> Vec<(Duration, f64)> {
    let groups = group_by_horizon(x, h);
    let mut starts = Vec::with_capacity(groups.len());
    let mut offset = 0;
    for g in &groups {
        starts.push(offset);
        offset += g.2;
    }

    let mut res = Vec::new();
    for (i, g) in groups.iter().enumerate().rev() {
        let start = starts[i];
        let mut xs: Vec<f64> = x[start..start + g.2].to_vec();
        let mut next = start;
        while xs.len() < w && next > 0 {
            next -= 1;
            xs.push(x[next]);
        }
        if xs.len() < w {
            break;
        }
        res.push((g.0, median(&mut xs)));
    }
    res.reverse();
    res
}

/// Rolling accuracy metrics over cross-validation records.
///
/// `metrics` defaults to all of them. `mape` is skipped when some `y` is
/// near zero and `coverage` when the records carry no interval bounds.
/// Each reported horizon aggregates at least
/// `clamp(round(rolling_window * n), 1, n)` of the closest records.
pub fn performance_metrics(
    records: &[CvRecord],
    metrics: Option<&[Metric]>,
    rolling_window: f64,
) -> Result<PerformanceMetrics> {
    let mut metrics: Vec<Metric> = metrics.map_or_else(|| Metric::ALL.to_vec(), <[_]>::to_vec);
    let mut seen = std::collections::BTreeSet::new();
    if !metrics.iter().all(|m| seen.insert(*m)) {
        return Err(AuguryError::Configuration(
            "Input metrics must be a list of unique values".to_string(),
        ));
    }
    if !rolling_window.is_finite() {
        return Err(AuguryError::Configuration(format!(
            "rolling_window must be finite, got {}",
            rolling_window
        )));
    }
    if records.is_empty() {
        return Err(AuguryError::InsufficientRows { needed: 1, got: 0 });
    }

    let has_bounds = records
        .iter()
        .all(|r| r.yhat_lower.is_some() && r.yhat_upper.is_some());
    if !has_bounds && metrics.contains(&Metric::Coverage) {
        info!("Skipping coverage, forecasts have no interval bounds");
        metrics.retain(|m| *m != Metric::Coverage);
    }

    let mut sorted: Vec<&CvRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.horizon());
    if metrics.contains(&Metric::Mape) && sorted.iter().any(|r| r.y.abs() < 1e-8) {
        info!("Skipping MAPE because y close to 0");
        metrics.retain(|m| *m != Metric::Mape);
    }
    if metrics.is_empty() {
        return Err(AuguryError::Configuration(
            "No metrics left to compute".to_string(),
        ));
    }

    let n = sorted.len();
    let w = ((rolling_window * n as f64).round().max(1.0) as usize).min(n);
    let h: Vec<Duration> = sorted.iter().map(|r| r.horizon()).collect();
    let pointwise = |f: &dyn Fn(&CvRecord) -> f64| -> Vec<f64> { sorted.iter().map(|r| f(r)).collect() };
    let ape = || pointwise(&|r| ((r.y - r.yhat) / r.y).abs());

    let mut horizon: Option<Vec<Duration>> = None;
    let mut values = BTreeMap::new();
    for metric in metrics {
        let rows = match metric {
            Metric::Mse => rolling_mean_by_h(&pointwise(&|r| (r.y - r.yhat).powi(2)), &h, w),
            Metric::Rmse => rolling_mean_by_h(&pointwise(&|r| (r.y - r.yhat).powi(2)), &h, w)
                .into_iter()
                .map(|(hz, v)| (hz, v.sqrt()))
                .collect(),
            Metric::Mae => rolling_mean_by_h(&pointwise(&|r| (r.y - r.yhat).abs()), &h, w),
            Metric::Mape => rolling_mean_by_h(&ape(), &h, w),
            Metric::Mdape => rolling_median_by_h(&ape(), &h, w),
            Metric::Smape => rolling_mean_by_h(
                &pointwise(&|r| (r.y - r.yhat).abs() / ((r.y.abs() + r.yhat.abs()) / 2.0)),
                &h,
                w,
            ),
            Metric::Coverage => rolling_mean_by_h(
                &pointwise(&|r| match (r.yhat_lower, r.yhat_upper) {
                    (Some(lo), Some(hi)) if r.y >= lo && r.y <= hi => 1.0,
                    _ => 0.0,
                }),
                &h,
                w,
            ),
        };
        let (hz, v): (Vec<Duration>, Vec<f64>) = rows.into_iter().unzip();
        match &horizon {
            None => horizon = Some(hz),
            Some(existing) if *existing != hz => {
                return Err(AuguryError::State(format!(
                    "Metric {} produced a different horizon set",
                    metric
                )));
            }
            Some(_) => {}
        }
        values.insert(metric, v);
    }

    Ok(PerformanceMetrics {
        horizon: horizon.unwrap_or_default(),
        values,
    })
}
