//! One-call helpers on plain `(ds, y)` series.

use crate::core::data::TimeSeriesData;
use crate::core::model::Forecaster;
use crate::core::time::{infer_frequency, parse_required};
use crate::{AuguryError, Result};

const MIN_SERIES_POINTS: usize = 10;

/// Fit a default model and return the next `count` `(ds, yhat)` pairs.
///
/// The output frequency is inferred from the timestamps (year, quarter or
/// month starts, weekly, daily or hourly).
pub fn forecast_series(ds: &[String], y: &[f64], count: usize) -> Result<Vec<(String, f64)>> {
    if ds.len() < MIN_SERIES_POINTS {
        return Err(AuguryError::InsufficientRows {
            needed: MIN_SERIES_POINTS,
            got: ds.len(),
        });
    }
    let times = ds
        .iter()
        .map(|s| parse_required(s))
        .collect::<Result<Vec<_>>>()?;
    let freq = infer_frequency(&times)?;

    let data = TimeSeriesData::new(ds.to_vec(), y.to_vec())?;
    let model = Forecaster::new().with_uncertainty_samples(0).fit(&data)?;
    let future = model.make_future_dataframe(count, freq, false)?;
    let forecast = model.predict(Some(&future))?;
    Ok(forecast.ds.into_iter().zip(forecast.yhat).collect())
}

/// Dates whose observation falls outside the fitted uncertainty interval.
///
/// `forecaster` carries the settings, typically a wide interval such as
/// `with_interval_width(0.99)`.
pub fn anomalies(data: &TimeSeriesData, forecaster: Forecaster) -> Result<Vec<String>> {
    let model = forecaster.fit(data)?;
    let forecast = model.predict(None)?;
    let (Some(lower), Some(upper)) = (&forecast.yhat_lower, &forecast.yhat_upper) else {
        return Err(AuguryError::Configuration(
            "Anomaly detection needs uncertainty_samples > 0".to_string(),
        ));
    };
    let history = model.history();
    let y = history
        .y
        .as_ref()
        .ok_or_else(|| AuguryError::MissingColumn("y".to_string()))?;
    // the stored history is sorted, matching the forecast rows
    Ok(history
        .ds
        .iter()
        .zip(y)
        .enumerate()
        .filter(|(i, (_, &v))| v < lower[*i] || v > upper[*i])
        .map(|(_, (ds, _))| ds.clone())
        .collect())
}
