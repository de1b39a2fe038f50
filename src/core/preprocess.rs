use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::core::data::TimeSeriesData;
use crate::core::seasonality::Regressor;
use crate::core::time::{duration_seconds, parse_required};
use crate::core::trend::Growth;
use crate::{AuguryError, Result};

/// Scaling fixed by the first fit and reused for every later frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scales {
    pub start: NaiveDateTime,
    /// Seconds between the first and last training timestamps.
    pub t_scale: f64,
    pub y_scale: f64,
    /// Logistic growth with a user-supplied `floor` column.
    pub logistic_floor: bool,
}

/// A validated frame, sorted by `ds`, in model units.
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    pub dates: Vec<NaiveDateTime>,
    pub t: Vec<f64>,
    pub y: Option<Vec<f64>>,
    pub y_scaled: Option<Vec<f64>>,
    pub cap: Option<Vec<f64>>,
    /// `(cap - floor) / y_scale`; zeros unless growth is logistic.
    pub cap_scaled: Vec<f64>,
    pub floor: Vec<f64>,
    /// Standardized regressor columns.
    pub regressors: BTreeMap<String, Vec<f64>>,
    pub conditions: BTreeMap<String, Vec<bool>>,
    /// Source row of each sorted row.
    pub order: Vec<usize>,
}

impl PreparedFrame {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Parse every `ds` and return the timestamps in ascending order together
/// with the permutation that sorts the input rows.
pub fn sort_by_ds(data: &TimeSeriesData) -> Result<(Vec<NaiveDateTime>, Vec<usize>)> {
    let parsed = data
        .ds
        .iter()
        .map(|s| parse_required(s))
        .collect::<Result<Vec<_>>>()?;
    let mut order: Vec<usize> = (0..parsed.len()).collect();
    order.sort_by_key(|&i| parsed[i]);
    let dates = order.iter().map(|&i| parsed[i]).collect();
    Ok((dates, order))
}

fn require_finite(name: &str, values: &[f64]) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(AuguryError::NonFiniteValue(name.to_string()));
    }
    Ok(())
}

fn floor_column(data: &TimeSeriesData, growth: Growth, logistic_floor: bool) -> Result<Vec<f64>> {
    if growth == Growth::Logistic && logistic_floor {
        let floor = data
            .floor
            .as_ref()
            .ok_or_else(|| AuguryError::MissingColumn("floor".to_string()))?;
        require_finite("floor", floor)?;
        Ok(floor.clone())
    } else {
        Ok(vec![0.0; data.len()])
    }
}

impl Scales {
    /// Compute the scaling from the training history.
    pub fn from_history(data: &TimeSeriesData, growth: Growth) -> Result<Self> {
        data.validate_lengths()?;
        let y = data
            .y
            .as_ref()
            .ok_or_else(|| AuguryError::MissingColumn("y".to_string()))?;
        require_finite("y", y)?;
        if data.len() < 2 {
            return Err(AuguryError::InsufficientRows {
                needed: 2,
                got: data.len(),
            });
        }

        let (dates, _) = sort_by_ds(data)?;
        let (Some(&start), Some(&end)) = (dates.first(), dates.last()) else {
            return Err(AuguryError::InsufficientRows { needed: 2, got: 0 });
        };
        let t_scale = duration_seconds(end - start);
        if t_scale <= 0.0 {
            return Err(AuguryError::Data(
                "History must span more than a single timestamp".to_string(),
            ));
        }

        let logistic_floor = growth == Growth::Logistic && data.floor.is_some();
        let floor = floor_column(data, growth, logistic_floor)?;
        let mut y_scale = y
            .iter()
            .zip(&floor)
            .map(|(v, f)| (v - f).abs())
            .fold(0.0_f64, f64::max);
        if y_scale == 0.0 {
            y_scale = 1.0;
        }

        Ok(Self {
            start,
            t_scale,
            y_scale,
            logistic_floor,
        })
    }

    /// Validate and scale a frame. `y` is optional here; fitting checks it
    /// separately.
    pub fn prepare(
        &self,
        data: &TimeSeriesData,
        growth: Growth,
        regressors: &[Regressor],
        condition_names: &[String],
    ) -> Result<PreparedFrame> {
        data.validate_lengths()?;
        if data.is_empty() {
            return Err(AuguryError::Data("Dataframe has no rows".to_string()));
        }
        if let Some(y) = &data.y {
            require_finite("y", y)?;
        }

        let mut standardized = BTreeMap::new();
        for r in regressors {
            let values = data
                .regressors
                .get(&r.name)
                .ok_or_else(|| AuguryError::MissingColumn(r.name.clone()))?;
            require_finite(&r.name, values)?;
            standardized.insert(r.name.clone(), r.standardize_column(values));
        }
        let mut conditions = BTreeMap::new();
        for name in condition_names {
            let flags = data
                .conditions
                .get(name)
                .ok_or_else(|| AuguryError::MissingColumn(name.clone()))?;
            conditions.insert(name.clone(), flags.clone());
        }

        let floor = floor_column(data, growth, self.logistic_floor)?;
        let cap_scaled = if growth == Growth::Logistic {
            let cap = data
                .cap
                .as_ref()
                .ok_or_else(|| AuguryError::MissingColumn("cap".to_string()))?;
            require_finite("cap", cap)?;
            let scaled: Vec<f64> = cap
                .iter()
                .zip(&floor)
                .map(|(c, f)| (c - f) / self.y_scale)
                .collect();
            if scaled.iter().any(|&c| c <= 0.0) {
                return Err(AuguryError::Data(
                    "Capacity must be greater than floor for every row".to_string(),
                ));
            }
            scaled
        } else {
            vec![0.0; data.len()]
        };

        let (dates, order) = sort_by_ds(data)?;
        let pick = |values: &[f64]| -> Vec<f64> { order.iter().map(|&i| values[i]).collect() };

        let t = dates
            .iter()
            .map(|d| duration_seconds(*d - self.start) / self.t_scale)
            .collect();
        let floor_sorted = pick(&floor);
        let y_sorted = data.y.as_ref().map(|y| pick(y));
        let y_scaled = y_sorted.as_ref().map(|y| {
            y.iter()
                .zip(&floor_sorted)
                .map(|(v, f)| (v - f) / self.y_scale)
                .collect()
        });

        Ok(PreparedFrame {
            t,
            y: y_sorted,
            y_scaled,
            cap: data.cap.as_ref().map(|c| pick(c)),
            cap_scaled: pick(&cap_scaled),
            floor: floor_sorted,
            regressors: standardized
                .into_iter()
                .map(|(k, v)| (k, pick(&v)))
                .collect(),
            conditions: conditions
                .into_iter()
                .map(|(k, v)| (k, order.iter().map(|&i| v[i]).collect()))
                .collect(),
            dates,
            order,
        })
    }
}

/// Fix standardization stats for every regressor from the training columns.
pub fn fit_regressor_stats(data: &TimeSeriesData, regressors: &mut [Regressor]) -> Result<()> {
    for r in regressors.iter_mut() {
        let values = data
            .regressors
            .get(&r.name)
            .ok_or_else(|| AuguryError::MissingColumn(r.name.clone()))?;
        require_finite(&r.name, values)?;
        r.fit_stats(values);
    }
    Ok(())
}
