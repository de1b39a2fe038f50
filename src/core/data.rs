use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AuguryError, Result};

/// Columnar input frame: one entry per observation.
///
/// `y` is optional so the same type carries both training history and the
/// future frame handed to `predict`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub ds: Vec<String>,
    pub y: Option<Vec<f64>>,
    pub cap: Option<Vec<f64>>,
    pub floor: Option<Vec<f64>>,
    pub regressors: BTreeMap<String, Vec<f64>>,
    pub conditions: BTreeMap<String, Vec<bool>>,
}

impl TimeSeriesData {
    pub fn new(ds: Vec<String>, y: Vec<f64>) -> Result<Self> {
        if ds.len() != y.len() {
            return Err(AuguryError::Data(format!(
                "ds and y must have same length, got {} and {}",
                ds.len(),
                y.len()
            )));
        }
        Ok(Self {
            ds,
            y: Some(y),
            ..Self::default()
        })
    }

    /// A frame with timestamps only, as produced by `make_future_dataframe`.
    pub fn from_dates(ds: Vec<String>) -> Self {
        Self {
            ds,
            ..Self::default()
        }
    }

    pub fn with_cap(mut self, cap: Vec<f64>) -> Result<Self> {
        self.check_len("cap", cap.len())?;
        self.cap = Some(cap);
        Ok(self)
    }

    pub fn with_floor(mut self, floor: Vec<f64>) -> Result<Self> {
        self.check_len("floor", floor.len())?;
        self.floor = Some(floor);
        Ok(self)
    }

    pub fn with_regressor(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.check_len(name, values.len())?;
        self.regressors.insert(name.to_string(), values);
        Ok(self)
    }

    pub fn with_condition(mut self, name: &str, values: Vec<bool>) -> Result<Self> {
        self.check_len(name, values.len())?;
        self.conditions.insert(name.to_string(), values);
        Ok(self)
    }

    fn check_len(&self, column: &str, len: usize) -> Result<()> {
        if len != self.ds.len() {
            return Err(AuguryError::Data(format!(
                "{} must have same length as ds ({}), got {}",
                column,
                self.ds.len(),
                len
            )));
        }
        Ok(())
    }

    /// Verify every optional column matches `ds` in length.
    pub fn validate_lengths(&self) -> Result<()> {
        if let Some(y) = &self.y {
            self.check_len("y", y.len())?;
        }
        if let Some(cap) = &self.cap {
            self.check_len("cap", cap.len())?;
        }
        if let Some(floor) = &self.floor {
            self.check_len("floor", floor.len())?;
        }
        for (name, values) in &self.regressors {
            self.check_len(name, values.len())?;
        }
        for (name, values) in &self.conditions {
            self.check_len(name, values.len())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }

    /// Copy of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        fn pick<T: Clone>(values: &[T], rows: &[usize]) -> Vec<T> {
            rows.iter().map(|&i| values[i].clone()).collect()
        }
        Self {
            ds: pick(&self.ds, rows),
            y: self.y.as_ref().map(|v| pick(v, rows)),
            cap: self.cap.as_ref().map(|v| pick(v, rows)),
            floor: self.floor.as_ref().map(|v| pick(v, rows)),
            regressors: self
                .regressors
                .iter()
                .map(|(k, v)| (k.clone(), pick(v, rows)))
                .collect(),
            conditions: self
                .conditions
                .iter()
                .map(|(k, v)| (k.clone(), pick(v, rows)))
                .collect(),
        }
    }

    /// Same rows without the `y` column.
    pub fn without_y(&self) -> Self {
        Self {
            y: None,
            ..self.clone()
        }
    }
}

/// One named forecast component with optional percentile bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentForecast {
    pub values: Vec<f64>,
    pub lower: Option<Vec<f64>>,
    pub upper: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub ds: Vec<String>,
    pub trend: Vec<f64>,
    pub trend_lower: Option<Vec<f64>>,
    pub trend_upper: Option<Vec<f64>>,
    pub cap: Option<Vec<f64>>,
    pub floor: Option<Vec<f64>>,
    /// Seasonalities, holidays, regressors and the aggregate groups
    /// (`additive_terms`, `multiplicative_terms`, `holidays`, ...).
    pub components: BTreeMap<String, ComponentForecast>,
    pub yhat: Vec<f64>,
    pub yhat_lower: Option<Vec<f64>>,
    pub yhat_upper: Option<Vec<f64>>,
}

impl ForecastResult {
    pub fn component(&self, name: &str) -> Option<&[f64]> {
        self.components.get(name).map(|c| c.values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.ds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }
}
