//! augury: decomposable time-series forecasting.
//!
//! A series is modelled as `trend * (1 + multiplicative terms) + additive terms`,
//! where the trend is piecewise linear, logistic or flat and the terms are
//! Fourier seasonalities, holiday windows and extra regressors. Fitting goes
//! through a [`Backend`] (an in-process L-BFGS MAP estimator by default), and
//! forecasts carry posterior-predictive uncertainty intervals.
//!
//! ```no_run
//! use augury::{Forecaster, Frequency, TimeSeriesData};
//!
//! # fn main() -> augury::Result<()> {
//! let ds: Vec<String> = (1..=28).map(|d| format!("2024-02-{:02}", d)).collect();
//! let y: Vec<f64> = (0..28).map(|i| (i % 7) as f64).collect();
//! let model = Forecaster::new().fit(&TimeSeriesData::new(ds, y)?)?;
//! let future = model.make_future_dataframe(10, Frequency::Daily, false)?;
//! let forecast = model.predict(Some(&future))?;
//! println!("{:?}", forecast.yhat);
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::data::{ComponentForecast, ForecastResult, TimeSeriesData};
pub use crate::core::diagnostics::{
    cross_validation, generate_cutoffs, performance_metrics, CrossValidationOptions, CvRecord,
    Metric, PerformanceMetrics,
};
pub use crate::core::forecast::{anomalies, forecast_series};
pub use crate::core::holidays::{HolidayCalendar, HolidayTable};
pub use crate::core::model::{
    FittedModel, Forecaster, ForecasterConfig, ModelDocument, PredictiveSamples,
};
pub use crate::core::optimizer::{
    Algorithm, Backend, Draw, FitRequest, LbfgsBackend, OptimizerConfig, ParameterSet,
};
pub use crate::core::seasonality::{
    HolidayConfig, RegressorConfig, SeasonalityConfig, SeasonalityMode, SeasonalityToggle,
    Standardize,
};
pub use crate::core::time::Frequency;
pub use crate::core::trend::Growth;

pub type Result<T> = std::result::Result<T, AuguryError>;

#[derive(Debug, thiserror::Error)]
pub enum AuguryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Name {0:?} is reserved")]
    ReservedName(String),

    #[error("Name {name:?} already used for {existing}")]
    NameCollision { name: String, existing: &'static str },

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Found non-finite value in column {0:?}")]
    NonFiniteValue(String),

    #[error("Insufficient data: need at least {needed} rows, got {got}")]
    InsufficientRows { needed: usize, got: usize },

    #[error("Data validation error: {0}")]
    Data(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Frequency error: {0}")]
    Frequency(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuguryError {
    /// True for invalid model settings, including reserved or colliding names.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AuguryError::Configuration(_)
                | AuguryError::ReservedName(_)
                | AuguryError::NameCollision { .. }
        )
    }

    /// True for problems with the input rows themselves.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            AuguryError::Data(_)
                | AuguryError::MissingColumn(_)
                | AuguryError::NonFiniteValue(_)
                | AuguryError::InsufficientRows { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuguryError::ReservedName("trend".to_string());
        assert_eq!(err.to_string(), "Name \"trend\" is reserved");

        let err = AuguryError::NameCollision {
            name: "promo".to_string(),
            existing: "an added regressor",
        };
        assert_eq!(
            err.to_string(),
            "Name \"promo\" already used for an added regressor"
        );

        let err = AuguryError::InsufficientRows { needed: 2, got: 1 };
        assert_eq!(
            err.to_string(),
            "Insufficient data: need at least 2 rows, got 1"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(AuguryError::ReservedName("yhat".into()).is_configuration());
        assert!(AuguryError::Configuration("x".into()).is_configuration());
        assert!(!AuguryError::Data("x".into()).is_configuration());
        assert!(AuguryError::MissingColumn("cap".into()).is_data());
        assert!(AuguryError::NonFiniteValue("y".into()).is_data());
        assert!(!AuguryError::State("x".into()).is_data());
    }
}
