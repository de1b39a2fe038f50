pub mod data;
pub mod diagnostics;
pub mod forecast;
pub mod holidays;
pub mod model;
pub mod objective; // negative log posterior and its analytic gradient
pub mod optimizer; // Backend boundary and the argmin-based MAP backend
pub mod preprocess;
pub mod sampling;
pub mod seasonality;
pub mod time;
pub mod trend;

pub use data::{ForecastResult, TimeSeriesData};
pub use model::{FittedModel, Forecaster};
