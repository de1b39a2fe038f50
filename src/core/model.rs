use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::data::{ComponentForecast, ForecastResult, TimeSeriesData};
use crate::core::holidays::{country_holidays, HolidayCalendar, HolidayTable};
use crate::core::optimizer::{
    optimize_with_fallback, sample_flattened, Backend, Draw, FitRequest, LbfgsBackend,
    OptimizerConfig, ParameterSet,
};
use crate::core::preprocess::{fit_regressor_stats, sort_by_ds, PreparedFrame, Scales};
use crate::core::sampling::{interval_levels, percentile, row_percentiles, SimulationInputs};
use crate::core::seasonality::{
    auto_seasonalities, check_prior_scale, holiday_events, is_reserved_name, ComponentTable,
    FeatureColumn, FeatureInputs, FeatureMatrix, FeatureSpec, HolidayConfig, HolidayEvent,
    Regressor, RegressorConfig, Seasonality, SeasonalityConfig, SeasonalityMode,
    SeasonalityToggle, TrainedHolidays, COLUMN_DELIMITER,
};
use crate::core::time::{duration_seconds, format_ds, future_dates, parse_required, Frequency};
use crate::core::trend::{select_changepoints, Growth};
use crate::{AuguryError, Result};

/// Version written into every serialized model.
pub const MODEL_DOCUMENT_VERSION: u32 = 1;

const MCMC_CHAINS: usize = 4;
const CONSTANT_SERIES_SIGMA: f64 = 1e-9;
/// Country calendars are expanded this many years past the history.
const COUNTRY_HOLIDAY_HORIZON_YEARS: i32 = 50;
/// Year span used to validate country holiday names.
const HOLIDAY_NAME_YEARS: std::ops::RangeInclusive<i32> = 1995..=2045;

/// Scalar hyperparameters of a forecaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecasterConfig {
    pub growth: Growth,
    /// Explicit changepoint dates; overrides automatic selection.
    pub changepoints: Option<Vec<String>>,
    pub n_changepoints: usize,
    pub changepoint_range: f64,
    pub yearly_seasonality: SeasonalityToggle,
    pub weekly_seasonality: SeasonalityToggle,
    pub daily_seasonality: SeasonalityToggle,
    pub seasonality_mode: SeasonalityMode,
    /// Defaults to `seasonality_mode`.
    pub holidays_mode: Option<SeasonalityMode>,
    pub seasonality_prior_scale: f64,
    pub holidays_prior_scale: f64,
    pub changepoint_prior_scale: f64,
    /// Posterior draws requested from the backend; 0 means a MAP fit.
    pub mcmc_samples: usize,
    pub interval_width: f64,
    /// Simulated paths for intervals; 0 disables them.
    pub uncertainty_samples: usize,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            growth: Growth::Linear,
            changepoints: None,
            n_changepoints: 25,
            changepoint_range: 0.8,
            yearly_seasonality: SeasonalityToggle::Auto,
            weekly_seasonality: SeasonalityToggle::Auto,
            daily_seasonality: SeasonalityToggle::Auto,
            seasonality_mode: SeasonalityMode::Additive,
            holidays_mode: None,
            seasonality_prior_scale: 10.0,
            holidays_prior_scale: 10.0,
            changepoint_prior_scale: 0.05,
            mcmc_samples: 0,
            interval_width: 0.8,
            uncertainty_samples: 1000,
            seed: 0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

fn check_changepoint_range(range: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&range) {
        return Err(AuguryError::Configuration(format!(
            "changepoint_range must be between 0 and 1, got {}",
            range
        )));
    }
    Ok(())
}

fn check_interval_width(width: f64) -> Result<()> {
    if !(width > 0.0 && width <= 1.0) {
        return Err(AuguryError::Configuration(format!(
            "interval_width must be in (0, 1], got {}",
            width
        )));
    }
    Ok(())
}

fn check_toggle(name: &str, toggle: SeasonalityToggle) -> Result<()> {
    if toggle == SeasonalityToggle::Forced(0) {
        return Err(AuguryError::Configuration(format!(
            "Fourier order of {} seasonality must be > 0",
            name
        )));
    }
    Ok(())
}

impl ForecasterConfig {
    pub fn validate(&self) -> Result<()> {
        check_changepoint_range(self.changepoint_range)?;
        check_prior_scale(self.seasonality_prior_scale)?;
        check_prior_scale(self.holidays_prior_scale)?;
        check_prior_scale(self.changepoint_prior_scale)?;
        check_interval_width(self.interval_width)?;
        check_toggle("yearly", self.yearly_seasonality)?;
        check_toggle("weekly", self.weekly_seasonality)?;
        check_toggle("daily", self.daily_seasonality)?;
        if let Some(changepoints) = &self.changepoints {
            for cp in changepoints {
                parse_required(cp)?;
            }
        }
        Ok(())
    }

    pub fn holidays_mode(&self) -> SeasonalityMode {
        self.holidays_mode.unwrap_or(self.seasonality_mode)
    }
}

/// A model being configured. Consumed by [`Forecaster::fit`].
#[derive(Debug, Clone)]
pub struct Forecaster {
    config: ForecasterConfig,
    seasonalities: Vec<Seasonality>,
    holidays: Vec<HolidayEvent>,
    country_holidays: Option<String>,
    regressors: Vec<Regressor>,
    backend: Arc<dyn Backend>,
    calendar: Arc<dyn HolidayCalendar>,
}

impl Default for Forecaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Forecaster {
    pub fn new() -> Self {
        Self {
            config: ForecasterConfig::default(),
            seasonalities: Vec::new(),
            holidays: Vec::new(),
            country_holidays: None,
            regressors: Vec::new(),
            backend: Arc::new(LbfgsBackend::default()),
            calendar: Arc::new(HolidayTable::new()),
        }
    }

    pub fn from_config(config: ForecasterConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(LbfgsBackend::new(config.optimizer.clone()));
        Ok(Self {
            config,
            backend,
            ..Self::new()
        })
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    pub fn with_growth(mut self, growth: Growth) -> Self {
        self.config.growth = growth;
        self
    }

    /// Use these dates as changepoints instead of selecting them.
    pub fn with_changepoints(mut self, changepoints: Vec<String>) -> Result<Self> {
        for cp in &changepoints {
            parse_required(cp)?;
        }
        self.config.n_changepoints = changepoints.len();
        self.config.changepoints = Some(changepoints);
        Ok(self)
    }

    pub fn with_n_changepoints(mut self, n: usize) -> Self {
        self.config.n_changepoints = n;
        self
    }

    pub fn with_changepoint_range(mut self, range: f64) -> Result<Self> {
        check_changepoint_range(range)?;
        self.config.changepoint_range = range;
        Ok(self)
    }

    pub fn with_yearly_seasonality(mut self, toggle: SeasonalityToggle) -> Result<Self> {
        check_toggle("yearly", toggle)?;
        self.config.yearly_seasonality = toggle;
        Ok(self)
    }

    pub fn with_weekly_seasonality(mut self, toggle: SeasonalityToggle) -> Result<Self> {
        check_toggle("weekly", toggle)?;
        self.config.weekly_seasonality = toggle;
        Ok(self)
    }

    pub fn with_daily_seasonality(mut self, toggle: SeasonalityToggle) -> Result<Self> {
        check_toggle("daily", toggle)?;
        self.config.daily_seasonality = toggle;
        Ok(self)
    }

    pub fn with_seasonality_mode(mut self, mode: SeasonalityMode) -> Self {
        self.config.seasonality_mode = mode;
        self
    }

    pub fn with_holidays_mode(mut self, mode: SeasonalityMode) -> Self {
        self.config.holidays_mode = Some(mode);
        self
    }

    pub fn with_seasonality_prior_scale(mut self, scale: f64) -> Result<Self> {
        check_prior_scale(scale)?;
        self.config.seasonality_prior_scale = scale;
        Ok(self)
    }

    pub fn with_holidays_prior_scale(mut self, scale: f64) -> Result<Self> {
        check_prior_scale(scale)?;
        self.config.holidays_prior_scale = scale;
        Ok(self)
    }

    pub fn with_changepoint_prior_scale(mut self, scale: f64) -> Result<Self> {
        check_prior_scale(scale)?;
        self.config.changepoint_prior_scale = scale;
        Ok(self)
    }

    pub fn with_mcmc_samples(mut self, samples: usize) -> Self {
        self.config.mcmc_samples = samples;
        self
    }

    pub fn with_interval_width(mut self, width: f64) -> Result<Self> {
        check_interval_width(width)?;
        self.config.interval_width = width;
        Ok(self)
    }

    pub fn with_uncertainty_samples(mut self, samples: usize) -> Self {
        self.config.uncertainty_samples = samples;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Settings for the built-in estimator. Replaces any custom backend.
    pub fn with_optimizer_config(mut self, optimizer: OptimizerConfig) -> Self {
        self.backend = Arc::new(LbfgsBackend::new(optimizer.clone()));
        self.config.optimizer = optimizer;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_holiday_calendar(mut self, calendar: Arc<dyn HolidayCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    fn holiday_names(&self) -> BTreeSet<String> {
        self.holidays.iter().map(|h| h.name.clone()).collect()
    }

    fn country_holiday_names(&self, country: &str) -> BTreeSet<String> {
        let years: Vec<i32> = HOLIDAY_NAME_YEARS.collect();
        self.calendar
            .lookup(country, &years)
            .into_iter()
            .map(|(_, name)| name)
            .collect()
    }

    fn validate_column_name(
        &self,
        name: &str,
        check_holidays: bool,
        check_seasonalities: bool,
        check_regressors: bool,
    ) -> Result<()> {
        if name.contains(COLUMN_DELIMITER) {
            return Err(AuguryError::Configuration(format!(
                "Name cannot contain {:?}",
                COLUMN_DELIMITER
            )));
        }
        if is_reserved_name(name) {
            return Err(AuguryError::ReservedName(name.to_string()));
        }
        if check_holidays {
            let in_country = self
                .country_holidays
                .as_deref()
                .is_some_and(|c| self.country_holiday_names(c).contains(name));
            if in_country || self.holiday_names().contains(name) {
                return Err(AuguryError::NameCollision {
                    name: name.to_string(),
                    existing: "a holiday",
                });
            }
        }
        if check_seasonalities && self.seasonalities.iter().any(|s| s.name == name) {
            return Err(AuguryError::NameCollision {
                name: name.to_string(),
                existing: "a seasonality",
            });
        }
        if check_regressors && self.regressors.iter().any(|r| r.name == name) {
            return Err(AuguryError::NameCollision {
                name: name.to_string(),
                existing: "an added regressor",
            });
        }
        Ok(())
    }

    /// Register a custom seasonality. Reusing a name replaces the earlier one;
    /// `yearly`, `weekly` and `daily` replace the built-ins.
    pub fn add_seasonality(&mut self, seasonality: SeasonalityConfig) -> Result<()> {
        let name = seasonality.name.as_str();
        if !["daily", "weekly", "yearly"].contains(&name) {
            self.validate_column_name(name, true, false, true)?;
        }
        let prior_scale = seasonality
            .prior_scale
            .unwrap_or(self.config.seasonality_prior_scale);
        check_prior_scale(prior_scale)?;
        if seasonality.fourier_order == 0 {
            return Err(AuguryError::Configuration(
                "Fourier order must be > 0".to_string(),
            ));
        }
        if !(seasonality.period > 0.0 && seasonality.period.is_finite()) {
            return Err(AuguryError::Configuration(format!(
                "Seasonality period must be > 0, got {}",
                seasonality.period
            )));
        }
        if let Some(condition) = &seasonality.condition_name {
            self.validate_column_name(condition, true, true, true)?;
        }
        let resolved = Seasonality {
            name: seasonality.name.clone(),
            period: seasonality.period,
            fourier_order: seasonality.fourier_order,
            prior_scale,
            mode: seasonality.mode.unwrap_or(self.config.seasonality_mode),
            condition_name: seasonality.condition_name,
        };
        if let Some(existing) = self.seasonalities.iter_mut().find(|s| s.name == resolved.name) {
            info!(seasonality = %resolved.name, "Replacing existing seasonality");
            *existing = resolved;
        } else {
            self.seasonalities.push(resolved);
        }
        Ok(())
    }

    /// Register an extra regressor column. Prior scale defaults to the
    /// holidays prior scale, mode to the seasonality mode.
    pub fn add_regressor(&mut self, regressor: RegressorConfig) -> Result<()> {
        self.validate_column_name(&regressor.name, true, true, false)?;
        let prior_scale = regressor
            .prior_scale
            .unwrap_or(self.config.holidays_prior_scale);
        check_prior_scale(prior_scale)?;
        let resolved = Regressor {
            name: regressor.name,
            prior_scale,
            standardize: regressor.standardize,
            mode: regressor.mode.unwrap_or(self.config.seasonality_mode),
            mu: 0.0,
            std: 1.0,
        };
        match self.regressors.iter_mut().find(|r| r.name == resolved.name) {
            Some(existing) => *existing = resolved,
            None => self.regressors.push(resolved),
        }
        Ok(())
    }

    /// Register holiday occurrences sharing a name and window.
    pub fn add_holidays(&mut self, holiday: HolidayConfig) -> Result<()> {
        self.validate_column_name(&holiday.name, false, true, true)?;
        let events = holiday_events(&holiday, self.config.holidays_prior_scale)?;
        self.holidays.extend(events);
        Ok(())
    }

    /// Include the built-in holidays of `country` from the holiday calendar.
    pub fn add_country_holidays(&mut self, country: &str) -> Result<()> {
        for name in self.country_holiday_names(country) {
            self.validate_column_name(&name, false, true, true)?;
        }
        if let Some(previous) = &self.country_holidays {
            warn!(from = %previous, to = country, "Changing country holidays");
        }
        self.country_holidays = Some(country.to_string());
        Ok(())
    }

    fn resolve_changepoints(
        &self,
        dates: &[NaiveDateTime],
        scales: &Scales,
    ) -> Result<(Vec<NaiveDateTime>, Vec<f64>)> {
        let changepoints: Vec<NaiveDateTime> = match &self.config.changepoints {
            Some(specified) => {
                let mut parsed = specified
                    .iter()
                    .map(|c| parse_required(c))
                    .collect::<Result<Vec<_>>>()?;
                parsed.sort();
                if let (Some(lo), Some(hi), Some(first), Some(last)) =
                    (parsed.first(), parsed.last(), dates.first(), dates.last())
                {
                    if lo < first || hi > last {
                        return Err(AuguryError::Configuration(
                            "Changepoints must fall within training data".to_string(),
                        ));
                    }
                }
                parsed
            }
            None => select_changepoints(
                dates.len(),
                self.config.n_changepoints,
                self.config.changepoint_range,
            )
            .into_iter()
            .map(|i| dates[i])
            .collect(),
        };
        let t_change = if changepoints.is_empty() {
            vec![0.0]
        } else {
            changepoints
                .iter()
                .map(|c| duration_seconds(*c - scales.start) / scales.t_scale)
                .collect()
        };
        Ok((changepoints, t_change))
    }

    fn calendar_events(&self, dates: &[NaiveDateTime]) -> Vec<HolidayEvent> {
        let Some(country) = &self.country_holidays else {
            return Vec::new();
        };
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Vec::new();
        };
        let years: Vec<i32> =
            (first.year()..=last.year() + COUNTRY_HOLIDAY_HORIZON_YEARS).collect();
        country_holidays(self.calendar.as_ref(), country, &years)
            .into_iter()
            .map(|(date, name)| HolidayEvent {
                name,
                date,
                lower_window: 0,
                upper_window: 0,
                prior_scale: self.config.holidays_prior_scale,
                from_calendar: true,
            })
            .collect()
    }

    /// Fit the model to `data`, which needs `ds`, `y`, every registered
    /// regressor and condition column, and `cap` for logistic growth.
    pub fn fit(self, data: &TimeSeriesData) -> Result<FittedModel> {
        self.config.validate()?;
        let growth = self.config.growth;

        let scales = Scales::from_history(data, growth)?;
        let (dates, order) = sort_by_ds(data)?;
        let history = data.select_rows(&order);

        let mut regressors = self.regressors.clone();
        fit_regressor_stats(&history, &mut regressors)?;

        let mut seasonalities = auto_seasonalities(
            &dates,
            [
                ("yearly", self.config.yearly_seasonality),
                ("weekly", self.config.weekly_seasonality),
                ("daily", self.config.daily_seasonality),
            ],
            &self.seasonalities,
            self.config.seasonality_prior_scale,
            self.config.seasonality_mode,
        );
        // a forced built-in wins over a custom seasonality of the same name
        let custom: Vec<Seasonality> = self
            .seasonalities
            .iter()
            .filter(|c| !seasonalities.iter().any(|s| s.name == c.name))
            .cloned()
            .collect();
        seasonalities.extend(custom);
        let condition_names: Vec<String> = seasonalities
            .iter()
            .filter_map(|s| s.condition_name.clone())
            .collect();

        let frame = scales.prepare(&history, growth, &regressors, &condition_names)?;
        let (changepoints, t_change) = self.resolve_changepoints(&dates, &scales)?;

        let mut holidays = self.holidays.clone();
        holidays.extend(self.calendar_events(&dates));
        let spec = FeatureSpec {
            seasonalities,
            holidays,
            holidays_mode: self.config.holidays_mode(),
            regressors,
        };
        let features = spec.build(
            &FeatureInputs {
                dates: &frame.dates,
                regressors: &frame.regressors,
                conditions: &frame.conditions,
            },
            None,
        )?;
        let trained_holidays = features.trained_holidays();
        let component_table = ComponentTable::new(
            &features.columns,
            &trained_holidays.names,
            &spec.regressor_names(),
            spec.holidays_mode,
        );

        let y_scaled = frame
            .y_scaled
            .clone()
            .ok_or_else(|| AuguryError::MissingColumn("y".to_string()))?;
        let request = FitRequest {
            sigmas: features.prior_scales(),
            x: features.x.clone(),
            y: y_scaled,
            t: frame.t.clone(),
            t_change: t_change.clone(),
            cap: frame.cap_scaled.clone(),
            tau: self.config.changepoint_prior_scale,
            s_a: component_table.s_a(),
            s_m: component_table.s_m(),
            growth,
        };
        let draws = self.estimate(&request)?;
        let mut params = ParameterSet::new(draws)?;
        if changepoints.is_empty() {
            for draw in &mut params.draws {
                draw.k += draw.delta.iter().sum::<f64>();
                draw.delta.iter_mut().for_each(|d| *d = 0.0);
            }
        }

        Ok(FittedModel {
            document: ModelDocument {
                version: MODEL_DOCUMENT_VERSION,
                config: self.config,
                feature_spec: spec,
                user_holidays: self.holidays,
                country_holidays: self.country_holidays,
                scales,
                changepoints: changepoints.into_iter().map(format_ds).collect(),
                t_change,
                history,
                params,
                trained_holidays,
                columns: features.columns,
                component_table,
            },
            backend: self.backend,
            calendar: self.calendar,
        })
    }

    fn estimate(&self, request: &FitRequest) -> Result<Vec<Draw>> {
        let (k, m) = request
            .growth
            .initial_params(&request.t, &request.y, &request.cap);
        let init = Draw {
            k,
            m,
            delta: vec![0.0; request.t_change.len()],
            beta: vec![0.0; request.x.ncols()],
            sigma_obs: 1.0,
            diagnostics: BTreeMap::new(),
        };

        let constant = request.y.windows(2).all(|w| w[0] == w[1]);
        if constant && request.growth != Growth::Logistic {
            info!("All y values are equal, skipping optimization");
            return Ok(vec![Draw {
                sigma_obs: CONSTANT_SERIES_SIGMA,
                ..init
            }]);
        }
        if self.config.mcmc_samples > 0 {
            return sample_flattened(
                self.backend.as_ref(),
                request,
                &init,
                self.config.mcmc_samples,
                MCMC_CHAINS,
            );
        }
        Ok(vec![optimize_with_fallback(self.backend.as_ref(), request, &init)?])
    }
}

/// Serializable state of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub version: u32,
    pub config: ForecasterConfig,
    /// Resolved seasonalities (built-ins included), all holiday events and
    /// regressors with their standardization stats.
    pub feature_spec: FeatureSpec,
    /// Holidays registered directly, without calendar entries.
    pub user_holidays: Vec<HolidayEvent>,
    pub country_holidays: Option<String>,
    pub scales: Scales,
    pub changepoints: Vec<String>,
    pub t_change: Vec<f64>,
    /// Training rows sorted by `ds`.
    pub history: TimeSeriesData,
    pub params: ParameterSet,
    pub trained_holidays: TrainedHolidays,
    pub columns: Vec<FeatureColumn>,
    pub component_table: ComponentTable,
}

/// Raw simulated paths, `rows x samples`.
#[derive(Debug, Clone)]
pub struct PredictiveSamples {
    pub ds: Vec<String>,
    pub yhat: Array2<f64>,
    pub trend: Array2<f64>,
}

/// A fitted, immutable model.
#[derive(Debug, Clone)]
pub struct FittedModel {
    document: ModelDocument,
    backend: Arc<dyn Backend>,
    calendar: Arc<dyn HolidayCalendar>,
}

struct PreparedPrediction {
    frame: PreparedFrame,
    features: FeatureMatrix,
    s_a: Vec<f64>,
    s_m: Vec<f64>,
}

impl FittedModel {
    pub fn config(&self) -> &ForecasterConfig {
        &self.document.config
    }

    pub fn history(&self) -> &TimeSeriesData {
        &self.document.history
    }

    pub fn params(&self) -> &ParameterSet {
        &self.document.params
    }

    pub fn scales(&self) -> &Scales {
        &self.document.scales
    }

    /// Changepoint dates; empty when the trend has a single segment.
    pub fn changepoints(&self) -> &[String] {
        &self.document.changepoints
    }

    /// Changepoints in scaled time.
    pub fn t_change(&self) -> &[f64] {
        &self.document.t_change
    }

    pub fn seasonalities(&self) -> &[Seasonality] {
        &self.document.feature_spec.seasonalities
    }

    pub fn regressors(&self) -> &[Regressor] {
        &self.document.feature_spec.regressors
    }

    pub fn train_holiday_names(&self) -> &[String] {
        &self.document.trained_holidays.names
    }

    pub fn component_names(&self) -> Vec<String> {
        self.document
            .component_table
            .components
            .keys()
            .cloned()
            .collect()
    }

    pub fn document(&self) -> &ModelDocument {
        &self.document
    }

    fn condition_names(&self) -> Vec<String> {
        self.seasonalities()
            .iter()
            .filter_map(|s| s.condition_name.clone())
            .collect()
    }

    fn prepare(&self, data: Option<&TimeSeriesData>) -> Result<PreparedPrediction> {
        let data = data.unwrap_or(&self.document.history);
        if data.is_empty() {
            return Err(AuguryError::Data("Dataframe has no rows".to_string()));
        }
        let spec = &self.document.feature_spec;
        let frame = self.document.scales.prepare(
            data,
            self.document.config.growth,
            &spec.regressors,
            &self.condition_names(),
        )?;
        let features = spec.build(
            &FeatureInputs {
                dates: &frame.dates,
                regressors: &frame.regressors,
                conditions: &frame.conditions,
            },
            Some(&self.document.trained_holidays),
        )?;
        if features.x.ncols() != self.document.columns.len() {
            return Err(AuguryError::State(format!(
                "Feature layout changed: expected {} columns, got {}",
                self.document.columns.len(),
                features.x.ncols()
            )));
        }
        let table = &self.document.component_table;
        Ok(PreparedPrediction {
            frame,
            features,
            s_a: table.s_a(),
            s_m: table.s_m(),
        })
    }

    fn simulation_inputs<'a>(&'a self, prepared: &'a PreparedPrediction) -> SimulationInputs<'a> {
        SimulationInputs {
            growth: self.document.config.growth,
            t: &prepared.frame.t,
            cap_scaled: &prepared.frame.cap_scaled,
            floor: &prepared.frame.floor,
            t_change: &self.document.t_change,
            x: &prepared.features.x,
            s_a: &prepared.s_a,
            s_m: &prepared.s_m,
            y_scale: self.document.scales.y_scale,
        }
    }

    /// Trend at the posterior mean, in original units.
    fn mean_trend(&self, frame: &PreparedFrame) -> Vec<f64> {
        let mean = self.document.params.mean();
        self.document
            .config
            .growth
            .evaluate(
                &frame.t,
                &frame.cap_scaled,
                mean.k,
                mean.m,
                &mean.delta,
                &self.document.t_change,
            )
            .into_iter()
            .zip(&frame.floor)
            .map(|(v, f)| v * self.document.scales.y_scale + f)
            .collect()
    }

    fn seasonal_components(&self, x: &Array2<f64>) -> BTreeMap<String, ComponentForecast> {
        let config = &self.document.config;
        let draws = &self.document.params.draws;
        let bands = config.uncertainty_samples > 0;
        let (lower_p, upper_p) = interval_levels(config.interval_width);
        let y_scale = self.document.scales.y_scale;

        let mut out = BTreeMap::new();
        for (name, info) in &self.document.component_table.components {
            let indicator = self.document.component_table.indicator(name);
            let scale = match info.mode {
                SeasonalityMode::Additive => y_scale,
                SeasonalityMode::Multiplicative => 1.0,
            };
            // rows x draws
            let per_draw: Vec<Array1<f64>> = draws
                .iter()
                .map(|d| {
                    let beta_c: Array1<f64> = d
                        .beta
                        .iter()
                        .zip(&indicator)
                        .map(|(b, i)| b * i)
                        .collect();
                    x.dot(&beta_c) * scale
                })
                .collect();
            let n_rows = x.nrows();
            let mut values = Vec::with_capacity(n_rows);
            let mut lower = Vec::with_capacity(n_rows);
            let mut upper = Vec::with_capacity(n_rows);
            let mut row = Vec::with_capacity(draws.len());
            for i in 0..n_rows {
                row.clear();
                row.extend(per_draw.iter().map(|c| c[i]));
                values.push(row.iter().sum::<f64>() / row.len().max(1) as f64);
                if bands {
                    lower.push(percentile(&row, lower_p));
                    upper.push(percentile(&row, upper_p));
                }
            }
            out.insert(
                name.clone(),
                ComponentForecast {
                    values,
                    lower: bands.then_some(lower),
                    upper: bands.then_some(upper),
                },
            );
        }
        out
    }

    /// Forecast for `data`, or for the training history when `None`.
    /// Intervals use an RNG seeded from the configured seed.
    pub fn predict(&self, data: Option<&TimeSeriesData>) -> Result<ForecastResult> {
        let mut rng = StdRng::seed_from_u64(self.document.config.seed);
        self.predict_with_rng(data, &mut rng)
    }

    pub fn predict_with_rng(
        &self,
        data: Option<&TimeSeriesData>,
        rng: &mut StdRng,
    ) -> Result<ForecastResult> {
        let prepared = self.prepare(data)?;
        let frame = &prepared.frame;
        let trend = self.mean_trend(frame);
        let components = self.seasonal_components(&prepared.features.x);

        let zeros = vec![0.0; frame.len()];
        let additive = components
            .get("additive_terms")
            .map_or(zeros.as_slice(), |c| c.values.as_slice());
        let multiplicative = components
            .get("multiplicative_terms")
            .map_or(zeros.as_slice(), |c| c.values.as_slice());
        let yhat = trend
            .iter()
            .zip(multiplicative)
            .zip(additive)
            .map(|((t, m), a)| t * (1.0 + m) + a)
            .collect();

        let config = &self.document.config;
        let (mut yhat_lower, mut yhat_upper, mut trend_lower, mut trend_upper) =
            (None, None, None, None);
        if config.uncertainty_samples > 0 {
            let inputs = self.simulation_inputs(&prepared);
            let paths =
                inputs.simulate(&self.document.params.draws, config.uncertainty_samples, rng);
            let (lo, hi) = interval_levels(config.interval_width);
            yhat_lower = Some(row_percentiles(&paths.yhat, lo));
            yhat_upper = Some(row_percentiles(&paths.yhat, hi));
            trend_lower = Some(row_percentiles(&paths.trend, lo));
            trend_upper = Some(row_percentiles(&paths.trend, hi));
        }

        Ok(ForecastResult {
            ds: frame.dates.iter().map(|d| format_ds(*d)).collect(),
            trend,
            trend_lower,
            trend_upper,
            cap: frame.cap.clone(),
            floor: self
                .document
                .scales
                .logistic_floor
                .then(|| frame.floor.clone()),
            components,
            yhat,
            yhat_lower,
            yhat_upper,
        })
    }

    /// Simulated `yhat` and trend paths, one column per sample.
    pub fn predictive_samples(
        &self,
        data: Option<&TimeSeriesData>,
        rng: &mut StdRng,
    ) -> Result<PredictiveSamples> {
        let prepared = self.prepare(data)?;
        let inputs = self.simulation_inputs(&prepared);
        let paths = inputs.simulate(
            &self.document.params.draws,
            self.document.config.uncertainty_samples,
            rng,
        );
        let n_rows = prepared.frame.len();
        let to_matrix = |samples: &[Vec<f64>]| {
            Array2::from_shape_fn((n_rows, samples.len()), |(i, s)| samples[s][i])
        };
        Ok(PredictiveSamples {
            ds: prepared.frame.dates.iter().map(|d| format_ds(*d)).collect(),
            yhat: to_matrix(&paths.yhat),
            trend: to_matrix(&paths.trend),
        })
    }

    /// Timestamps for `periods` steps past the end of the history, optionally
    /// preceded by the history timestamps.
    pub fn make_future_dataframe(
        &self,
        periods: usize,
        freq: Frequency,
        include_history: bool,
    ) -> Result<TimeSeriesData> {
        let history = &self.document.history;
        let last = history
            .ds
            .last()
            .ok_or_else(|| AuguryError::State("Model has no history".to_string()))
            .and_then(|s| parse_required(s))?;
        let mut ds = if include_history {
            history.ds.clone()
        } else {
            Vec::new()
        };
        ds.extend(future_dates(last, periods, freq)?.into_iter().map(format_ds));
        Ok(TimeSeriesData::from_dates(ds))
    }

    /// An unfitted copy for refitting on history up to `cutoff`: same
    /// hyperparameters, the resolved seasonalities made explicit, and
    /// specified changepoints restricted to before the last history date.
    pub fn to_builder(&self, cutoff: Option<NaiveDateTime>) -> Result<Forecaster> {
        let doc = &self.document;
        let mut config = doc.config.clone();
        config.yearly_seasonality = SeasonalityToggle::Disabled;
        config.weekly_seasonality = SeasonalityToggle::Disabled;
        config.daily_seasonality = SeasonalityToggle::Disabled;

        if let Some(specified) = &doc.config.changepoints {
            let mut kept = Vec::with_capacity(specified.len());
            let last_before = match cutoff {
                Some(c) => {
                    let (dates, _) = sort_by_ds(&doc.history)?;
                    dates.into_iter().filter(|d| *d <= c).max()
                }
                None => None,
            };
            for cp in specified {
                let parsed = parse_required(cp)?;
                if last_before.map_or(true, |l| parsed < l) {
                    kept.push(cp.clone());
                }
            }
            config.n_changepoints = kept.len();
            config.changepoints = Some(kept);
        }

        let mut regressors = doc.feature_spec.regressors.clone();
        for r in &mut regressors {
            r.mu = 0.0;
            r.std = 1.0;
        }
        Ok(Forecaster {
            config,
            seasonalities: doc.feature_spec.seasonalities.clone(),
            holidays: doc.user_holidays.clone(),
            country_holidays: doc.country_holidays.clone(),
            regressors,
            backend: Arc::clone(&self.backend),
            calendar: Arc::clone(&self.calendar),
        })
    }

    /// Holiday calendar used when this model's copies are refit.
    pub fn with_holiday_calendar(mut self, calendar: Arc<dyn HolidayCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    /// Backend used when this model's copies are refit.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.document)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: ModelDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    pub fn from_document(document: ModelDocument) -> Result<Self> {
        if document.version != MODEL_DOCUMENT_VERSION {
            return Err(AuguryError::State(format!(
                "Unsupported model document version {} (expected {})",
                document.version, MODEL_DOCUMENT_VERSION
            )));
        }
        let backend = Arc::new(LbfgsBackend::new(document.config.optimizer.clone()));
        Ok(Self {
            document,
            backend,
            calendar: Arc::new(HolidayTable::new()),
        })
    }
}
