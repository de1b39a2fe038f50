//! Parameter estimation boundary.
//!
//! The model hands a [`FitRequest`] and a starting [`Draw`] to a [`Backend`]
//! and gets draws back; nothing else about the estimator leaks into the
//! trend or feature code. [`LbfgsBackend`] is the in-process MAP estimator.

use std::collections::BTreeMap;
use std::fmt;

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::gradientdescent::SteepestDescent;
use argmin::solver::linesearch::condition::ArmijoCondition;
use argmin::solver::linesearch::{BacktrackingLineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::objective::Objective;
use crate::core::trend::Growth;
use crate::{AuguryError, Result};

/// Everything an estimator needs, in scaled units.
#[derive(Debug, Clone)]
pub struct FitRequest {
    /// Feature matrix, rows x columns.
    pub x: Array2<f64>,
    pub y: Vec<f64>,
    pub t: Vec<f64>,
    pub t_change: Vec<f64>,
    pub cap: Vec<f64>,
    /// Per-column prior scales.
    pub sigmas: Vec<f64>,
    /// Changepoint prior scale.
    pub tau: f64,
    pub s_a: Vec<f64>,
    pub s_m: Vec<f64>,
    pub growth: Growth,
}

/// One posterior draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub k: f64,
    pub m: f64,
    pub delta: Vec<f64>,
    pub beta: Vec<f64>,
    pub sigma_obs: f64,
    /// Estimator-specific scalars (objective value, iteration count, ...).
    #[serde(default)]
    pub diagnostics: BTreeMap<String, f64>,
}

/// All draws of a fitted model; a MAP fit holds exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub draws: Vec<Draw>,
}

fn mean_of(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    values.sum::<f64>() / n as f64
}

fn mean_vec<'a>(rows: impl Iterator<Item = &'a Vec<f64>>, width: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; width];
    for row in rows {
        for (o, v) in out.iter_mut().zip(row) {
            *o += v;
        }
    }
    out.iter_mut().for_each(|o| *o /= n as f64);
    out
}

impl ParameterSet {
    pub fn new(draws: Vec<Draw>) -> Result<Self> {
        if draws.is_empty() {
            return Err(AuguryError::Optimization(
                "Estimator returned no draws".to_string(),
            ));
        }
        Ok(Self { draws })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Posterior mean of every parameter, as a single draw.
    pub fn mean(&self) -> Draw {
        let n = self.draws.len().max(1);
        let n_delta = self.draws.first().map_or(0, |d| d.delta.len());
        let n_beta = self.draws.first().map_or(0, |d| d.beta.len());
        Draw {
            k: mean_of(self.draws.iter().map(|d| d.k), n),
            m: mean_of(self.draws.iter().map(|d| d.m), n),
            delta: mean_vec(self.draws.iter().map(|d| &d.delta), n_delta, n),
            beta: mean_vec(self.draws.iter().map(|d| &d.beta), n_beta, n),
            sigma_obs: mean_of(self.draws.iter().map(|d| d.sigma_obs), n),
            diagnostics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Quasi-Newton with Moré-Thuente line search.
    Lbfgs,
    /// Gradient descent with Armijo backtracking; slow but robust.
    SteepestDescent,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Lbfgs => f.write_str("L-BFGS"),
            Algorithm::SteepestDescent => f.write_str("steepest descent"),
        }
    }
}

/// A parameter estimator.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Point estimate starting from `init`.
    fn optimize(&self, request: &FitRequest, init: &Draw, algorithm: Algorithm) -> Result<Draw>;

    /// `samples` posterior draws split over `chains` chains, one vec per chain.
    fn sample(
        &self,
        _request: &FitRequest,
        _init: &Draw,
        _samples: usize,
        _chains: usize,
    ) -> Result<Vec<Vec<Draw>>> {
        Err(AuguryError::Configuration(
            "This backend does not support sampling; set mcmc_samples to 0".to_string(),
        ))
    }
}

/// Settings for [`LbfgsBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub max_iters: u64,
    /// L-BFGS memory.
    pub history_size: usize,
    pub tolerance_grad: f64,
    pub tolerance_cost: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iters: 10_000,
            history_size: 5,
            tolerance_grad: 1e-8,
            tolerance_cost: 1e-12,
        }
    }
}

/// In-process MAP estimator built on argmin.
#[derive(Debug, Clone, Default)]
pub struct LbfgsBackend {
    pub config: OptimizerConfig,
}

impl LbfgsBackend {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }
}

struct MapProblem {
    request: FitRequest,
}

impl CostFunction for MapProblem {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let value = Objective::new(&self.request).value(&params.to_vec());
        // Infinite cost makes line searches backtrack instead of failing.
        Ok(if value.is_finite() { value } else { f64::INFINITY })
    }
}

impl Gradient for MapProblem {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let grad = Objective::new(&self.request).gradient(&params.to_vec());
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(argmin::core::Error::msg("non-finite gradient"));
        }
        Ok(Array1::from_vec(grad))
    }
}

type Solved = (Array1<f64>, f64, u64);

impl LbfgsBackend {
    fn run_lbfgs(&self, problem: MapProblem, init: Array1<f64>) -> std::result::Result<Solved, argmin::core::Error> {
        let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
        let solver = LBFGS::new(linesearch, self.config.history_size)
            .with_tolerance_grad(self.config.tolerance_grad)?
            .with_tolerance_cost(self.config.tolerance_cost)?;
        let result = Executor::new(problem, solver)
            .configure(|state| {
                state
                    .param(init)
                    .max_iters(self.config.max_iters)
                    .target_cost(f64::NEG_INFINITY)
            })
            .run()?;
        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| argmin::core::Error::msg("no parameters found"))?;
        Ok((best, state.get_best_cost(), state.get_iter()))
    }

    fn run_steepest_descent(
        &self,
        problem: MapProblem,
        init: Array1<f64>,
    ) -> std::result::Result<Solved, argmin::core::Error> {
        let linesearch = BacktrackingLineSearch::new(ArmijoCondition::new(1e-4)?).rho(0.5)?;
        let solver = SteepestDescent::new(linesearch);
        let result = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(self.config.max_iters))
            .run()?;
        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| argmin::core::Error::msg("no parameters found"))?;
        Ok((best, state.get_best_cost(), state.get_iter()))
    }
}

impl Backend for LbfgsBackend {
    fn optimize(&self, request: &FitRequest, init: &Draw, algorithm: Algorithm) -> Result<Draw> {
        let objective = Objective::new(request);
        let start = Array1::from_vec(objective.pack(init));
        let problem = MapProblem {
            request: request.clone(),
        };
        let solved = match algorithm {
            Algorithm::Lbfgs => self.run_lbfgs(problem, start),
            Algorithm::SteepestDescent => self.run_steepest_descent(problem, start),
        };
        let (best, cost, iterations) =
            solved.map_err(|e| AuguryError::Optimization(format!("{} failed: {}", algorithm, e)))?;
        if !cost.is_finite() || best.iter().any(|v| !v.is_finite()) {
            return Err(AuguryError::Optimization(format!(
                "{} ended at a non-finite point",
                algorithm
            )));
        }
        debug!(%algorithm, iterations, cost, "Optimization finished");

        let mut draw = objective.unpack(&best.to_vec());
        draw.diagnostics.insert("objective".to_string(), cost);
        draw.diagnostics.insert("iterations".to_string(), iterations as f64);
        Ok(draw)
    }
}

/// Point estimate with one retry on the fallback algorithm.
pub fn optimize_with_fallback(backend: &dyn Backend, request: &FitRequest, init: &Draw) -> Result<Draw> {
    match backend.optimize(request, init, Algorithm::Lbfgs) {
        Ok(draw) => Ok(draw),
        Err(first) => {
            warn!(error = %first, "Optimization terminated abnormally, retrying with steepest descent");
            backend
                .optimize(request, init, Algorithm::SteepestDescent)
                .map_err(|second| {
                    AuguryError::Optimization(format!(
                        "Both algorithms failed: {}; {}",
                        first, second
                    ))
                })
        }
    }
}

/// Run the sampler and flatten its chains.
pub fn sample_flattened(
    backend: &dyn Backend,
    request: &FitRequest,
    init: &Draw,
    samples: usize,
    chains: usize,
) -> Result<Vec<Draw>> {
    let per_chain = backend.sample(request, init, samples, chains)?;
    Ok(per_chain.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn linear_request() -> FitRequest {
        let n = 50;
        let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        let y = t
            .iter()
            .enumerate()
            .map(|(i, &ti)| 0.2 + 0.5 * ti + 0.01 * (i as f64 * 1.7).sin())
            .collect();
        FitRequest {
            x: Array2::zeros((n, 1)),
            y,
            t,
            t_change: Vec::new(),
            cap: vec![0.0; n],
            sigmas: vec![1.0],
            tau: 0.05,
            s_a: vec![0.0],
            s_m: vec![0.0],
            growth: Growth::Linear,
        }
    }

    fn init_draw(n_delta: usize, n_beta: usize) -> Draw {
        Draw {
            k: 0.0,
            m: 0.0,
            delta: vec![0.0; n_delta],
            beta: vec![0.0; n_beta],
            sigma_obs: 1.0,
            diagnostics: BTreeMap::new(),
        }
    }

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.max_iters, 10_000);
        assert_eq!(config.history_size, 5);
    }

    #[test]
    fn test_lbfgs_recovers_linear_trend() {
        let req = linear_request();
        let backend = LbfgsBackend::default();
        let draw = backend
            .optimize(&req, &init_draw(0, 1), Algorithm::Lbfgs)
            .unwrap();
        assert!((draw.k - 0.5).abs() < 0.05, "k = {}", draw.k);
        assert!((draw.m - 0.2).abs() < 0.05, "m = {}", draw.m);
        assert!(draw.sigma_obs < 0.1);
        assert!(draw.diagnostics.contains_key("objective"));
    }

    #[test]
    fn test_steepest_descent_improves_objective() {
        let req = linear_request();
        let backend = LbfgsBackend::new(OptimizerConfig {
            max_iters: 200,
            ..OptimizerConfig::default()
        });
        let init = init_draw(0, 1);
        let draw = backend
            .optimize(&req, &init, Algorithm::SteepestDescent)
            .unwrap();
        let obj = Objective::new(&req);
        assert!(obj.value(&obj.pack(&draw)) < obj.value(&obj.pack(&init)));
    }

    #[derive(Debug, Default)]
    struct FlakyBackend {
        calls: AtomicUsize,
        fail_fallback: bool,
    }

    impl Backend for FlakyBackend {
        fn optimize(&self, _request: &FitRequest, init: &Draw, algorithm: Algorithm) -> Result<Draw> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match algorithm {
                Algorithm::SteepestDescent if !self.fail_fallback => Ok(init.clone()),
                _ => Err(AuguryError::Optimization(format!("{} diverged", algorithm))),
            }
        }
    }

    #[test]
    fn test_fallback_retry() {
        let req = linear_request();
        let backend = FlakyBackend::default();
        let draw = optimize_with_fallback(&backend, &req, &init_draw(0, 1)).unwrap();
        assert_eq!(draw.sigma_obs, 1.0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let backend = FlakyBackend {
            fail_fallback: true,
            ..FlakyBackend::default()
        };
        let err = optimize_with_fallback(&backend, &req, &init_draw(0, 1)).unwrap_err();
        assert!(matches!(err, AuguryError::Optimization(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_backend_cannot_sample() {
        let req = linear_request();
        let err = sample_flattened(&LbfgsBackend::default(), &req, &init_draw(0, 1), 10, 4).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_parameter_set_mean() {
        let mut a = init_draw(2, 1);
        a.k = 1.0;
        a.delta = vec![1.0, 0.0];
        let mut b = init_draw(2, 1);
        b.k = 3.0;
        b.delta = vec![0.0, 2.0];
        b.beta = vec![4.0];
        let set = ParameterSet::new(vec![a, b]).unwrap();
        let mean = set.mean();
        assert_relative_eq!(mean.k, 2.0);
        assert_eq!(mean.delta, vec![0.5, 1.0]);
        assert_eq!(mean.beta, vec![2.0]);
        assert!(ParameterSet::new(Vec::new()).is_err());
    }
}
