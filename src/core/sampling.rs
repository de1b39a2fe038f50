//! Posterior-predictive simulation for uncertainty intervals.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp1, Poisson, StandardNormal};

use crate::core::optimizer::Draw;
use crate::core::trend::Growth;

const LAPLACE_SCALE_EPS: f64 = 1e-8;

/// Percentile with linear interpolation between order statistics, `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Per-row percentile across sample paths (`samples[s][row]`).
pub fn row_percentiles(samples: &[Vec<f64>], q: f64) -> Vec<f64> {
    let n_rows = samples.first().map_or(0, |s| s.len());
    let mut column = Vec::with_capacity(samples.len());
    (0..n_rows)
        .map(|i| {
            column.clear();
            column.extend(samples.iter().map(|s| s[i]));
            percentile(&column, q)
        })
        .collect()
}

/// Lower and upper percentile levels for an interval width.
pub fn interval_levels(interval_width: f64) -> (f64, f64) {
    (
        100.0 * (1.0 - interval_width) / 2.0,
        100.0 * (1.0 + interval_width) / 2.0,
    )
}

/// Laplace(0, scale): an Exp(1/scale) magnitude with a random sign.
pub fn sample_laplace(rng: &mut StdRng, scale: f64) -> f64 {
    let magnitude: f64 = Exp1.sample(rng);
    let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
    sign * scale * magnitude
}

/// Rows to simulate over, in scaled time and model units.
pub struct SimulationInputs<'a> {
    pub growth: Growth,
    pub t: &'a [f64],
    pub cap_scaled: &'a [f64],
    pub floor: &'a [f64],
    pub t_change: &'a [f64],
    pub x: &'a Array2<f64>,
    pub s_a: &'a [f64],
    pub s_m: &'a [f64],
    pub y_scale: f64,
}

/// Simulated paths in original units, `[sample][row]`.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPaths {
    pub yhat: Vec<Vec<f64>>,
    pub trend: Vec<Vec<f64>>,
}

/// Replicates simulated for each posterior draw.
pub fn samples_per_draw(uncertainty_samples: usize, n_draws: usize) -> usize {
    if n_draws == 0 {
        return 0;
    }
    uncertainty_samples.div_ceil(n_draws).max(1)
}

impl SimulationInputs<'_> {
    /// Trend for one draw with freshly sampled future changepoints, in
    /// original units.
    pub fn sample_predictive_trend(&self, draw: &Draw, rng: &mut StdRng) -> Vec<f64> {
        let t_max = self.t.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let n_hist = self.t_change.len();

        let mut t_change = self.t_change.to_vec();
        let mut delta = draw.delta.clone();
        if t_max > 1.0 {
            let rate = n_hist as f64 * (t_max - 1.0);
            let n_new = match Poisson::new(rate) {
                Ok(poisson) => poisson.sample(rng) as usize,
                Err(_) => 0,
            };
            if n_new > 0 {
                let mean_abs = if draw.delta.is_empty() {
                    0.0
                } else {
                    draw.delta.iter().map(|d| d.abs()).sum::<f64>() / draw.delta.len() as f64
                };
                let scale = mean_abs + LAPLACE_SCALE_EPS;
                let mut new_t: Vec<f64> = (0..n_new).map(|_| rng.gen_range(1.0..t_max)).collect();
                new_t.sort_by(|a, b| a.total_cmp(b));
                t_change.extend(new_t);
                delta.extend((0..n_new).map(|_| sample_laplace(rng, scale)));
            }
        }

        self.growth
            .evaluate(self.t, self.cap_scaled, draw.k, draw.m, &delta, &t_change)
            .into_iter()
            .zip(self.floor)
            .map(|(v, f)| v * self.y_scale + f)
            .collect()
    }

    /// One simulated `(yhat, trend)` path for a draw.
    pub fn sample_path(&self, draw: &Draw, rng: &mut StdRng) -> (Vec<f64>, Vec<f64>) {
        let trend = self.sample_predictive_trend(draw, rng);
        let beta_a: Array1<f64> = draw.beta.iter().zip(self.s_a).map(|(b, a)| b * a).collect();
        let beta_m: Array1<f64> = draw.beta.iter().zip(self.s_m).map(|(b, m)| b * m).collect();
        let xb_a = self.x.dot(&beta_a);
        let xb_m = self.x.dot(&beta_m);
        let noise_scale = draw.sigma_obs * self.y_scale;
        let yhat = trend
            .iter()
            .enumerate()
            .map(|(i, &tr)| {
                let noise: f64 = rng.sample(StandardNormal);
                tr * (1.0 + xb_m[i]) + self.y_scale * xb_a[i] + noise * noise_scale
            })
            .collect();
        (yhat, trend)
    }

    /// Simulate `samples_per_draw` paths for every draw.
    pub fn simulate(&self, draws: &[Draw], uncertainty_samples: usize, rng: &mut StdRng) -> SimulatedPaths {
        let per_draw = samples_per_draw(uncertainty_samples, draws.len());
        let mut paths = SimulatedPaths {
            yhat: Vec::with_capacity(per_draw * draws.len()),
            trend: Vec::with_capacity(per_draw * draws.len()),
        };
        for draw in draws {
            for _ in 0..per_draw {
                let (yhat, trend) = self.sample_path(draw, rng);
                paths.yhat.push(yhat);
                paths.trend.push(trend);
            }
        }
        paths
    }
}
