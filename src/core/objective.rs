//! Negative log posterior of the decomposition model and its gradient.
//!
//! Parameters are packed as `[k, m, delta_0..delta_{S-1}, u, beta_0..beta_{K-1}]`
//! with `sigma_obs = exp(u) + SIGMA_OBS_FLOOR`, so every step stays feasible
//! and an exactly representable history cannot drive the noise scale to zero.
//! Priors: `k, m ~ N(0, 5)`, `delta ~ Laplace(0, tau)`, `sigma_obs ~ N+(0, 0.5)`,
//! `beta_j ~ N(0, sigmas[j])`; likelihood `y ~ N(yhat, sigma_obs)` with
//! `yhat = trend * (1 + X beta_m) + X beta_a`. Constants are dropped.

use ndarray::Array1;

use crate::core::optimizer::{Draw, FitRequest};

const PRIOR_VAR_KM: f64 = 25.0;
const SIGMA_PRIOR_VAR: f64 = 0.25;
/// Lower bound on the noise scale, in scaled units.
pub const SIGMA_OBS_FLOOR: f64 = 1e-4;

/// Borrowed view of a fit request that evaluates the objective.
pub struct Objective<'a> {
    request: &'a FitRequest,
}

struct Evaluation {
    value: f64,
    trend: Vec<f64>,
    mult: Array1<f64>,
    residuals: Vec<f64>,
    ssr: f64,
    sigma: f64,
    sigma_excess: f64,
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl<'a> Objective<'a> {
    pub fn new(request: &'a FitRequest) -> Self {
        Self { request }
    }

    fn n_changepoints(&self) -> usize {
        self.request.t_change.len()
    }

    fn n_features(&self) -> usize {
        self.request.x.ncols()
    }

    pub fn n_params(&self) -> usize {
        3 + self.n_changepoints() + self.n_features()
    }

    pub fn pack(&self, draw: &Draw) -> Vec<f64> {
        let mut theta = Vec::with_capacity(self.n_params());
        theta.push(draw.k);
        theta.push(draw.m);
        theta.extend_from_slice(&draw.delta);
        theta.push((draw.sigma_obs - SIGMA_OBS_FLOOR).max(1e-12).ln());
        theta.extend_from_slice(&draw.beta);
        theta
    }

    pub fn unpack(&self, theta: &[f64]) -> Draw {
        let s = self.n_changepoints();
        Draw {
            k: theta[0],
            m: theta[1],
            delta: theta[2..2 + s].to_vec(),
            sigma_obs: theta[2 + s].exp() + SIGMA_OBS_FLOOR,
            beta: theta[3 + s..].to_vec(),
            diagnostics: Default::default(),
        }
    }

    fn evaluate(&self, theta: &[f64]) -> Evaluation {
        let req = self.request;
        let s = self.n_changepoints();
        let (k, m) = (theta[0], theta[1]);
        let delta = &theta[2..2 + s];
        let beta = &theta[3 + s..];
        let sigma_excess = theta[2 + s].exp();
        let sigma = sigma_excess + SIGMA_OBS_FLOOR;

        let trend = req
            .growth
            .evaluate(&req.t, &req.cap, k, m, delta, &req.t_change);
        let beta_a: Array1<f64> = beta.iter().zip(&req.s_a).map(|(b, a)| b * a).collect();
        let beta_m: Array1<f64> = beta.iter().zip(&req.s_m).map(|(b, s)| b * s).collect();
        let add = req.x.dot(&beta_a);
        let mult = req.x.dot(&beta_m);

        let residuals: Vec<f64> = req
            .y
            .iter()
            .enumerate()
            .map(|(i, &yi)| yi - (trend[i] * (1.0 + mult[i]) + add[i]))
            .collect();
        let ssr: f64 = residuals.iter().map(|r| r * r).sum();
        let n = req.y.len() as f64;

        let mut value = ssr / (2.0 * sigma * sigma) + n * sigma.ln();
        value += sigma * sigma / (2.0 * SIGMA_PRIOR_VAR);
        value += (k * k + m * m) / (2.0 * PRIOR_VAR_KM);
        value += delta.iter().map(|d| d.abs()).sum::<f64>() / req.tau;
        value += beta
            .iter()
            .zip(&req.sigmas)
            .map(|(b, s)| b * b / (2.0 * s * s))
            .sum::<f64>();

        Evaluation {
            value,
            trend,
            mult,
            residuals,
            ssr,
            sigma,
            sigma_excess,
        }
    }

    pub fn value(&self, theta: &[f64]) -> f64 {
        self.evaluate(theta).value
    }

    pub fn gradient(&self, theta: &[f64]) -> Vec<f64> {
        self.value_and_gradient(theta).1
    }

    pub fn value_and_gradient(&self, theta: &[f64]) -> (f64, Vec<f64>) {
        let req = self.request;
        let s = self.n_changepoints();
        let (k, m) = (theta[0], theta[1]);
        let delta = &theta[2..2 + s];
        let beta = &theta[3 + s..];
        let eval = self.evaluate(theta);
        let var = eval.sigma * eval.sigma;

        // d value / d yhat
        let g: Array1<f64> = eval.residuals.iter().map(|r| -r / var).collect();
        let trend_weights: Vec<f64> = g
            .iter()
            .zip(eval.mult.iter())
            .map(|(gi, mi)| gi * (1.0 + mi))
            .collect();
        let trend_grad = req.growth.vjp(
            &req.t,
            &req.cap,
            k,
            m,
            delta,
            &req.t_change,
            &trend_weights,
        );

        let mut grad = vec![0.0; self.n_params()];
        grad[0] = trend_grad[0] + k / PRIOR_VAR_KM;
        grad[1] = trend_grad[1] + m / PRIOR_VAR_KM;
        for j in 0..s {
            grad[2 + j] = trend_grad[2 + j] + sign(delta[j]) / req.tau;
        }
        let d_sigma = -eval.ssr / (var * eval.sigma)
            + req.y.len() as f64 / eval.sigma
            + eval.sigma / SIGMA_PRIOR_VAR;
        grad[2 + s] = d_sigma * eval.sigma_excess;

        let xt = req.x.t();
        let g_add = xt.dot(&g);
        let g_trend: Array1<f64> = g.iter().zip(&eval.trend).map(|(gi, ti)| gi * ti).collect();
        let g_mult = xt.dot(&g_trend);
        for j in 0..self.n_features() {
            grad[3 + s + j] = req.s_a[j] * g_add[j]
                + req.s_m[j] * g_mult[j]
                + beta[j] / (req.sigmas[j] * req.sigmas[j]);
        }
        (eval.value, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trend::Growth;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn toy_request(growth: Growth) -> FitRequest {
        let n = 30;
        let t: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        let x = Array2::from_shape_fn((n, 3), |(i, j)| ((i + 1) as f64 * (j + 1) as f64 * 0.37).sin());
        let y: Vec<f64> = t
            .iter()
            .enumerate()
            .map(|(i, &ti)| 0.3 + 0.5 * ti + 0.1 * x[[i, 0]] + 0.05 * ((i * 7) as f64).cos())
            .collect();
        FitRequest {
            x,
            y,
            t,
            t_change: vec![0.25, 0.5, 0.75],
            cap: vec![2.0; n],
            sigmas: vec![10.0, 10.0, 5.0],
            tau: 0.05,
            s_a: vec![1.0, 0.0, 1.0],
            s_m: vec![0.0, 1.0, 0.0],
            growth,
        }
    }

    fn probe_theta() -> Vec<f64> {
        vec![0.4, 0.2, 0.05, -0.03, 0.02, (0.2f64).ln(), 0.1, -0.2, 0.05]
    }

    fn finite_difference(obj: &Objective<'_>, theta: &[f64]) -> Vec<f64> {
        let h = 1e-6;
        (0..theta.len())
            .map(|i| {
                let mut up = theta.to_vec();
                let mut down = theta.to_vec();
                up[i] += h;
                down[i] -= h;
                (obj.value(&up) - obj.value(&down)) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        for growth in [Growth::Linear, Growth::Logistic, Growth::Flat] {
            let req = toy_request(growth);
            let obj = Objective::new(&req);
            let theta = probe_theta();
            let (value, analytic) = obj.value_and_gradient(&theta);
            assert_relative_eq!(value, obj.value(&theta));
            let numeric = finite_difference(&obj, &theta);
            for (a, n) in analytic.iter().zip(&numeric) {
                assert!(
                    (a - n).abs() <= 1e-4 * (1.0 + n.abs()),
                    "{:?}: analytic {} vs numeric {}",
                    growth,
                    a,
                    n
                );
            }
        }
    }

    #[test]
    fn test_pack_unpack() {
        let req = toy_request(Growth::Linear);
        let obj = Objective::new(&req);
        assert_eq!(obj.n_params(), 9);
        let draw = obj.unpack(&probe_theta());
        assert_eq!(draw.delta.len(), 3);
        assert_eq!(draw.beta.len(), 3);
        assert_relative_eq!(draw.sigma_obs, 0.2 + SIGMA_OBS_FLOOR, epsilon = 1e-12);
        let theta = obj.pack(&draw);
        for (a, b) in theta.iter().zip(probe_theta()) {
            assert_relative_eq!(*a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_value_prefers_better_fit() {
        let req = toy_request(Growth::Linear);
        let obj = Objective::new(&req);
        let good = vec![0.5, 0.3, 0.0, 0.0, 0.0, (0.05f64).ln(), 0.1, 0.0, 0.0];
        let bad = vec![-1.0, 2.0, 0.0, 0.0, 0.0, (0.05f64).ln(), 0.0, 0.0, 0.0];
        assert!(obj.value(&good) < obj.value(&bad));
        // zero deltas get a zero subgradient from the Laplace prior
        let grad = obj.gradient(&good);
        assert!(grad.iter().all(|g| g.is_finite()));
    }
}
