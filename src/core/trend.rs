use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AuguryError, Result};

// Below this the next segment's rate is treated as zero and the offset
// adjustment is skipped.
const RATE_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Growth {
    #[default]
    Linear,
    Logistic,
    Flat,
}

impl FromStr for Growth {
    type Err = AuguryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Growth::Linear),
            "logistic" => Ok(Growth::Logistic),
            "flat" => Ok(Growth::Flat),
            _ => Err(AuguryError::Configuration(format!(
                "Parameter \"growth\" should be \"linear\", \"logistic\", or \"flat\", got {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for Growth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Growth::Linear => "linear",
            Growth::Logistic => "logistic",
            Growth::Flat => "flat",
        };
        f.write_str(s)
    }
}

impl Growth {
    /// Evaluate the trend in scaled units. `cap` is only read for logistic growth.
    pub fn evaluate(
        self,
        t: &[f64],
        cap: &[f64],
        k: f64,
        m: f64,
        delta: &[f64],
        t_change: &[f64],
    ) -> Vec<f64> {
        match self {
            Growth::Linear => piecewise_linear(t, delta, k, m, t_change),
            Growth::Logistic => piecewise_logistic(t, cap, delta, k, m, t_change),
            Growth::Flat => flat_trend(t, m),
        }
    }

    /// Starting `(k, m)` for the optimizer from the first and last scaled points.
    pub fn initial_params(self, t: &[f64], y_scaled: &[f64], cap_scaled: &[f64]) -> (f64, f64) {
        match self {
            Growth::Linear => linear_growth_init(t, y_scaled),
            Growth::Logistic => logistic_growth_init(t, y_scaled, cap_scaled),
            Growth::Flat => flat_growth_init(y_scaled),
        }
    }

    /// Vector-Jacobian product of the trend with respect to `(k, m, delta)`.
    ///
    /// Returns `sum_i weights[i] * d trend[i] / d theta` packed as
    /// `[k, m, delta_0, .., delta_{S-1}]`. `t_change` must be sorted.
    #[allow(clippy::too_many_arguments)]
    pub fn vjp(
        self,
        t: &[f64],
        cap: &[f64],
        k: f64,
        m: f64,
        delta: &[f64],
        t_change: &[f64],
        weights: &[f64],
    ) -> Vec<f64> {
        match self {
            Growth::Linear => linear_vjp(t, t_change, weights),
            Growth::Logistic => logistic_vjp(t, cap, k, m, delta, t_change, weights),
            Growth::Flat => {
                let mut grad = vec![0.0; 2 + t_change.len()];
                grad[1] = weights.iter().sum();
                grad
            }
        }
    }
}

/// Row indices of the history used as automatic changepoints.
///
/// Picks `n_changepoints` evenly spaced rows among the first
/// `floor(n_rows * changepoint_range)`, never row 0. The count is reduced
/// when the history is too short to hold them.
pub fn select_changepoints(
    n_rows: usize,
    n_changepoints: usize,
    changepoint_range: f64,
) -> Vec<usize> {
    let hist_size = (n_rows as f64 * changepoint_range).floor() as usize;
    let mut n = n_changepoints;
    if n + 1 > hist_size {
        n = hist_size.saturating_sub(1);
        info!(
            requested = n_changepoints,
            using = n,
            "n_changepoints greater than number of observations"
        );
    }
    if n == 0 {
        return Vec::new();
    }
    let step = (hist_size - 1) as f64 / n as f64;
    (1..=n).map(|i| (i as f64 * step).round() as usize).collect()
}

/// Piecewise linear trend: rate `k + sum(delta)` and offset `m - sum(t_s * delta)`
/// over the changepoints at or before each t.
pub fn piecewise_linear(t: &[f64], delta: &[f64], k: f64, m: f64, t_change: &[f64]) -> Vec<f64> {
    t.iter()
        .map(|&ti| {
            let mut k_t = k;
            let mut m_t = m;
            for (&t_s, &d) in t_change.iter().zip(delta) {
                if ti >= t_s {
                    k_t += d;
                    m_t -= t_s * d;
                }
            }
            k_t * ti + m_t
        })
        .collect()
}

/// Flat trend: constant baseline
pub fn flat_trend(t: &[f64], m: f64) -> Vec<f64> {
    vec![m; t.len()]
}

/// Cumulative rates `[k, k + d0, k + d0 + d1, ..]`, one longer than `delta`.
fn cumulative_rates(k: f64, delta: &[f64]) -> Vec<f64> {
    let mut k_s = Vec::with_capacity(delta.len() + 1);
    k_s.push(k);
    for &d in delta {
        let last = k_s[k_s.len() - 1];
        k_s.push(last + d);
    }
    k_s
}

fn rate_ratio(k_prev: f64, k_next: f64) -> f64 {
    if k_next.abs() > RATE_EPS {
        1.0 - k_prev / k_next
    } else {
        0.0
    }
}

/// Logistic gamma: offset adjustments for piecewise continuity
/// gamma[i] = (t_change[i] - m - sum(gamma[..i])) * (1 - k_s[i] / k_s[i+1])
pub fn logistic_gamma(k: f64, m: f64, delta: &[f64], t_change: &[f64]) -> Vec<f64> {
    let k_s = cumulative_rates(k, delta);
    let mut gamma = vec![0.0; t_change.len()];
    let mut m_pr = m;
    for (i, &t_s) in t_change.iter().enumerate() {
        gamma[i] = (t_s - m_pr) * rate_ratio(k_s[i], k_s[i + 1]);
        m_pr += gamma[i];
    }
    gamma
}

/// Piecewise logistic trend with changepoints
/// trend = cap / (1 + exp(-(k + A*delta)*(t - (m + A*gamma))))
pub fn piecewise_logistic(
    t: &[f64],
    cap: &[f64],
    delta: &[f64],
    k: f64,
    m: f64,
    t_change: &[f64],
) -> Vec<f64> {
    let gamma = logistic_gamma(k, m, delta, t_change);
    t.iter()
        .zip(cap)
        .map(|(&ti, &c)| {
            let mut k_t = k;
            let mut m_t = m;
            for ((&t_s, &d), &g) in t_change.iter().zip(delta).zip(&gamma) {
                if ti >= t_s {
                    k_t += d;
                    m_t += g;
                }
            }
            c / (1.0 + (-k_t * (ti - m_t)).exp())
        })
        .collect()
}

fn linear_vjp(t: &[f64], t_change: &[f64], weights: &[f64]) -> Vec<f64> {
    let mut grad = vec![0.0; 2 + t_change.len()];
    for (&ti, &w) in t.iter().zip(weights) {
        grad[0] += w * ti;
        grad[1] += w;
        for (j, &t_s) in t_change.iter().enumerate() {
            if ti >= t_s {
                grad[2 + j] += w * (ti - t_s);
            }
        }
    }
    grad
}

#[allow(clippy::too_many_arguments)]
fn logistic_vjp(
    t: &[f64],
    cap: &[f64],
    k: f64,
    m: f64,
    delta: &[f64],
    t_change: &[f64],
    weights: &[f64],
) -> Vec<f64> {
    let s = t_change.len();
    let p = 2 + s;
    let k_s = cumulative_rates(k, delta);

    // Offsets m_s after j active changepoints, with forward derivatives of
    // both the rate and the offset for every j in 0..=s.
    let mut m_s = vec![m; s + 1];
    let mut dk = vec![vec![0.0; p]; s + 1];
    let mut dm = vec![vec![0.0; p]; s + 1];
    for (j, row) in dk.iter_mut().enumerate() {
        row[0] = 1.0;
        for l in 0..j {
            row[2 + l] = 1.0;
        }
    }
    dm[0][1] = 1.0;
    for j in 0..s {
        let (kp, kn) = (k_s[j], k_s[j + 1]);
        let (r, dr) = if kn.abs() > RATE_EPS {
            let dr: Vec<f64> = (0..p)
                .map(|q| -(dk[j][q] * kn - kp * dk[j + 1][q]) / (kn * kn))
                .collect();
            (1.0 - kp / kn, dr)
        } else {
            (0.0, vec![0.0; p])
        };
        let gap = t_change[j] - m_s[j];
        m_s[j + 1] = m_s[j] + gap * r;
        let next: Vec<f64> = (0..p)
            .map(|q| dm[j][q] - dm[j][q] * r + gap * dr[q])
            .collect();
        dm[j + 1] = next;
    }

    // Rows sharing the same number of active changepoints share derivative
    // tables, so accumulate per bucket first.
    let mut a_sum = vec![0.0; s + 1];
    let mut b_sum = vec![0.0; s + 1];
    for ((&ti, &c), &w) in t.iter().zip(cap).zip(weights) {
        let a = t_change.partition_point(|&t_s| t_s <= ti);
        let z = k_s[a] * (ti - m_s[a]);
        let sig = 1.0 / (1.0 + (-z).exp());
        let scale = w * c * sig * (1.0 - sig);
        a_sum[a] += scale * (ti - m_s[a]);
        b_sum[a] += scale * k_s[a];
    }

    let mut grad = vec![0.0; p];
    for a in 0..=s {
        for q in 0..p {
            grad[q] += a_sum[a] * dk[a][q] - b_sum[a] * dm[a][q];
        }
    }
    grad
}

fn linear_growth_init(t: &[f64], y_scaled: &[f64]) -> (f64, f64) {
    let i1 = t.len() - 1;
    let span = t[i1] - t[0];
    let k = if span > 0.0 {
        (y_scaled[i1] - y_scaled[0]) / span
    } else {
        0.0
    };
    (k, y_scaled[0] - k * t[0])
}

fn logistic_growth_init(t: &[f64], y_scaled: &[f64], cap_scaled: &[f64]) -> (f64, f64) {
    let i1 = t.len() - 1;
    let span = t[i1] - t[0];

    // Force valid values, in case y > cap or y < 0
    let (c0, c1) = (cap_scaled[0], cap_scaled[i1]);
    let y0 = y_scaled[0].min(0.99 * c0).max(0.01 * c0);
    let y1 = y_scaled[i1].min(0.99 * c1).max(0.01 * c1);

    let mut r0 = c0 / y0;
    let r1 = c1 / y1;
    if (r0 - r1).abs() <= 0.01 {
        r0 *= 1.05;
    }
    let l0 = (r0 - 1.0).ln();
    let l1 = (r1 - 1.0).ln();

    let m = l0 * span / (l0 - l1);
    let k = (l0 - l1) / span;
    (k, m)
}

fn flat_growth_init(y_scaled: &[f64]) -> (f64, f64) {
    let m = y_scaled.iter().sum::<f64>() / y_scaled.len().max(1) as f64;
    (0.0, m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_growth_from_str() {
        assert_eq!("linear".parse::<Growth>().unwrap(), Growth::Linear);
        assert_eq!("Logistic".parse::<Growth>().unwrap(), Growth::Logistic);
        assert_eq!("flat".parse::<Growth>().unwrap(), Growth::Flat);
        let err = "cubic".parse::<Growth>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_select_changepoints() {
        let idx = select_changepoints(100, 5, 0.8);
        assert_eq!(idx.len(), 5);
        assert!(idx.iter().all(|&i| i >= 1 && i < 80));
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*idx.last().unwrap(), 79);
    }

    #[test]
    fn test_select_changepoints_clamps_to_history() {
        // hist_size = floor(10 * 0.8) = 8, so at most 7 changepoints
        let idx = select_changepoints(10, 25, 0.8);
        assert_eq!(idx, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(select_changepoints(1, 25, 0.8).is_empty());
        assert!(select_changepoints(100, 0, 0.8).is_empty());
    }

    #[test]
    fn test_piecewise_linear_no_changepoints() {
        let trend = piecewise_linear(&[0.0, 0.5, 1.0], &[], 2.0, 10.0, &[]);
        assert_relative_eq!(trend[0], 10.0);
        assert_relative_eq!(trend[1], 11.0);
        assert_relative_eq!(trend[2], 12.0);
    }

    #[test]
    fn test_piecewise_linear_changepoint() {
        let t = vec![0.0, 0.25, 0.5, 0.75, 1.0];
        let trend = piecewise_linear(&t, &[-2.0], 1.0, 0.0, &[0.5]);
        // rises to 0.5 then falls with slope -1
        assert_relative_eq!(trend[2], 0.5);
        assert_relative_eq!(trend[3], 0.25);
        assert_relative_eq!(trend[4], 0.0);
    }

    #[test]
    fn test_flat_trend() {
        let trend = flat_trend(&[0.0, 0.5, 1.0, 2.0, 3.0], 42.0);
        assert_eq!(trend.len(), 5);
        assert!(trend.iter().all(|&x| (x - 42.0).abs() < 1e-10));
    }

    #[test]
    fn test_linear_continuity_at_changepoints() {
        let t_change = vec![0.2, 0.45, 0.7];
        let delta = vec![0.8, -1.3, 2.1];
        for &t_s in &t_change {
            let before = piecewise_linear(&[t_s - 1e-13], &delta, 0.4, 1.1, &t_change)[0];
            let at = piecewise_linear(&[t_s], &delta, 0.4, 1.1, &t_change)[0];
            assert!((before - at).abs() < 1e-12);
        }
    }

    #[test]
    fn test_logistic_continuity_at_changepoints() {
        let t_change = vec![0.3, 0.6];
        let delta = vec![0.7, -0.4];
        for &t_s in &t_change {
            let t = [t_s - 1e-14, t_s];
            let trend = piecewise_logistic(&t, &[1.0, 1.0], &delta, 1.5, 0.2, &t_change);
            assert!((trend[0] - trend[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_logistic_gamma_guards_zero_rate() {
        // k + delta[0] == 0 leaves the offset untouched
        let gamma = logistic_gamma(0.5, 0.1, &[-0.5], &[0.4]);
        assert_eq!(gamma, vec![0.0]);
    }

    #[test]
    fn test_piecewise_logistic_monotonic() {
        let t = vec![0.0, 0.5, 1.0];
        let cap = vec![100.0, 100.0, 100.0];
        let trend = piecewise_logistic(&t, &cap, &[], 0.5, 0.5, &[]);
        assert!(trend.iter().all(|&x| x < 100.0));
        assert!(trend[0] < trend[1]);
        assert!(trend[1] < trend[2]);
        assert_relative_eq!(trend[1], 50.0);
    }

    fn finite_difference_vjp(growth: Growth, theta: &[f64], t: &[f64], cap: &[f64], t_change: &[f64], w: &[f64]) -> Vec<f64> {
        let f = |th: &[f64]| -> f64 {
            let trend = growth.evaluate(t, cap, th[0], th[1], &th[2..], t_change);
            trend.iter().zip(w).map(|(a, b)| a * b).sum()
        };
        let h = 1e-6;
        (0..theta.len())
            .map(|q| {
                let mut plus = theta.to_vec();
                let mut minus = theta.to_vec();
                plus[q] += h;
                minus[q] -= h;
                (f(&plus) - f(&minus)) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_vjp_matches_finite_differences() {
        let t: Vec<f64> = (0..40).map(|i| i as f64 / 39.0).collect();
        let cap: Vec<f64> = t.iter().map(|ti| 2.0 + 0.5 * ti).collect();
        let w: Vec<f64> = (0..40).map(|i| ((i * 7) % 11) as f64 / 5.0 - 1.0).collect();
        let t_change = vec![0.25, 0.5, 0.75];
        let theta = vec![1.2, 0.3, 0.4, -0.6, 0.9];

        for growth in [Growth::Linear, Growth::Logistic, Growth::Flat] {
            let analytic = growth.vjp(&t, &cap, theta[0], theta[1], &theta[2..], &t_change, &w);
            let numeric = finite_difference_vjp(growth, &theta, &t, &cap, &t_change, &w);
            for (a, n) in analytic.iter().zip(&numeric) {
                assert!((a - n).abs() < 1e-5 * (1.0 + n.abs()), "{:?}: {} vs {}", growth, a, n);
            }
        }
    }

    #[test]
    fn test_linear_init() {
        let (k, m) = Growth::Linear.initial_params(&[0.0, 0.5, 1.0], &[0.2, 0.9, 0.6], &[]);
        assert_relative_eq!(k, 0.4);
        assert_relative_eq!(m, 0.2);
    }

    #[test]
    fn test_logistic_init_recovers_curve() {
        // y = c / (1 + exp(-k (t - m))) with k = 4, m = 0.5 at both ends
        let c = 1.0;
        let y = |t: f64| c / (1.0 + (-4.0 * (t - 0.5_f64)).exp());
        let (k, m) = Growth::Logistic.initial_params(&[0.0, 1.0], &[y(0.0), y(1.0)], &[c, c]);
        assert_relative_eq!(k, 4.0, epsilon = 1e-9);
        assert_relative_eq!(m, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_logistic_init_perturbs_equal_ratios() {
        let (k, m) = Growth::Logistic.initial_params(&[0.0, 1.0], &[0.5, 0.5], &[1.0, 1.0]);
        assert!(k.is_finite() && m.is_finite());
        assert!(k != 0.0);
    }

    #[test]
    fn test_flat_init() {
        let (k, m) = Growth::Flat.initial_params(&[0.0, 1.0], &[0.2, 0.4], &[]);
        assert_eq!(k, 0.0);
        assert_relative_eq!(m, 0.3);
    }
}
