use crate::stats::ewm_cov_latest;
use serde::{Deserialize, Serialize};

/// Keeps inverse-uncertainty weights finite when a predictive spread
/// collapses to zero.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Portfolio-level view of one forecast: uncertainty-based allocation
/// weights, the reconstructed predicted covariance, and the portfolio
/// volatility under the predicted and the realized per-asset volatilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskReport {
    pub weights: Vec<f64>,
    pub predicted_portfolio_vol: f64,
    pub realized_portfolio_vol: f64,
    pub predicted_covariance: Vec<Vec<f64>>,
}

/// Inverse of (predictive std + epsilon), normalized to sum to 1. Assets the
/// model is less sure about receive proportionally less capital. Non-finite
/// spreads propagate as NaN weights rather than crashing.
pub fn inverse_uncertainty_weights(pred_std: &[f64]) -> Vec<f64> {
    let raw: Vec<f64> = pred_std.iter().map(|s| 1.0 / (s + WEIGHT_EPSILON)).collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| v / sum).collect()
}

/// Correlation estimate from daily log returns up to the anchor: aggregate
/// into non-overlapping `horizon`-day sums (complete chunks from the start
/// of the series), convert to simple returns via `exp(x) - 1`, take the
/// most recent exponentially-weighted (span `horizon`) covariance, and
/// normalize by the outer product of the per-asset standard deviations.
/// Degenerate entries are sanitized: non-finite values become 1 on the
/// diagonal and 0 off it, and everything is clipped to [-1, 1].
pub fn forecast_correlation(
    daily_log_returns: &[Vec<f64>],
    num_assets: usize,
    horizon: usize,
) -> Vec<Vec<f64>> {
    let chunks = daily_log_returns.len() / horizon.max(1);
    let mut aggregated: Vec<Vec<f64>> = Vec::with_capacity(chunks);
    for c in 0..chunks {
        let mut row = vec![0.0; num_assets];
        for day in &daily_log_returns[c * horizon..(c + 1) * horizon] {
            for (i, r) in day.iter().enumerate() {
                row[i] += r;
            }
        }
        aggregated.push(row.iter().map(|x| x.exp() - 1.0).collect());
    }

    // identity fallback when no complete chunk exists yet
    let mut corr: Vec<Vec<f64>> = (0..num_assets)
        .map(|i| (0..num_assets).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    if let Some(cov) = ewm_cov_latest(&aggregated, horizon) {
        for i in 0..num_assets {
            for j in 0..num_assets {
                corr[i][j] = cov[i][j] / (cov[i][i].sqrt() * cov[j][j].sqrt());
            }
        }
    }
    sanitize_correlation(&mut corr);
    corr
}

fn sanitize_correlation(corr: &mut [Vec<f64>]) {
    for i in 0..corr.len() {
        for j in 0..corr[i].len() {
            let v = corr[i][j];
            corr[i][j] = if v.is_finite() {
                v.clamp(-1.0, 1.0)
            } else if i == j {
                1.0
            } else {
                0.0
            };
        }
    }
}

/// `D · Corr · D` with the volatility vector on the diagonal of D.
pub fn reconstruct_covariance(vols: &[f64], corr: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let a = vols.len();
    let mut cov = vec![vec![0.0; a]; a];
    for i in 0..a {
        for j in 0..a {
            cov[i][j] = vols[i] * corr[i][j] * vols[j];
        }
    }
    cov
}

/// Square root of the quadratic form `wᵀ · C · w`. A negative or non-finite
/// form surfaces as NaN and flows into the step record untouched.
pub fn portfolio_volatility(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let mut var = 0.0;
    for i in 0..weights.len() {
        for j in 0..weights.len() {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var.sqrt()
}

/// Full per-step risk computation. The same single correlation estimate is
/// reused for the predicted and the realized covariance reconstruction; only
/// the diagonal volatilities differ between the two.
pub fn aggregate(
    pred_vol: &[f64],
    pred_std: &[f64],
    true_vol: &[f64],
    daily_log_returns: &[Vec<f64>],
    horizon: usize,
) -> RiskReport {
    let weights = inverse_uncertainty_weights(pred_std);
    let corr = forecast_correlation(daily_log_returns, pred_vol.len(), horizon);
    let predicted_covariance = reconstruct_covariance(pred_vol, &corr);
    let realized_covariance = reconstruct_covariance(true_vol, &corr);
    let predicted_portfolio_vol = portfolio_volatility(&weights, &predicted_covariance);
    let realized_portfolio_vol = portfolio_volatility(&weights, &realized_covariance);
    RiskReport {
        weights,
        predicted_portfolio_vol,
        realized_portfolio_vol,
        predicted_covariance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wavy_returns(days: usize, num_assets: usize) -> Vec<Vec<f64>> {
        (0..days)
            .map(|t| {
                (0..num_assets)
                    .map(|a| 0.01 * ((t as f64) / (2.0 + a as f64)).sin() + 0.001 * a as f64)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn weights_sum_to_one_and_are_positive() {
        let stds = vec![0.02, 0.005, 0.013, 0.04];
        let w = inverse_uncertainty_weights(&stds);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|v| *v > 0.0));
        // the least uncertain asset gets the most capital
        let max_idx = w
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(max_idx, 1);
    }

    #[test]
    fn zero_spread_stays_finite_via_epsilon() {
        let w = inverse_uncertainty_weights(&[0.0, 0.01]);
        assert!(w.iter().all(|v| v.is_finite()));
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn correlation_is_symmetric_unit_diagonal_bounded() {
        let rets = wavy_returns(90, 3);
        let corr = forecast_correlation(&rets, 3, 7);
        for i in 0..3 {
            assert!((corr[i][i] - 1.0).abs() < 1e-9);
            for j in 0..3 {
                assert!((corr[i][j] - corr[j][i]).abs() < 1e-9);
                assert!((-1.0..=1.0).contains(&corr[i][j]));
            }
        }
    }

    #[test]
    fn constant_series_sanitizes_to_identity() {
        let rets: Vec<Vec<f64>> = (0..60).map(|_| vec![0.0, 0.0]).collect();
        let corr = forecast_correlation(&rets, 2, 7);
        assert_eq!(corr[0][0], 1.0);
        assert_eq!(corr[1][1], 1.0);
        assert_eq!(corr[0][1], 0.0);
    }

    #[test]
    fn short_history_sanitizes_to_identity() {
        // fewer days than one horizon chunk
        let rets = wavy_returns(3, 2);
        let corr = forecast_correlation(&rets, 2, 7);
        assert_eq!(corr[0][0], 1.0);
        assert_eq!(corr[0][1], 0.0);
    }

    #[test]
    fn covariance_diagonal_is_squared_volatility() {
        let rets = wavy_returns(90, 2);
        let corr = forecast_correlation(&rets, 2, 7);
        let vols = vec![0.03, 0.07];
        let cov = reconstruct_covariance(&vols, &corr);
        assert!((cov[0][0] - 0.0009).abs() < 1e-12);
        assert!((cov[1][1] - 0.0049).abs() < 1e-12);
    }

    #[test]
    fn aggregate_produces_consistent_report() {
        let rets = wavy_returns(120, 3);
        let report = aggregate(
            &[0.02, 0.03, 0.015],
            &[0.004, 0.002, 0.009],
            &[0.025, 0.028, 0.012],
            &rets,
            7,
        );
        assert!((report.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(report.predicted_portfolio_vol >= 0.0);
        assert!(report.realized_portfolio_vol >= 0.0);
        assert_eq!(report.predicted_covariance.len(), 3);
        // a fully invested portfolio of correlated assets cannot exceed the
        // largest single-asset volatility
        assert!(report.predicted_portfolio_vol <= 0.03 + 1e-9);
    }
}
