use crate::data::Panel;
use crate::stats::{ewm_mean, ewm_std, rolling_std, shift_back};
use chrono::NaiveDate;

/// Aligned feature/target tables produced by the feature builder. Row `k`
/// describes one retained date: `features[k]` holds the three per-asset
/// blocks (ewm volatility, log return, liquidity) concatenated to width
/// `3 * asset_count`, `targets[k]` the forward realized volatility per
/// asset, and `return_rows[k]` the index of that date in the daily
/// log-return series.
#[derive(Clone, Debug)]
pub struct FeatureSet {
    pub dates: Vec<NaiveDate>,
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<Vec<f64>>,
    pub return_rows: Vec<usize>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn width(&self) -> usize {
        self.features.first().map(|r| r.len()).unwrap_or(0)
    }
}

/// Derives model inputs and targets from a panel.
///
/// Per asset: the target is the trailing rolling std of log returns over
/// `horizon` observations shifted back by `horizon` rows, so the value at a
/// date covers the `horizon` days that follow it; the volatility feature is
/// the ewm std (span `horizon`) of the same returns; the liquidity feature
/// is the ewm mean (span `horizon`) of first-differenced `ln(1+volume)`.
/// Rows lacking a full history or a defined target are dropped by the
/// alignment pass; no imputation anywhere.
pub fn build_features(panel: &Panel, horizon: usize) -> FeatureSet {
    let num_assets = panel.num_assets();
    let returns = panel.log_returns();
    let dates = panel.return_dates();
    let n = returns.len();

    let mut vol_features = Vec::with_capacity(num_assets);
    let mut liq_features = Vec::with_capacity(num_assets);
    let mut targets = Vec::with_capacity(num_assets);
    for a in 0..num_assets {
        let ret_col: Vec<f64> = returns.iter().map(|row| row[a]).collect();
        vol_features.push(ewm_std(&ret_col, horizon));
        targets.push(shift_back(&rolling_std(&ret_col, horizon), horizon));

        // Log-volume differences line up with the return rows: the k-th
        // difference spans the same pair of days as the k-th return.
        let log_volume: Vec<f64> = panel.volumes.iter().map(|row| row[a].ln_1p()).collect();
        let dlv: Vec<f64> = log_volume.windows(2).map(|w| w[1] - w[0]).collect();
        liq_features.push(ewm_mean(&dlv, horizon));
    }

    let mut raw_dates = Vec::with_capacity(n);
    let mut raw_rows = Vec::with_capacity(n);
    let mut raw_targets = Vec::with_capacity(n);
    let mut raw_return_rows = Vec::with_capacity(n);
    for k in 0..n {
        let mut row = Vec::with_capacity(3 * num_assets);
        for a in 0..num_assets {
            row.push(vol_features[a][k]);
        }
        for a in 0..num_assets {
            row.push(returns[k][a]);
        }
        for a in 0..num_assets {
            row.push(liq_features[a][k]);
        }
        let target: Vec<f64> = (0..num_assets).map(|a| targets[a][k]).collect();
        raw_dates.push(dates[k]);
        raw_rows.push(row);
        raw_targets.push(target);
        raw_return_rows.push(k);
    }

    align_and_drop(raw_dates, raw_rows, raw_targets, raw_return_rows)
}

/// The sole missing-data policy: keep a row only when every feature and
/// every target entry is finite. Idempotent on already-aligned input.
pub fn align_and_drop(
    dates: Vec<NaiveDate>,
    features: Vec<Vec<f64>>,
    targets: Vec<Vec<f64>>,
    return_rows: Vec<usize>,
) -> FeatureSet {
    let mut out = FeatureSet {
        dates: Vec::new(),
        features: Vec::new(),
        targets: Vec::new(),
        return_rows: Vec::new(),
    };
    for (((date, row), target), return_row) in dates
        .into_iter()
        .zip(features)
        .zip(targets)
        .zip(return_rows)
    {
        let complete =
            row.iter().all(|v| v.is_finite()) && target.iter().all(|v| v.is_finite());
        if complete {
            out.dates.push(date);
            out.features.push(row);
            out.targets.push(target);
            out.return_rows.push(return_row);
        }
    }
    out
}
