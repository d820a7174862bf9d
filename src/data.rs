use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use csv::ReaderBuilder;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// A date-indexed close/volume table, one row per trading day, sorted
/// ascending by date. Rows with any missing value across tracked columns are
/// dropped at load time; the in-memory panel is always dense.
#[derive(Clone, Debug)]
pub struct Panel {
    pub dates: Vec<NaiveDate>,
    pub assets: Vec<String>,
    /// `closes[day][asset]`
    pub closes: Vec<Vec<f64>>,
    /// `volumes[day][asset]`
    pub volumes: Vec<Vec<f64>>,
}

impl Panel {
    pub fn num_days(&self) -> usize {
        self.dates.len()
    }

    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    /// Daily log returns, one row per day starting from the second panel
    /// row: `r[k][a] = ln(close[k+1][a] / close[k][a])`.
    pub fn log_returns(&self) -> Vec<Vec<f64>> {
        let a = self.num_assets();
        let mut out = Vec::with_capacity(self.num_days().saturating_sub(1));
        for t in 1..self.num_days() {
            let mut row = Vec::with_capacity(a);
            for i in 0..a {
                row.push((self.closes[t][i] / self.closes[t - 1][i]).ln());
            }
            out.push(row);
        }
        out
    }

    /// Dates aligned with `log_returns` (the panel dates minus the first).
    pub fn return_dates(&self) -> Vec<NaiveDate> {
        self.dates.iter().skip(1).copied().collect()
    }

    /// Deterministic geometric random-walk panel for demos and tests.
    /// Identical seed yields an identical panel.
    pub fn synthetic(num_assets: usize, days: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let assets: Vec<String> = (0..num_assets).map(|i| format!("SYN{}", i + 1)).collect();
        let mut dates = Vec::with_capacity(days);
        let mut closes = Vec::with_capacity(days);
        let mut volumes = Vec::with_capacity(days);

        let mut prices: Vec<f64> = (0..num_assets).map(|i| 100.0 * (1.0 + i as f64 * 0.5)).collect();
        for t in 0..days {
            dates.push(start + Duration::days(t as i64));
            let mut close_row = Vec::with_capacity(num_assets);
            let mut volume_row = Vec::with_capacity(num_assets);
            for (i, price) in prices.iter_mut().enumerate() {
                let vol = 0.01 + 0.004 * i as f64;
                let drift = 0.0002 * (i as f64 + 1.0);
                let z: f64 = rng.sample(StandardNormal);
                *price *= (drift + vol * z).exp();
                close_row.push(*price);

                let zv: f64 = rng.sample(StandardNormal);
                volume_row.push(1.0e6 * (1.0 + 0.2 * i as f64) * (0.3 * zv).exp());
            }
            closes.push(close_row);
            volumes.push(volume_row);
        }

        Self {
            dates,
            assets,
            closes,
            volumes,
        }
    }
}

/// Loads a wide close/volume CSV. The first column is a `%Y-%m-%d` date
/// index; the remaining headers follow `<ASSET>_Close` / `<ASSET>_Volume`,
/// with adjusted-close variants ignored. Rows with any missing or
/// unparseable value are dropped.
pub fn load_panel_csv(path: &Path) -> Result<Panel> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read headers of {}", path.display()))?
        .clone();
    if headers.len() < 2 {
        bail!("{}: expected a date column plus data columns", path.display());
    }

    let mut close_cols: Vec<(String, usize)> = Vec::new();
    let mut volume_cols: HashMap<String, usize> = HashMap::new();
    for (i, h) in headers.iter().enumerate().skip(1) {
        if let Some(asset) = h.strip_suffix("_Close") {
            if asset.contains("Adj") {
                continue;
            }
            close_cols.push((asset.to_string(), i));
        } else if let Some(asset) = h.strip_suffix("_Volume") {
            volume_cols.insert(asset.to_string(), i);
        }
    }

    if close_cols.is_empty() {
        bail!("{}: no <ASSET>_Close columns found", path.display());
    }
    if close_cols.len() != volume_cols.len() {
        bail!(
            "{}: close/volume column mismatch ({} close vs {} volume assets)",
            path.display(),
            close_cols.len(),
            volume_cols.len()
        );
    }
    let mut asset_cols = Vec::with_capacity(close_cols.len());
    for (asset, close_idx) in &close_cols {
        let Some(&volume_idx) = volume_cols.get(asset) else {
            bail!("{}: {}_Close has no matching {}_Volume column", path.display(), asset, asset);
        };
        asset_cols.push((asset.clone(), *close_idx, volume_idx));
    }

    let mut rows: Vec<(NaiveDate, Vec<f64>, Vec<f64>)> = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read a row of {}", path.display()))?;
        let Some(date_str) = record.get(0) else {
            dropped += 1;
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d") else {
            dropped += 1;
            continue;
        };

        let mut close_row = Vec::with_capacity(asset_cols.len());
        let mut volume_row = Vec::with_capacity(asset_cols.len());
        let mut complete = true;
        for (_, close_idx, volume_idx) in &asset_cols {
            let close = record
                .get(*close_idx)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite());
            let volume = record
                .get(*volume_idx)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite());
            match (close, volume) {
                (Some(c), Some(v)) => {
                    close_row.push(c);
                    volume_row.push(v);
                }
                _ => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            rows.push((date, close_row, volume_row));
        } else {
            dropped += 1;
        }
    }

    rows.sort_by_key(|(d, _, _)| *d);
    if dropped > 0 {
        warn!("{}: dropped {} incomplete rows", path.display(), dropped);
    }

    let assets: Vec<String> = asset_cols.iter().map(|(a, _, _)| a.clone()).collect();
    let mut dates = Vec::with_capacity(rows.len());
    let mut closes = Vec::with_capacity(rows.len());
    let mut volumes = Vec::with_capacity(rows.len());
    for (d, c, v) in rows {
        dates.push(d);
        closes.push(c);
        volumes.push(v);
    }

    info!(
        "Loaded panel: {} assets, {} trading days ({} .. {})",
        assets.len(),
        dates.len(),
        dates.first().map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
        dates.last().map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
    );

    Ok(Panel {
        dates,
        assets,
        closes,
        volumes,
    })
}
