use crate::train::WalkForwardReport;
use anyhow::{Context, Result};
use std::path::Path;

/// Persists the full run for offline analysis. The logical content (step
/// records, asset order, return history) round-trips through
/// `load_report`.
pub fn save_report(path: &Path, report: &WalkForwardReport) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report)
        .with_context(|| format!("failed to serialize results to {}", path.display()))?;
    Ok(())
}

/// Reload for offline analysis of a persisted run.
#[allow(dead_code)]
pub fn load_report(path: &Path) -> Result<WalkForwardReport> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    serde_json::from_reader(reader)
        .with_context(|| format!("failed to parse results from {}", path.display()))
}

fn mean_and_spread(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Final per-asset summary, computed from the step records alone.
pub fn print_summary(report: &WalkForwardReport) {
    let num_assets = report.assets.len();
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             Walk-Forward Volatility Summary                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Steps: {:>4}   Assets: {:>3}                                  ║",
        report.steps.len(),
        num_assets
    );
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Asset       MAE (mean±sd)      RMSE (mean±sd)    Dir.Acc    ║");
    println!("╠══════════════════════════════════════════════════════════════╣");

    for (i, asset) in report.assets.iter().enumerate() {
        let mae: Vec<f64> = report.steps.iter().map(|s| s.mae[i]).collect();
        let rmse: Vec<f64> = report.steps.iter().map(|s| s.rmse[i]).collect();
        let hits: Vec<f64> = report
            .steps
            .iter()
            .filter_map(|s| s.directional_hit.as_ref().map(|h| h[i]))
            .collect();

        let (mae_mean, mae_sd) = mean_and_spread(&mae);
        let (rmse_mean, rmse_sd) = mean_and_spread(&rmse);
        let dir_acc = if hits.is_empty() {
            "   n/a ".to_string()
        } else {
            format!("{:>6.1}%", 100.0 * hits.iter().sum::<f64>() / hits.len() as f64)
        };

        println!(
            "║  {:<8} {:>8.5}±{:<8.5} {:>8.5}±{:<8.5} {}    ║",
            asset, mae_mean, mae_sd, rmse_mean, rmse_sd, dir_acc
        );
    }

    let pred_vols: Vec<f64> = report
        .steps
        .iter()
        .map(|s| s.predicted_portfolio_vol)
        .filter(|v| v.is_finite())
        .collect();
    let real_vols: Vec<f64> = report
        .steps
        .iter()
        .map(|s| s.realized_portfolio_vol)
        .filter(|v| v.is_finite())
        .collect();
    let (pred_mean, _) = mean_and_spread(&pred_vols);
    let (real_mean, _) = mean_and_spread(&real_vols);

    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Portfolio volatility: predicted mean={:>9.6}              ║",
        pred_mean
    );
    println!(
        "║                        realized  mean={:>9.6}              ║",
        real_mean
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}
