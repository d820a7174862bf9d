use crate::config::RunConfig;
use crate::data::Panel;
use crate::features::build_features;
use crate::models::vol_lstm::{reset_parameters, VolLstm};
use crate::risk;
use crate::sampler::mc_forecast;
use crate::scaler::Standardizer;
use crate::windows::{build_windows, Window};
use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, Optimizer, VarBuilder, VarMap};
use chrono::NaiveDate;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// One record per simulated trading day, produced exactly once per step and
/// never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub anchor_date: NaiveDate,
    pub mae: Vec<f64>,
    pub rmse: Vec<f64>,
    /// 1.0/0.0 hit indicator per asset; None until `horizon` steps of
    /// realized history exist.
    pub directional_hit: Option<Vec<f64>>,
    pub predicted_portfolio_vol: f64,
    pub realized_portfolio_vol: f64,
    pub predictive_std: Vec<f64>,
    pub weights: Vec<f64>,
    pub predicted_covariance: Vec<Vec<f64>>,
}

/// Everything a downstream analysis needs: the ordered step records, the
/// asset identifiers in the order used throughout, and the daily log-return
/// history the correlations were estimated from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub assets: Vec<String>,
    pub steps: Vec<StepResult>,
    pub return_dates: Vec<NaiveDate>,
    pub log_returns: Vec<Vec<f64>>,
}

/// Runs the whole retrain-and-predict loop over the panel. The model is
/// created once and warm-starts from step to step; each step re-fits the
/// standardizers on its expanding training subset, retrains with early
/// stopping, restores the best parameter snapshot, and turns one Monte Carlo
/// forecast into a step record.
pub fn run_walk_forward(cfg: &RunConfig, panel: &Panel, device: &Device) -> Result<WalkForwardReport> {
    cfg.validate()?;
    if panel.num_days() < 2 {
        bail!("panel is empty after cleaning; nothing to forecast");
    }

    let feature_set = build_features(panel, cfg.horizon);
    if feature_set.is_empty() {
        bail!(
            "panel produced no aligned feature rows ({} days, horizon {})",
            panel.num_days(),
            cfg.horizon
        );
    }
    let windows = build_windows(&feature_set, cfg.sequence_length);
    if windows.is_empty() {
        bail!(
            "no windows producible: {} aligned rows with sequence length {}",
            feature_set.len(),
            cfg.sequence_length
        );
    }

    let total_windows = windows.len();
    let initial_train_size = (cfg.train_fraction * total_windows as f64).floor() as usize;
    if initial_train_size == 0 {
        bail!(
            "initial training set is empty: {} windows at train fraction {}",
            total_windows,
            cfg.train_fraction
        );
    }
    let Some(n_steps) = total_windows
        .checked_sub(initial_train_size + cfg.horizon)
        .filter(|n| *n > 0)
    else {
        bail!(
            "not enough windows for a walk-forward run: {} windows, {} initial, horizon {}",
            total_windows,
            initial_train_size,
            cfg.horizon
        );
    };

    let num_assets = panel.num_assets();
    let input_dim = feature_set.width();
    let log_returns = panel.log_returns();

    info!(
        "Walk-forward: {} assets, {} windows, {} initial training windows, {} steps",
        num_assets, total_windows, initial_train_size, n_steps
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let mut model = VolLstm::new(
        input_dim,
        cfg.hidden_size,
        cfg.lstm_layers,
        num_assets,
        cfg.dropout,
        vb.pp("model"),
    )?;
    let mut init_rng = StdRng::seed_from_u64(cfg.base_seed);
    reset_parameters(&varmap, cfg.hidden_size, &mut init_rng)?;

    let mut steps = Vec::with_capacity(n_steps);
    let mut realized_history: Vec<Vec<f64>> = Vec::with_capacity(n_steps);
    for t in 0..n_steps {
        let result = run_step(
            cfg,
            device,
            &varmap,
            &mut model,
            &windows,
            initial_train_size,
            t,
            &log_returns,
            &realized_history,
        )?;
        info!(
            "step {:>3}/{}: anchor={} mae={:.6} pred_port_vol={:.6} real_port_vol={:.6}",
            t + 1,
            n_steps,
            result.anchor_date,
            result.mae.iter().sum::<f64>() / num_assets as f64,
            result.predicted_portfolio_vol,
            result.realized_portfolio_vol,
        );
        realized_history.push(windows[initial_train_size + t].target.clone());
        steps.push(result);
    }

    Ok(WalkForwardReport {
        assets: panel.assets.clone(),
        steps,
        return_dates: panel.return_dates(),
        log_returns,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_step(
    cfg: &RunConfig,
    device: &Device,
    varmap: &VarMap,
    model: &mut VolLstm,
    windows: &[Window],
    initial_train_size: usize,
    t: usize,
    log_returns: &[Vec<f64>],
    realized_history: &[Vec<f64>],
) -> Result<StepResult> {
    let step_seed = cfg.base_seed.wrapping_add(t as u64);
    let mut rng = StdRng::seed_from_u64(step_seed);

    let train_windows = &windows[..initial_train_size + t];
    let predict_window = &windows[initial_train_size + t];
    let num_assets = predict_window.target.len();
    let input_dim = predict_window.features.len() / cfg.sequence_length;

    // Standardizers are fitted on the training subset only and applied as-is
    // at prediction time.
    let feature_scaler = Standardizer::fit(
        train_windows.iter().map(|w| w.features.as_slice()),
        input_dim,
    );
    let target_scaler = Standardizer::fit(
        train_windows.iter().map(|w| w.target.as_slice()),
        num_assets,
    );

    let x_rows: Vec<Vec<f32>> = train_windows
        .iter()
        .map(|w| to_f32(&feature_scaler.transform(&w.features)))
        .collect();
    let y_rows: Vec<Vec<f32>> = train_windows
        .iter()
        .map(|w| to_f32(&target_scaler.transform(&w.target)))
        .collect();

    let params = candle_nn::ParamsAdamW {
        lr: cfg.learning_rate,
        ..Default::default()
    };
    let mut opt = candle_nn::AdamW::new(varmap.all_vars(), params)?;

    model.mc_unit_mut().set_active(true);

    let n_train = train_windows.len();
    let num_batches = n_train.div_ceil(cfg.batch_size);
    let mut best_loss = f64::INFINITY;
    let mut best_snapshot: Option<HashMap<String, Tensor>> = None;
    let mut epochs_without_improvement = 0usize;

    for epoch in 0..cfg.max_epochs {
        let mut last_batch_loss = f64::NAN;
        for batch_idx in 0..num_batches {
            // Sequential batches, never shuffled: batch order feeds the
            // gradient trajectory and must stay reproducible.
            let start = batch_idx * cfg.batch_size;
            let end = (start + cfg.batch_size).min(n_train);

            let mut batch_features = Vec::with_capacity(end - start);
            let mut batch_targets = Vec::with_capacity(end - start);
            for idx in start..end {
                batch_features.push(Tensor::from_slice(
                    &x_rows[idx],
                    (cfg.sequence_length, input_dim),
                    device,
                )?);
                batch_targets.push(Tensor::from_slice(&y_rows[idx], (num_assets,), device)?);
            }
            let x = Tensor::stack(&batch_features, 0)?;
            let y = Tensor::stack(&batch_targets, 0)?;

            let pred = model.forward(&x, true, &mut rng)?;
            let batch_loss = composite_loss(&pred, &y, cfg.lambda_dir)?;
            opt.backward_step(&batch_loss)?;
            last_batch_loss = batch_loss.to_scalar::<f32>()? as f64;
        }

        // The final batch's loss is the early-stopping signal; the first
        // epoch unconditionally seeds the snapshot.
        if epoch == 0 || last_batch_loss < best_loss {
            best_loss = last_batch_loss;
            best_snapshot = Some(snapshot_vars(varmap)?);
            epochs_without_improvement = 0;
        } else {
            epochs_without_improvement += 1;
            if epochs_without_improvement >= cfg.patience {
                break;
            }
        }
    }

    if let Some(snapshot) = &best_snapshot {
        restore_vars(varmap, snapshot)?;
    }
    model.mc_unit_mut().set_active(false);

    let x_pred = Tensor::from_slice(
        &to_f32(&feature_scaler.transform(&predict_window.features)),
        (1, cfg.sequence_length, input_dim),
        device,
    )?;
    let forecast = mc_forecast(model, &x_pred, &target_scaler, cfg.mc_samples, step_seed)?;

    let realized = &predict_window.target;
    let mae: Vec<f64> = forecast
        .mean
        .iter()
        .zip(realized.iter())
        .map(|(p, y)| (p - y).abs())
        .collect();
    let rmse: Vec<f64> = forecast
        .mean
        .iter()
        .zip(realized.iter())
        .map(|(p, y)| ((p - y) * (p - y)).sqrt())
        .collect();

    // Direction is judged against the realized level `horizon` steps back;
    // ties count as hits.
    let directional_hit = if t >= cfg.horizon {
        let reference = &realized_history[t - cfg.horizon];
        Some(
            (0..num_assets)
                .map(|i| {
                    let predicted_move = forecast.mean[i] - reference[i];
                    let realized_move = realized[i] - reference[i];
                    if predicted_move * realized_move >= 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        )
    } else {
        None
    };

    let risk = risk::aggregate(
        &forecast.mean,
        &forecast.std,
        realized,
        &log_returns[..=predict_window.anchor_row],
        cfg.horizon,
    );

    Ok(StepResult {
        step: t,
        anchor_date: predict_window.anchor_date,
        mae,
        rmse,
        directional_hit,
        predicted_portfolio_vol: risk.predicted_portfolio_vol,
        realized_portfolio_vol: risk.realized_portfolio_vol,
        predictive_std: forecast.std,
        weights: risk.weights,
        predicted_covariance: risk.predicted_covariance,
    })
}

/// Mean-squared error plus the weighted directional ranking term. The
/// directional logits difference each predicted value against the *true*
/// value one asset slot lower (not against a neighboring prediction) and are
/// scored against the realized ordering of the same slots.
fn composite_loss(pred: &Tensor, target: &Tensor, lambda_dir: f64) -> Result<Tensor> {
    let mse = loss::mse(pred, target)?;
    let (_, num_assets) = target.dims2()?;
    if lambda_dir <= 0.0 || num_assets < 2 {
        return Ok(mse);
    }

    let pred_upper = pred.narrow(1, 1, num_assets - 1)?;
    let true_lower = target.narrow(1, 0, num_assets - 1)?;
    let true_upper = target.narrow(1, 1, num_assets - 1)?;

    let pred_diff = pred_upper.sub(&true_lower)?;
    let true_diff = true_upper.sub(&true_lower)?;
    let labels = true_diff.gt(&true_diff.zeros_like()?)?.to_dtype(DType::F32)?;
    let directional = loss::binary_cross_entropy_with_logit(&pred_diff, &labels)?;

    let total = (mse + directional.affine(lambda_dir, 0.0)?)?;
    Ok(total)
}

fn to_f32(row: &[f64]) -> Vec<f32> {
    row.iter().map(|v| *v as f32).collect()
}

/// Deep copy of every trainable tensor, keyed by variable name.
fn snapshot_vars(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap.data().lock().unwrap();
    let mut snapshot = HashMap::with_capacity(data.len());
    for (name, var) in data.iter() {
        snapshot.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(snapshot)
}

fn restore_vars(varmap: &VarMap, snapshot: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        if let Some(tensor) = snapshot.get(name) {
            var.set(tensor)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Deterministic (non-random) multi-asset panel: trending sinusoid
    /// prices and oscillating volumes.
    fn deterministic_panel(num_assets: usize, days: usize) -> Panel {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let mut dates = Vec::with_capacity(days);
        let mut closes = Vec::with_capacity(days);
        let mut volumes = Vec::with_capacity(days);
        for t in 0..days {
            dates.push(start + Duration::days(t as i64));
            let mut c = Vec::with_capacity(num_assets);
            let mut v = Vec::with_capacity(num_assets);
            for a in 0..num_assets {
                let phase = a as f64 * 1.3;
                c.push(
                    100.0 * (1.0 + 0.1 * a as f64)
                        * (0.001 * t as f64 + 0.04 * (t as f64 / 5.0 + phase).sin()).exp(),
                );
                v.push(2.0e6 * (1.0 + 0.5 * (t as f64 / 7.0 + phase).cos().abs()));
            }
            closes.push(c);
            volumes.push(v);
        }
        Panel {
            dates,
            assets: (0..num_assets).map(|a| format!("T{}", a + 1)).collect(),
            closes,
            volumes,
        }
    }

    fn fast_config() -> RunConfig {
        RunConfig {
            horizon: 7,
            sequence_length: 35,
            train_fraction: 0.8,
            batch_size: 16,
            max_epochs: 2,
            patience: 2,
            learning_rate: 1e-3,
            hidden_size: 16,
            lstm_layers: 1,
            dropout: 0.1,
            mc_samples: 8,
            lambda_dir: 0.2,
            base_seed: 7,
        }
    }

    #[test]
    fn walk_forward_produces_expected_step_count() {
        let panel = deterministic_panel(3, 120);
        let cfg = fast_config();
        let device = Device::Cpu;
        let report = run_walk_forward(&cfg, &panel, &device).unwrap();

        let feature_set = build_features(&panel, cfg.horizon);
        let n = build_windows(&feature_set, cfg.sequence_length).len();
        let expected = n - (0.8 * n as f64).floor() as usize - cfg.horizon;
        assert_eq!(report.steps.len(), expected);
        assert_eq!(report.assets.len(), 3);
        assert_eq!(report.log_returns.len(), 119);

        for (i, step) in report.steps.iter().enumerate() {
            assert_eq!(step.step, i);
            assert_eq!(step.mae.len(), 3);
            assert!(step.mae.iter().all(|v| *v >= 0.0));
            assert!(step.rmse.iter().all(|v| *v >= 0.0));
            assert!(step.predicted_portfolio_vol >= 0.0);
            assert!(step.realized_portfolio_vol >= 0.0);
            assert!((step.weights.iter().sum::<f64>() - 1.0).abs() < 1e-6);
            assert_eq!(step.predicted_covariance.len(), 3);
            if i < cfg.horizon {
                assert!(step.directional_hit.is_none());
            } else {
                let hits = step.directional_hit.as_ref().unwrap();
                assert!(hits.iter().all(|h| *h == 0.0 || *h == 1.0));
            }
        }

        // anchors move strictly forward in time
        for pair in report.steps.windows(2) {
            assert!(pair[0].anchor_date < pair[1].anchor_date);
        }
    }

    #[test]
    fn identical_seeds_reproduce_the_run() {
        let panel = deterministic_panel(2, 110);
        let cfg = RunConfig {
            max_epochs: 1,
            mc_samples: 4,
            ..fast_config()
        };
        let device = Device::Cpu;
        let a = run_walk_forward(&cfg, &panel, &device).unwrap();
        let b = run_walk_forward(&cfg, &panel, &device).unwrap();
        assert_eq!(a.steps.len(), b.steps.len());
        for (sa, sb) in a.steps.iter().zip(b.steps.iter()) {
            assert_eq!(sa.mae, sb.mae);
            assert_eq!(sa.predictive_std, sb.predictive_std);
            assert_eq!(sa.weights, sb.weights);
        }
    }

    #[test]
    fn too_short_panel_is_a_fatal_configuration_error() {
        let panel = deterministic_panel(2, 40);
        let cfg = fast_config();
        let device = Device::Cpu;
        let err = run_walk_forward(&cfg, &panel, &device).unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("windows"), "unexpected diagnostic: {}", msg);
    }

    #[test]
    fn composite_loss_adds_directional_term() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.5f32, 0.2, 0.9, 0.1, 0.4, 0.8], (2, 3), &device).unwrap();
        let target = Tensor::from_vec(vec![0.4f32, 0.3, 0.7, 0.2, 0.5, 0.6], (2, 3), &device).unwrap();

        let plain = composite_loss(&pred, &target, 0.0).unwrap().to_scalar::<f32>().unwrap();
        let with_dir = composite_loss(&pred, &target, 0.5).unwrap().to_scalar::<f32>().unwrap();
        assert!(with_dir > plain, "directional term must add a positive penalty");
    }

    #[test]
    fn snapshot_restore_round_trips_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = VolLstm::new(4, 8, 1, 2, 0.1, vb.pp("model")).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        reset_parameters(&varmap, 8, &mut rng).unwrap();

        let snapshot = snapshot_vars(&varmap).unwrap();
        // perturb every parameter, then restore
        let mut rng2 = StdRng::seed_from_u64(2);
        reset_parameters(&varmap, 8, &mut rng2).unwrap();
        restore_vars(&varmap, &snapshot).unwrap();

        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            let restored = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let saved = snapshot[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(restored, saved, "parameter {} was not restored", name);
        }
    }
}
