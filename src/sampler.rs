use crate::models::vol_lstm::VolLstm;
use crate::scaler::Standardizer;
use anyhow::Result;
use candle_core::Tensor;
use rand::{rngs::StdRng, SeedableRng};

/// Elementwise summary of the Monte Carlo predictive distribution, expressed
/// in raw target units.
#[derive(Clone, Debug)]
pub struct McForecast {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// Runs `mc_samples` stochastic forward passes over one standardized window
/// `(1, seq_len, features)` with the encoder in deterministic evaluation
/// mode and the MC dropout unit forced active. The unit's previous flag is
/// restored afterwards, so the model handle comes back unchanged. A fixed
/// seed reproduces the draws exactly.
pub fn mc_forecast(
    model: &mut VolLstm,
    input: &Tensor,
    target_scaler: &Standardizer,
    mc_samples: usize,
    seed: u64,
) -> Result<McForecast> {
    let mut rng = StdRng::seed_from_u64(seed);
    let was_active = model.mc_unit().is_active();
    model.mc_unit_mut().set_active(true);

    let result = (|| -> Result<Vec<Vec<f64>>> {
        let mut draws: Vec<Vec<f64>> = Vec::with_capacity(mc_samples);
        for _ in 0..mc_samples {
            let out = model.forward(input, false, &mut rng)?;
            let row = out.squeeze(0)?.to_vec1::<f32>()?;
            draws.push(row.into_iter().map(f64::from).collect());
        }
        Ok(draws)
    })();
    model.mc_unit_mut().set_active(was_active);
    let draws = result?;

    let num_assets = target_scaler.width();
    let n = draws.len() as f64;
    let mut mean_std_units = vec![0.0; num_assets];
    for row in &draws {
        for (i, v) in row.iter().enumerate() {
            mean_std_units[i] += v;
        }
    }
    for m in mean_std_units.iter_mut() {
        *m /= n;
    }

    let mut std_units = vec![0.0; num_assets];
    if draws.len() > 1 {
        for row in &draws {
            for (i, v) in row.iter().enumerate() {
                let d = v - mean_std_units[i];
                std_units[i] += d * d;
            }
        }
        for s in std_units.iter_mut() {
            *s = (*s / (n - 1.0)).sqrt();
        }
    }

    let mean = target_scaler.inverse_transform(&mean_std_units);
    let std: Vec<f64> = std_units
        .iter()
        .zip(target_scaler.scale().iter())
        .map(|(s, scale)| s * scale)
        .collect();

    Ok(McForecast { mean, std })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vol_lstm::reset_parameters;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn fixture() -> (VolLstm, Tensor, Standardizer) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut model = VolLstm::new(4, 12, 2, 3, 0.25, vb.pp("model")).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        reset_parameters(&varmap, 12, &mut rng).unwrap();
        model.mc_unit_mut().set_active(false);

        let data: Vec<f32> = (0..6 * 4).map(|i| (i as f32 * 0.31).cos()).collect();
        let input = Tensor::from_vec(data, (1, 6, 4), &device).unwrap();

        let target_rows = vec![vec![0.01, 0.02, 0.03], vec![0.015, 0.025, 0.02], vec![0.02, 0.01, 0.04]];
        let scaler = Standardizer::fit(target_rows.iter().map(|r| r.as_slice()), 3);
        (model, input, scaler)
    }

    #[test]
    fn fixed_seed_reproduces_mean_and_std() {
        let (mut model, input, scaler) = fixture();
        let a = mc_forecast(&mut model, &input, &scaler, 16, 77).unwrap();
        let b = mc_forecast(&mut model, &input, &scaler, 16, 77).unwrap();
        assert_eq!(a.mean, b.mean);
        assert_eq!(a.std, b.std);
    }

    #[test]
    fn different_seeds_differ() {
        let (mut model, input, scaler) = fixture();
        let a = mc_forecast(&mut model, &input, &scaler, 16, 1).unwrap();
        let b = mc_forecast(&mut model, &input, &scaler, 16, 2).unwrap();
        assert_ne!(a.mean, b.mean);
    }

    #[test]
    fn mc_flag_is_restored() {
        let (mut model, input, scaler) = fixture();
        assert!(!model.mc_unit().is_active());
        mc_forecast(&mut model, &input, &scaler, 4, 9).unwrap();
        assert!(!model.mc_unit().is_active());

        model.mc_unit_mut().set_active(true);
        mc_forecast(&mut model, &input, &scaler, 4, 9).unwrap();
        assert!(model.mc_unit().is_active());
    }

    #[test]
    fn spread_is_nonnegative_and_finite() {
        let (mut model, input, scaler) = fixture();
        let f = mc_forecast(&mut model, &input, &scaler, 32, 5).unwrap();
        assert_eq!(f.mean.len(), 3);
        assert_eq!(f.std.len(), 3);
        assert!(f.std.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}
