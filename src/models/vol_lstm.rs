use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap, LSTM, LSTMConfig, RNN};
use rand::{rngs::StdRng, Rng};

// ── Dropout helper ─────────────────────────────────────────────────────────────
/// Inverted dropout: zeros elements with probability `p` and scales the
/// survivors by 1/(1-p). The mask is drawn from the caller's seeded RNG so a
/// fixed seed reproduces the exact training trajectory and Monte Carlo draws.
pub fn dropout(x: &Tensor, p: f64, rng: &mut StdRng) -> Result<Tensor> {
    if p <= 0.0 || p >= 1.0 {
        return Ok(x.clone());
    }
    let scale = (1.0 / (1.0 - p)) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.r#gen::<f64>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?;
    x.mul(&mask)
}

/// Stochastic regularization unit with its own activation flag, independent
/// of the encoder's train/eval mode. Training and Monte Carlo sampling turn
/// it on; deterministic evaluation leaves it off.
#[derive(Debug)]
pub struct McDropout {
    p: f64,
    active: bool,
}

impl McDropout {
    pub fn new(p: f64) -> Self {
        Self { p, active: false }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn forward(&self, x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        if self.active {
            dropout(x, self.p, rng)
        } else {
            Ok(x.clone())
        }
    }
}

// ── Sequence-to-vector volatility regressor ────────────────────────────────────
/// Multi-layer LSTM encoder over a `(batch, seq_len, features)` window. The
/// final layer's last-time-step hidden state passes through the MC dropout
/// unit, a ReLU, and a single linear projection to one volatility forecast
/// per asset.
pub struct VolLstm {
    lstm_layers: Vec<LSTM>,
    mc_unit: McDropout,
    projection: Linear,
    dropout_rate: f64,
}

impl VolLstm {
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        num_assets: usize,
        dropout_rate: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut lstm_layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let cfg = LSTMConfig {
                layer_idx: i,
                ..Default::default()
            };
            lstm_layers.push(candle_nn::lstm(in_dim, hidden_dim, cfg, vb.pp(format!("lstm_{}", i)))?);
        }
        let projection = candle_nn::linear(hidden_dim, num_assets, vb.pp("projection"))?;
        Ok(Self {
            lstm_layers,
            mc_unit: McDropout::new(dropout_rate),
            projection,
            dropout_rate,
        })
    }

    pub fn mc_unit(&self) -> &McDropout {
        &self.mc_unit
    }

    pub fn mc_unit_mut(&mut self) -> &mut McDropout {
        &mut self.mc_unit
    }

    /// `train` gates only the inter-layer dropout; the head unit consults its
    /// own flag so sampling can stay stochastic while the encoder is in
    /// deterministic evaluation mode.
    pub fn forward(&self, x: &Tensor, train: bool, rng: &mut StdRng) -> Result<Tensor> {
        let mut current_input = x.clone();
        let num_layers = self.lstm_layers.len();

        let mut last_h = None;
        for (i, lstm) in self.lstm_layers.iter().enumerate() {
            let states = lstm.seq(&current_input)?;
            last_h = Some(
                states
                    .last()
                    .ok_or_else(|| candle_core::Error::Msg("Empty LSTM sequence".into()))?
                    .h
                    .clone(),
            );

            if i < num_layers - 1 {
                let hidden_seq: Vec<Tensor> = states.iter().map(|s| s.h.clone()).collect();
                current_input = Tensor::stack(&hidden_seq, 1)?;
                if train {
                    current_input = dropout(&current_input, self.dropout_rate, rng)?;
                }
            }
        }

        let h_t = last_h.ok_or_else(|| candle_core::Error::Msg("No LSTM layers".into()))?;
        let h_t = self.mc_unit.forward(&h_t, rng)?;
        let h_t = h_t.relu()?;
        self.projection.forward(&h_t)
    }
}

/// Re-initializes every trainable parameter uniformly in
/// `±1/sqrt(hidden_dim)` from the given RNG, walking variables in sorted
/// name order so identical seeds produce identical models.
pub fn reset_parameters(varmap: &VarMap, hidden_dim: usize, rng: &mut StdRng) -> Result<()> {
    let bound = 1.0 / (hidden_dim as f64).sqrt();
    let data = varmap.data().lock().unwrap();
    let mut names: Vec<String> = data.keys().cloned().collect();
    names.sort();
    for name in &names {
        let var = &data[name];
        let dims = var.as_tensor().dims().to_vec();
        let count = var.as_tensor().elem_count();
        let vals: Vec<f32> = (0..count)
            .map(|_| rng.gen_range(-bound..bound) as f32)
            .collect();
        let init = Tensor::from_vec(vals, dims.as_slice(), var.as_tensor().device())?;
        var.set(&init)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::SeedableRng;

    fn build_model(input_dim: usize, num_assets: usize) -> (VarMap, VolLstm) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VolLstm::new(input_dim, 16, 2, num_assets, 0.3, vb.pp("model")).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        reset_parameters(&varmap, 16, &mut rng).unwrap();
        (varmap, model)
    }

    fn toy_input(device: &Device) -> Tensor {
        let data: Vec<f32> = (0..2 * 5 * 6).map(|i| (i as f32 * 0.17).sin()).collect();
        Tensor::from_vec(data, (2, 5, 6), device).unwrap()
    }

    #[test]
    fn forward_produces_one_output_per_asset() {
        let (_varmap, model) = build_model(6, 4);
        let x = toy_input(&Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&x, false, &mut rng).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
    }

    #[test]
    fn deterministic_eval_ignores_the_rng() {
        let (_varmap, model) = build_model(6, 3);
        let x = toy_input(&Device::Cpu);
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(999);
        let a = model.forward(&x, false, &mut rng_a).unwrap().to_vec2::<f32>().unwrap();
        let b = model.forward(&x, false, &mut rng_b).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn active_mc_unit_perturbs_eval_outputs() {
        let (_varmap, mut model) = build_model(6, 3);
        let x = toy_input(&Device::Cpu);
        model.mc_unit_mut().set_active(true);
        let mut rng = StdRng::seed_from_u64(5);
        let a = model.forward(&x, false, &mut rng).unwrap().to_vec2::<f32>().unwrap();
        let b = model.forward(&x, false, &mut rng).unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(a, b, "stochastic passes should differ while the unit is active");
    }

    #[test]
    fn seeded_dropout_is_reproducible() {
        let device = Device::Cpu;
        let x = Tensor::ones((4, 8), DType::F32, &device).unwrap();
        let mut rng_a = StdRng::seed_from_u64(21);
        let mut rng_b = StdRng::seed_from_u64(21);
        let a = dropout(&x, 0.5, &mut rng_a).unwrap().to_vec2::<f32>().unwrap();
        let b = dropout(&x, 0.5, &mut rng_b).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reset_parameters_is_deterministic() {
        let (varmap_a, _model_a) = build_model(6, 3);
        let (varmap_b, _model_b) = build_model(6, 3);
        let data_a = varmap_a.data().lock().unwrap();
        let data_b = varmap_b.data().lock().unwrap();
        for (name, var) in data_a.iter() {
            let a = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = data_b[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b, "parameter {} differs between identically seeded models", name);
        }
    }
}
