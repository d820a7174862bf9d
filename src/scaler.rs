/// Feature-wise standardizer (zero mean, unit variance), fitted on a
/// training subset only and re-applied as-is at prediction time. Rows may be
/// flattened sequences: each row is consumed in chunks of `width`, so a
/// window of shape `(L, F)` contributes `L` observations per feature.
#[derive(Clone, Debug)]
pub struct Standardizer {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Standardizer {
    pub fn fit<'a, I>(rows: I, width: usize) -> Self
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut count = 0usize;
        let mut sum = vec![0.0; width];
        let mut sum_sq = vec![0.0; width];
        for row in rows {
            for chunk in row.chunks_exact(width) {
                count += 1;
                for (c, &v) in chunk.iter().enumerate() {
                    sum[c] += v;
                    sum_sq[c] += v * v;
                }
            }
        }

        let n = count.max(1) as f64;
        let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let std: Vec<f64> = sum_sq
            .iter()
            .zip(mean.iter())
            .map(|(s2, m)| {
                let var = if count > 1 {
                    (s2 - n * m * m) / (n - 1.0)
                } else {
                    0.0
                };
                var.max(0.0).sqrt() + 1e-6
            })
            .collect();
        Self { mean, std }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Per-feature scale, used to map standardized spreads back to raw units.
    pub fn scale(&self) -> &[f64] {
        &self.std
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        let w = self.width();
        row.iter()
            .enumerate()
            .map(|(i, v)| (v - self.mean[i % w]) / self.std[i % w])
            .collect()
    }

    pub fn inverse_transform(&self, row: &[f64]) -> Vec<f64> {
        let w = self.width();
        row.iter()
            .enumerate()
            .map(|(i, v)| v * self.std[i % w] + self.mean[i % w])
            .collect()
    }
}
