use crate::features::FeatureSet;
use chrono::NaiveDate;

/// One training/prediction sample: `sequence_length` consecutive feature
/// rows flattened row-major, paired with the target aligned to the last
/// covered date. `anchor_row` indexes that date in the daily log-return
/// series so the risk aggregator can slice history up to the anchor.
#[derive(Clone, Debug)]
pub struct Window {
    pub features: Vec<f64>,
    pub target: Vec<f64>,
    pub anchor_date: NaiveDate,
    pub anchor_row: usize,
}

/// Slices the aligned tables into overlapping windows. Produces exactly
/// `max(rows - sequence_length, 0)` windows; zero windows means the caller
/// has a fatal configuration problem (not enough history for the chosen
/// sequence length) and must abort before the walk-forward loop.
pub fn build_windows(fs: &FeatureSet, sequence_length: usize) -> Vec<Window> {
    let rows = fs.len();
    if rows <= sequence_length {
        return Vec::new();
    }
    let width = fs.width();
    let mut out = Vec::with_capacity(rows - sequence_length);
    for i in 0..rows - sequence_length {
        let last = i + sequence_length - 1;
        let mut features = Vec::with_capacity(sequence_length * width);
        for row in &fs.features[i..i + sequence_length] {
            features.extend_from_slice(row);
        }
        out.push(Window {
            features,
            target: fs.targets[last].clone(),
            anchor_date: fs.dates[last],
            anchor_row: fs.return_rows[last],
        });
    }
    out
}
