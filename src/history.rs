use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// Metrics recorded at the end of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Per-epoch record of a `fit` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochMetrics>,
    /// Set when early stopping ended training before the last configured epoch.
    pub stopped_early_at: Option<usize>,
}

impl History {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.loss).collect()
    }

    /// Epoch with the lowest validation loss, falling back to training loss.
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        let key = |m: &EpochMetrics| m.val_loss.unwrap_or(m.loss);
        self.epochs
            .iter()
            .min_by(|a, b| key(a).total_cmp(&key(b)))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for m in &self.epochs {
            wtr.serialize(m)?;
        }
        wtr.flush()?;
        tracing::debug!("Wrote {} epochs of history to {}", self.len(), path.display());
        Ok(())
    }

    /// Draws loss (`*`) and validation loss (`o`) against epochs as text.
    pub fn render_chart(&self, width: usize, height: usize) -> String {
        let mut out = String::new();
        if self.is_empty() || width < 2 || height < 2 {
            return out;
        }

        let losses = self.losses();
        let val: Vec<Option<f64>> = self.epochs.iter().map(|m| m.val_loss).collect();
        let (lo, hi) = losses
            .iter()
            .chain(val.iter().flatten())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        let span = if hi - lo > f64::EPSILON { hi - lo } else { 1.0 };

        let n = self.epochs.len();
        let cols = width.min(n);
        let mut grid = vec![vec![' '; cols]; height];
        let row_of = |v: f64| {
            let frac = (v - lo) / span;
            height - 1 - ((frac * (height - 1) as f64).round() as usize).min(height - 1)
        };

        for col in 0..cols {
            let idx = if cols == 1 { 0 } else { col * (n - 1) / (cols - 1) };
            let r = row_of(losses[idx]);
            grid[r][col] = '*';
            if let Some(v) = val[idx] {
                let r = row_of(v);
                grid[r][col] = if grid[r][col] == '*' { '#' } else { 'o' };
            }
        }

        for (i, row) in grid.iter().enumerate() {
            let label = if i == 0 {
                format!("{:>9.4}", hi)
            } else if i == height - 1 {
                format!("{:>9.4}", lo)
            } else {
                " ".repeat(9)
            };
            let line: String = row.iter().collect();
            let _ = writeln!(out, "{} |{}", label, line.trim_end());
        }
        let _ = writeln!(out, "{} +{}", " ".repeat(9), "-".repeat(cols));
        let _ = writeln!(
            out,
            "{}  epoch 1{:>w$}",
            " ".repeat(9),
            n,
            w = cols.saturating_sub(7).max(1)
        );
        let _ = writeln!(out, "{}  * loss   o val_loss   # both", " ".repeat(9));
        out
    }
}
