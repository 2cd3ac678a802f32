use crate::data_loader::Scaling;
use crate::neural_net::Activation;
use crate::optimizer::OptimizerKind;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Everything needed to reproduce a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub hidden_sizes: Vec<usize>,
    pub hidden_activation: Activation,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub test_fraction: f64,
    pub stratify: bool,
    pub scaling: Scaling,
    pub seed: u64,
    /// Early-stopping patience in epochs; 0 trains for the full `epochs`.
    pub patience: usize,
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            hidden_sizes: vec![10, 10],
            hidden_activation: Activation::Relu,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.01,
            epochs: 100,
            batch_size: 16,
            test_fraction: 0.2,
            stratify: true,
            scaling: Scaling::MinMax,
            seed: 42,
            patience: 0,
            log_every: 10,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            bail!("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.hidden_sizes.is_empty() || self.hidden_sizes.contains(&0) {
            bail!("hidden sizes must be non-empty and positive, got {:?}", self.hidden_sizes);
        }
        if self.hidden_activation == Activation::Softmax {
            bail!("softmax cannot be used as a hidden activation");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            bail!("test fraction must lie in (0, 1), got {}", self.test_fraction);
        }
        Ok(())
    }
}
