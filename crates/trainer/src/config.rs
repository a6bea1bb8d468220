use std::fs;
use std::path::{Path, PathBuf};

use seq_core::{CellKind, ModelConfig, OptimizerKind};
use serde::{Deserialize, Serialize};

use crate::batches::DataLayout;
use crate::error::{Result, TrainError};
use crate::lr::LrPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub train_datafile: PathBuf,
    pub valid_datafile: PathBuf,
    /// Column identifying the entity a row belongs to. Consecutive rows with
    /// the same key form one sequence.
    pub key_name: String,
    /// Column holding the class index to predict.
    pub target_name: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub batch_size: usize,
    pub num_unrollings: usize,

    pub initial_learning_rate: f64,
    /// Factor applied to the learning rate when training performance stalls.
    pub lr_decay: f64,
    /// Number of earlier epochs the latest training cost is compared against.
    pub lookback: usize,
    pub min_learning_rate: f64,

    pub max_epoch: usize,
    /// Passes over the training data per epoch.
    pub passes: usize,
    pub model_dir: PathBuf,

    /// Exclude the first `min_history` steps of every validation sequence from the averages.
    pub skip_predata: bool,
    pub min_history: usize,
    /// Re-evaluate the training data after each epoch and print it next to the validation numbers.
    pub check: bool,
    /// Continue from the newest checkpoint in `model_dir`, with its learning rate and training history.
    pub resume: bool,

    pub num_hidden: i64,
    pub num_layers: i64,
    pub cell: CellKind,
    pub keep_prob: f64,
    pub max_grad_norm: f64,
    pub optimizer: OptimizerKind,
    pub seed: Option<i64>,
    pub verbose: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_datafile: PathBuf::from("data/train.dat"),
            valid_datafile: PathBuf::from("data/valid.dat"),
            key_name: "key".to_string(),
            target_name: "target".to_string(),
            num_inputs: 8,
            num_outputs: 2,
            batch_size: 64,
            num_unrollings: 20,
            initial_learning_rate: 1.0,
            lr_decay: 0.9,
            lookback: 5,
            min_learning_rate: 0.0,
            max_epoch: 10,
            passes: 1,
            model_dir: PathBuf::from("./checkpoints"),
            skip_predata: false,
            min_history: 0,
            check: false,
            resume: false,
            num_hidden: 128,
            num_layers: 1,
            cell: CellKind::Lstm,
            keep_prob: 1.0,
            max_grad_norm: 5.0,
            optimizer: OptimizerKind::Sgd,
            seed: None,
            verbose: true,
        }
    }
}

impl TrainerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TrainerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_inputs", self.num_inputs),
            ("num_outputs", self.num_outputs),
            ("batch_size", self.batch_size),
            ("num_unrollings", self.num_unrollings),
            ("passes", self.passes),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TrainError::Configuration(format!("{} must be positive", name)));
        }
        if !(self.initial_learning_rate > 0.0) {
            return Err(TrainError::Configuration(format!(
                "initial_learning_rate must be positive, got {}",
                self.initial_learning_rate
            )));
        }
        if self.num_hidden <= 0 || self.num_layers <= 0 {
            return Err(TrainError::Configuration(
                "num_hidden and num_layers must be positive".to_string(),
            ));
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(TrainError::Configuration(format!(
                "keep_prob must be in (0, 1], got {}",
                self.keep_prob
            )));
        }
        self.lr_policy()?;
        Ok(())
    }

    pub fn lr_policy(&self) -> Result<LrPolicy> {
        LrPolicy::new(self.lr_decay, self.lookback, self.min_learning_rate)
    }

    pub fn data_layout(&self) -> DataLayout {
        DataLayout {
            key_name: self.key_name.clone(),
            target_name: self.target_name.clone(),
            num_inputs: self.num_inputs,
            num_outputs: self.num_outputs,
            batch_size: self.batch_size,
            num_unrollings: self.num_unrollings,
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            num_inputs: self.num_inputs as i64,
            num_outputs: self.num_outputs as i64,
            num_hidden: self.num_hidden,
            num_layers: self.num_layers,
            batch_size: self.batch_size,
            num_unrollings: self.num_unrollings,
            cell: self.cell,
            keep_prob: self.keep_prob,
            max_grad_norm: self.max_grad_norm,
            optimizer: self.optimizer,
            initial_learning_rate: self.initial_learning_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let yaml = r#"
train_datafile: data/a.dat
valid_datafile: data/b.dat
key_name: gvkey
target_name: label
num_inputs: 3
num_outputs: 4
batch_size: 2
num_unrollings: 5
max_epoch: 7
cell: gru
optimizer: adamw
"#;
        let config: TrainerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.key_name, "gvkey");
        assert_eq!(config.max_epoch, 7);
        assert_eq!(config.cell, CellKind::Gru);
        assert_eq!(config.optimizer, OptimizerKind::AdamW);
        assert_eq!(config.passes, 1);
        assert_eq!(config.lr_decay, 0.9);
        assert!(config.validate().is_ok());

        let model = config.model_config();
        assert_eq!(model.num_inputs, 3);
        assert_eq!(model.num_outputs, 4);
        assert_eq!(config.data_layout().num_unrollings, 5);
    }

    #[test]
    fn rejects_zero_geometry() {
        let config = TrainerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::Configuration(_))));
    }

    #[test]
    fn rejects_non_positive_learning_rate() {
        let config = TrainerConfig {
            initial_learning_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::Configuration(_))));
    }

    #[test]
    fn rejects_bad_decay() {
        let config = TrainerConfig {
            lr_decay: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::Configuration(_))));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        fs::write(&path, "max_epoch: 3\npasses: 2\n").unwrap();
        let config = TrainerConfig::load(&path).unwrap();
        assert_eq!(config.max_epoch, 3);
        assert_eq!(config.passes, 2);
        assert!(TrainerConfig::load(dir.path().join("missing.yaml")).is_err());
    }
}
