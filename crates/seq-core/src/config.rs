use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Lstm,
    Gru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Width of the input vector at each time step.
    pub num_inputs: i64,
    /// Number of target classes.
    pub num_outputs: i64,
    /// Size of the recurrent hidden state.
    pub num_hidden: i64,
    /// Number of stacked recurrent layers.
    pub num_layers: i64,
    /// Number of parallel sequences (lanes) per batch.
    pub batch_size: usize,
    /// Number of time steps processed per model step.
    pub num_unrollings: usize,
    pub cell: CellKind,
    /// Probability of keeping an activation when dropout is applied during training.
    pub keep_prob: f64,
    /// Global gradient-norm clip applied before each parameter update.
    pub max_grad_norm: f64,
    pub optimizer: OptimizerKind,
    pub initial_learning_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_inputs: 8,
            num_outputs: 2,
            num_hidden: 128,
            num_layers: 1,
            batch_size: 64,
            num_unrollings: 20,
            cell: CellKind::Lstm,
            keep_prob: 1.0,
            max_grad_norm: 5.0,
            optimizer: OptimizerKind::Sgd,
            initial_learning_rate: 1.0,
        }
    }
}

impl ModelConfig {
    pub fn dropout(&self) -> f64 {
        1.0 - self.keep_prob
    }
}
