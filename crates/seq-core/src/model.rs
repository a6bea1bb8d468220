use std::path::{Path, PathBuf};

use crate::batch::Batch;
use crate::checkpoint::SessionState;
use crate::error::Result;

/// Selects what a model step does with the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOp {
    /// Forward pass, loss, and a parameter update.
    Train,
    /// Forward pass and loss only.
    Evaluate,
}

/// Result of a single model step.
#[derive(Debug)]
pub struct StepOutput<S> {
    /// Mean cross-entropy over the valid (non-padded) elements of the batch.
    pub cost: f64,
    /// Fraction of valid elements whose predicted class is wrong.
    pub error: f64,
    /// Recurrent state to feed into the next step.
    pub state: S,
    /// Class probabilities, `[batch, unrollings, num_outputs]` flattened.
    pub predictions: Vec<f32>,
}

/// A stateful sequence model driven one batch at a time.
///
/// The recurrent state is returned from every step and handed back on the
/// next one; `None` means "start from zero".
pub trait SequenceModel {
    type State;

    fn batch_size(&self) -> usize;

    fn num_unrollings(&self) -> usize;

    fn step(
        &mut self,
        op: EvalOp,
        batch: &Batch,
        state: Option<Self::State>,
    ) -> Result<StepOutput<Self::State>>;
}

/// A model that owns optimizer state and can be checkpointed.
pub trait TrainableModel: SequenceModel {
    fn set_learning_rate(&mut self, learning_rate: f64);

    /// Writes the current parameters and `session` under `dir`, tagged with
    /// `epoch`. Returns the path of the written checkpoint.
    fn save_checkpoint(&self, dir: &Path, epoch: usize, session: &SessionState) -> Result<PathBuf>;
}
