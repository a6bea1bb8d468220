pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod model;
pub mod recurrent;
pub mod rnn;

pub use batch::Batch;
pub use checkpoint::SessionState;
pub use config::{CellKind, ModelConfig, OptimizerKind};
pub use error::{ModelError, Result};
pub use model::{EvalOp, SequenceModel, StepOutput, TrainableModel};
pub use recurrent::{build_model_pair, RecurrentModel};
pub use rnn::{RecurrentNet, RecurrentState};
