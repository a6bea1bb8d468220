pub mod batches;
pub mod config;
pub mod epoch;
pub mod error;
pub mod lr;
pub mod train;

pub use batches::{BatchGenerator, BatchSource, DataLayout};
pub use config::TrainerConfig;
pub use epoch::{run_epoch, run_epoch_to, EpochOptions, EpochResult, EpochStats};
pub use error::{DataError, Result, TrainError};
pub use lr::{adjust_learning_rate, LrPolicy};
pub use train::{EpochReport, Trainer, TrainingSession};
