use std::path::PathBuf;

use seq_core::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Epoch produced no countable steps out of {total_steps}; cannot average cost and error")]
    Division { total_steps: usize },

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} contains no data rows")]
    Empty { path: PathBuf },

    #[error("{path:?} has no column named {column:?}")]
    MissingColumn { path: PathBuf, column: String },

    #[error("{path:?} has {found} input columns, {expected} required")]
    TooFewInputs {
        path: PathBuf,
        found: usize,
        expected: usize,
    },

    #[error("{path:?} line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid batch layout: {0}")]
    Layout(String),
}

pub type Result<T> = std::result::Result<T, TrainError>;
