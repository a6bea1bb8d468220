use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Evaluation-only model cannot apply parameter updates")]
    ReadOnly,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
