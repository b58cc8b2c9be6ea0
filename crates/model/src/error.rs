//! Model loading error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a meshlm weights file (bad magic)")]
    InvalidMagic,

    #[error("unsupported file version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error("model/slice configuration invalid: {0}")]
    Validation(String),

    #[error("missing tensor {0}")]
    MissingTensor(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
