//! Inference error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Model(#[from] meshlm_model::ModelError),

    #[error(transparent)]
    Protocol(#[from] meshlm_protocol::ProtocolError),

    #[error("position {got} does not match the KV cache length {expected}")]
    PositionMismatch { expected: usize, got: usize },

    #[error("plan result for op {got} while op {expected} is in flight")]
    OpMismatch { expected: u32, got: u32 },

    #[error("op id {0} does not name a sliced op")]
    UnknownOp(u32),

    #[error("prompt is empty")]
    EmptyPrompt,
}

pub type Result<T> = std::result::Result<T, InferenceError>;
