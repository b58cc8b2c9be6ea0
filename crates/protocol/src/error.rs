//! Transport error types.

use thiserror::Error;

use crate::constants::{ErrorCode, FrameTag};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown frame tag 0x{0:08X}")]
    UnknownTag(u32),

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("expected a {expected:?} frame, got {got:?}")]
    UnexpectedFrame { expected: FrameTag, got: FrameTag },

    #[error("payload length mismatch: expected {expected} bytes, got {got}")]
    PayloadLength { expected: usize, got: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("peer reported {0:?}")]
    Remote(ErrorCode),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
