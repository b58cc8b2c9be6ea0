//! Binary framed transport between the root and its workers.
//!
//! Every frame is `{ u32 length, u32 tag, payload[length] }`, all integers
//! little-endian. One TCP connection per worker, opened at root startup and
//! held for the process lifetime; the root issues plan steps in plan order
//! and every worker replies in the same order before accepting the next.

pub mod constants;
pub mod error;
pub mod frame;
pub mod link;
pub mod payload;

pub use constants::{ErrorCode, FrameTag, MAX_PAYLOAD};
pub use error::{ProtocolError, Result};
pub use frame::Frame;
pub use link::{LinkPool, WorkerLink};
