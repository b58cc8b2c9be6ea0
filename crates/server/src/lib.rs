//! meshlm root server.
//!
//! Serves `POST /v1/chat/completions` over the distributed inference engine.
//! One engine thread owns the driver, tokenizer and sampler; HTTP handlers
//! hand it jobs through a channel, so requests are served strictly one at a
//! time and stream back through a bounded piece channel.

pub mod config;
pub mod engine;
pub mod error;
pub mod openai;
pub mod routes;

pub use config::ServerConfig;
pub use engine::{spawn_engine, EngineEvent, EngineHandle, Job};
pub use error::{Result, ServerError};
pub use routes::AppState;
