//! The distributed inference engine: the tagged-op execution plan, the root
//! driver that walks it, the token sampler and the generation loop, plus the
//! worker-side executor that serves sliced ops over a root link.

mod driver;
mod error;
mod generate;
mod plan;
mod sampler;
mod slice_ops;
mod state;
mod worker;

pub use driver::{push_slices, Driver};
pub use error::{InferenceError, Result};
pub use generate::{generate, FinishReason, GenerateOutcome, GenerateParams, Infer};
pub use plan::{build_plan, Op, OpKind, ShardRole};
pub use sampler::Sampler;
pub use state::InferenceState;
pub use worker::WorkerExecutor;
