//! Core numeric layer for meshlm: block-quantization codecs, the CPU tensor
//! kernels used by the sliced transformer plan, and the static-split thread
//! pool that both are fanned across.

pub mod kernels;
pub mod pool;
pub mod quant;
pub mod tensor;

pub use pool::{split_range, ShardedMut, ThreadPool};
pub use tensor::{BlockQ40, BlockQ80, FloatType, BLOCK_SIZE};
