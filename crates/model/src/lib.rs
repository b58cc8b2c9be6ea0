//! Model layer: immutable transformer specs, the sliced weight containers
//! shared by root and workers, the memory-mapped weight-file reader, the
//! byte-pair tokenizer and the chat template.

mod chat;
mod error;
mod loader;
mod spec;
mod tokenizer;
mod weights;

pub use chat::{render_chat, ChatMessage};
pub use error::{ModelError, Result};
pub use loader::WeightsFile;
pub use spec::{Architecture, TransformerSpec, SPEC_WIRE_LEN};
pub use tokenizer::{is_safe_piece, Tokenizer};
pub use weights::{
    shard_bytes, ExpertSlice, FfnSlice, LayerSlice, Sharding, SliceWeights, TensorId, TensorKind,
};
