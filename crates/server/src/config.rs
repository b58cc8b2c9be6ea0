//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;
use meshlm_core::FloatType;

fn parse_float_type(value: &str) -> std::result::Result<FloatType, String> {
    match value {
        "f32" => Ok(FloatType::F32),
        "f16" => Ok(FloatType::F16),
        "q40" => Ok(FloatType::Q40),
        "q80" => Ok(FloatType::Q80),
        other => Err(format!("unknown float type '{other}' (expected f32|f16|q40|q80)")),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "meshlm-server", about = "Distributed transformer inference root")]
pub struct ServerConfig {
    /// Path to the model weights file.
    #[arg(long)]
    pub model: PathBuf,

    /// Path to the tokenizer vocabulary file.
    #[arg(long)]
    pub tokenizer: PathBuf,

    /// Element type the weight file must be stored in.
    #[arg(long, value_parser = parse_float_type, default_value = "f32")]
    pub weights_float_type: FloatType,

    /// Element type of the activation broadcasts (f32 or q80).
    #[arg(long, value_parser = parse_float_type, default_value = "f32")]
    pub buffer_float_type: FloatType,

    /// Worker addresses as host:port, in slice order.
    #[arg(long, num_args = 1..)]
    pub workers: Vec<String>,

    /// HTTP port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Threads in the kernel pool.
    #[arg(long, default_value_t = 4)]
    pub nthreads: usize,
}
