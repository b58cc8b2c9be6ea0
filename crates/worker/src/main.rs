//! meshlm worker binary.
//!
//! Accepts one root connection at a time, receives its weight slice during
//! the handshake, then serves plan steps until the root goes away.

use std::net::TcpListener;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshlm_inference::WorkerExecutor;
use meshlm_protocol::WorkerLink;

#[derive(Parser, Debug)]
#[command(name = "meshlm-worker", about = "Distributed transformer inference worker")]
struct WorkerConfig {
    /// Port the root connects to.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Threads in the kernel pool.
    #[arg(long, default_value_t = 4)]
    nthreads: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshlm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::parse();
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    tracing::info!(port = config.port, nthreads = config.nthreads, "worker listening");

    loop {
        let (stream, addr) = listener.accept()?;
        tracing::info!(%addr, "root connected");

        let link = match WorkerLink::from_stream(stream) {
            Ok(link) => link,
            Err(err) => {
                tracing::error!(%err, "link setup failed");
                continue;
            }
        };
        match WorkerExecutor::handshake(link, config.nthreads) {
            Ok(mut executor) => {
                if let Err(err) = executor.serve() {
                    tracing::error!(%err, "serve loop failed");
                }
            }
            Err(err) => tracing::error!(%err, "handshake failed"),
        }
        tracing::info!("root link closed, waiting for a new root");
    }
}
