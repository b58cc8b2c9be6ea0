//! meshlm root binary.
//!
//! Startup: connect the workers, map the weight file, push every worker its
//! slice, build the driver, then serve the chat endpoint.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshlm_inference::{push_slices, Driver, InferenceError, Sampler};
use meshlm_model::{shard_bytes, SliceWeights, Tokenizer, WeightsFile};
use meshlm_protocol::LinkPool;
use meshlm_server::openai::{unix_time, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};
use meshlm_server::{routes, spawn_engine, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshlm=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::parse();
    tracing::info!("starting meshlm-server v{}", env!("CARGO_PKG_VERSION"));

    let mut links = LinkPool::connect(&config.workers).context("connecting workers")?;
    let n_slices = config.workers.len() + 1;

    let file = WeightsFile::open(&config.model, n_slices, config.buffer_float_type)
        .context("opening the model file")?;
    if file.spec().weight_type != config.weights_float_type {
        anyhow::bail!(
            "weight file is {} but --weights-float-type says {}",
            file.spec().weight_type,
            config.weights_float_type
        );
    }
    let spec = file.spec().clone();

    let tokenizer = Tokenizer::from_file(&config.tokenizer).context("loading the tokenizer")?;
    if tokenizer.vocab_size() != spec.vocab_size {
        anyhow::bail!(
            "tokenizer has {} tokens, model expects {}",
            tokenizer.vocab_size(),
            spec.vocab_size
        );
    }

    push_slices(&mut links, &spec, |id| Ok(file.tensor_bytes(id)?.to_vec()))
        .context("pushing weight slices")?;
    let weights = SliceWeights::from_source::<InferenceError, _>(&spec, 0, |id, layout| {
        Ok(shard_bytes(file.tensor_bytes(id)?, layout, spec.n_slices, 0))
    })
    .context("loading the root slice")?;

    let driver = Driver::new(spec.clone(), weights, links, config.nthreads)?;
    let sampler = Sampler::new(spec.vocab_size, DEFAULT_TEMPERATURE, DEFAULT_TOP_P, unix_time());
    let engine = spawn_engine(driver, tokenizer, sampler);

    let app = routes::router(AppState { engine }).layer(TraceLayer::new_for_http());
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
