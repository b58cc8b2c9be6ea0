//! The engine thread.
//!
//! One std thread owns the driver, tokenizer and sampler; jobs arrive on a
//! channel and are served strictly one at a time. Pieces flow back through a
//! bounded tokio channel, whose closed receiver is the cancellation signal:
//! when the client disconnects, the next send fails, the loop aborts, and
//! the workers get a `Reset`.

use std::sync::mpsc;

use meshlm_inference::{generate, Driver, FinishReason, GenerateParams, Sampler};
use meshlm_model::Tokenizer;

use crate::openai::unix_time;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Piece(String),
    Done { prompt_tokens: usize, completion_tokens: usize },
    Failed(String),
}

pub struct Job {
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
    pub events: tokio::sync::mpsc::Sender<EngineEvent>,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
}

impl EngineHandle {
    pub fn submit(&self, job: Job) -> Result<(), crate::ServerError> {
        self.tx.send(job).map_err(|_| crate::ServerError::EngineGone)
    }
}

/// Start the engine thread and hand back its job channel.
pub fn spawn_engine(mut driver: Driver, tokenizer: Tokenizer, mut sampler: Sampler) -> EngineHandle {
    let (tx, rx) = mpsc::channel::<Job>();
    let max_seq_len = driver.spec().max_seq_len;

    std::thread::Builder::new()
        .name("meshlm-engine".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                serve_job(&mut driver, &tokenizer, &mut sampler, max_seq_len, job);
            }
            tracing::info!("engine channel closed, shutting down");
        })
        .expect("spawn engine thread");

    EngineHandle { tx }
}

fn serve_job(
    driver: &mut Driver,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    max_seq_len: usize,
    job: Job,
) {
    sampler.set_temperature(job.temperature);
    sampler.set_top_p(job.top_p);
    sampler.set_seed(job.seed.unwrap_or_else(unix_time));

    // Fresh conversation: clear the KV cache on every slice.
    if let Err(err) = driver.reset() {
        tracing::error!(%err, "worker reset failed");
        let _ = job.events.blocking_send(EngineEvent::Failed(err.to_string()));
        return;
    }

    let prompt_tokens = tokenizer.encode(&job.prompt, true, false);
    let params = GenerateParams {
        max_tokens: job.max_tokens,
        max_seq_len,
        stop: job.stop,
    };

    let started = std::time::Instant::now();
    let result = generate(driver, tokenizer, sampler, &prompt_tokens, &params, |piece| {
        job.events.blocking_send(EngineEvent::Piece(piece.to_string())).is_ok()
    });

    match result {
        Ok(outcome) if outcome.finish == FinishReason::Cancelled => {
            tracing::info!("client disconnected mid-stream, resetting workers");
            if let Err(err) = driver.reset() {
                tracing::warn!(%err, "post-cancel reset failed");
            }
        }
        Ok(outcome) => {
            tracing::info!(
                prompt_tokens = outcome.prompt_tokens,
                completion_tokens = outcome.completion_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request served"
            );
            let _ = job.events.blocking_send(EngineEvent::Done {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
            });
        }
        Err(err) => {
            tracing::error!(%err, "inference failed, aborting request");
            driver.abort();
            let _ = job.events.blocking_send(EngineEvent::Failed(err.to_string()));
        }
    }
}
