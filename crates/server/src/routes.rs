//! HTTP routes: the chat completion endpoint and the 404 fallback.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::Stream;
use tokio::sync::mpsc::Receiver;

use meshlm_model::render_chat;

use crate::engine::{EngineEvent, EngineHandle, Job};
use crate::openai::{
    completion_id, unix_time, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
};
use crate::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return ServerError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    if request.messages.is_empty() {
        return ServerError::InvalidRequest("messages must not be empty".into()).into_response();
    }

    let prompt = render_chat(&request.messages);
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);
    let job = Job {
        prompt,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        stop: request.stop,
        seed: request.seed,
        events: events_tx,
    };
    if let Err(err) = state.engine.submit(job) {
        return err.into_response();
    }

    if request.stream {
        Sse::new(event_stream(events_rx)).into_response()
    } else {
        collect_completion(events_rx).await.into_response()
    }
}

/// Gather every piece into one `chat.completion` body.
async fn collect_completion(
    mut events: Receiver<EngineEvent>,
) -> Result<Json<ChatCompletion>, ServerError> {
    let mut content = String::new();
    loop {
        match events.recv().await {
            Some(EngineEvent::Piece(piece)) => content.push_str(&piece),
            Some(EngineEvent::Done { prompt_tokens, completion_tokens }) => {
                return Ok(Json(ChatCompletion::new(content, prompt_tokens, completion_tokens)));
            }
            Some(EngineEvent::Failed(err)) => return Err(ServerError::Inference(err)),
            None => return Err(ServerError::EngineGone),
        }
    }
}

enum StreamPhase {
    Open(Receiver<EngineEvent>),
    Finishing,
    Closed,
}

/// Event-stream rendering: one `chat.completion.chunk` per piece, a closing
/// chunk with `finish_reason`, then the `[DONE]` sentinel.
fn event_stream(
    events: Receiver<EngineEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    use futures::StreamExt;
    data_stream(events).map(|data| Ok(Event::default().data(data)))
}

/// The `data:` lines of the stream, one string per event.
fn data_stream(events: Receiver<EngineEvent>) -> impl Stream<Item = String> {
    let id = completion_id();
    let created = unix_time();

    futures::stream::unfold(StreamPhase::Open(events), move |phase| {
        let id = id.clone();
        async move {
            match phase {
                StreamPhase::Open(mut events) => match events.recv().await {
                    Some(EngineEvent::Piece(piece)) => {
                        let chunk = ChatCompletionChunk::piece(&id, created, &piece);
                        Some((chunk_json(&chunk), StreamPhase::Open(events)))
                    }
                    Some(EngineEvent::Done { .. }) => {
                        let chunk = ChatCompletionChunk::finish(&id, created);
                        Some((chunk_json(&chunk), StreamPhase::Finishing))
                    }
                    Some(EngineEvent::Failed(_)) | None => {
                        // The request died; close the stream cleanly.
                        Some(("[DONE]".to_string(), StreamPhase::Closed))
                    }
                },
                StreamPhase::Finishing => Some(("[DONE]".to_string(), StreamPhase::Closed)),
                StreamPhase::Closed => None,
            }
        }
    })
}

fn chunk_json(chunk: &ChatCompletionChunk) -> String {
    // Serialization of these plain structs cannot fail.
    serde_json::to_string(chunk).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn drain(events: Vec<EngineEvent>) -> Vec<String> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        data_stream(rx).collect().await
    }

    #[tokio::test]
    async fn stream_ends_with_finish_chunk_and_done() {
        let rendered = drain(vec![
            EngineEvent::Piece("Hel".into()),
            EngineEvent::Piece("lo".into()),
            EngineEvent::Done { prompt_tokens: 4, completion_tokens: 2 },
        ])
        .await;

        assert_eq!(rendered.len(), 4);
        assert!(rendered[0].contains("chat.completion.chunk"));
        assert!(rendered[0].contains("Hel"));
        assert!(rendered[1].contains("lo"));
        assert!(rendered[2].contains(r#""finish_reason":"stop""#));
        assert_eq!(rendered[3], "[DONE]");
    }

    #[tokio::test]
    async fn failed_request_still_terminates_the_stream() {
        let rendered = drain(vec![
            EngineEvent::Piece("x".into()),
            EngineEvent::Failed("worker died".into()),
        ])
        .await;

        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[1], "[DONE]");
    }
}
