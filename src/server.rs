use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::Stream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    model::{
        BatchedGenerationRequest, BatchedGenerationResponse, BatchedTokenizeRequest,
        BatchedTokenizeResponse, ModelInfoRequest, ModelInfoResponse, ModelRegistry,
        SingleGenerationRequest, StopReason,
    },
    orchestrator::Orchestrator,
};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(registry: Arc<ModelRegistry>) -> Router {
    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(registry)),
    };

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/generate_stream", post(generate_stream))
        .route("/tokenize", post(tokenize))
        .route("/model_info", post(model_info))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "ok"
}

/// Caller-supplied request id, or a fresh one.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchedGenerationRequest>,
) -> Result<Json<BatchedGenerationResponse>, ServiceError> {
    let correlation_id = correlation_id(&headers);
    let started = Instant::now();
    let batch_size = request.requests.len();

    let response = state
        .orchestrator
        .generate(request)
        .await
        .inspect_err(|err| warn!(%correlation_id, error = %err, "Generate rejected"))?;

    let input_tokens: u32 = response.responses.iter().map(|r| r.input_token_count).sum();
    let generated_tokens: u32 = response.responses.iter().map(|r| r.generated_token_count).sum();
    info!(
        %correlation_id,
        batch_size,
        input_tokens,
        generated_tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Generate completed"
    );
    Ok(Json(response))
}

async fn generate_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SingleGenerationRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServiceError> {
    let correlation_id = correlation_id(&headers);
    let started = Instant::now();
    let mut messages = state
        .orchestrator
        .generate_stream(request)
        .inspect_err(|err| warn!(%correlation_id, error = %err, "GenerateStream rejected"))?;

    let events = async_stream::stream! {
        let mut input_tokens = 0;
        let mut generated_tokens = 0;
        let mut stop_reason = StopReason::NotFinished;
        while let Some(message) = messages.next_message().await {
            input_tokens = input_tokens.max(message.input_token_count);
            generated_tokens = message.generated_token_count;
            stop_reason = message.stop_reason;
            yield Event::default().json_data(&message);
        }
        info!(
            %correlation_id,
            input_tokens,
            generated_tokens,
            %stop_reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "GenerateStream completed"
        );
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn tokenize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchedTokenizeRequest>,
) -> Result<Json<BatchedTokenizeResponse>, ServiceError> {
    let correlation_id = correlation_id(&headers);
    let response = state
        .orchestrator
        .tokenize(&request)
        .inspect_err(|err| warn!(%correlation_id, error = %err, "Tokenize rejected"))?;
    info!(
        %correlation_id,
        batch_size = response.responses.len(),
        "Tokenize completed"
    );
    Ok(Json(response))
}

async fn model_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModelInfoRequest>,
) -> Result<Json<ModelInfoResponse>, ServiceError> {
    let correlation_id = correlation_id(&headers);
    let info = state
        .orchestrator
        .model_info(&request.model_id)
        .inspect_err(|err| warn!(%correlation_id, error = %err, "ModelInfo rejected"))?;
    info!(%correlation_id, model_id = %request.model_id, "ModelInfo completed");
    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_prefers_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, "req-42".parse().unwrap());
        assert_eq!(correlation_id(&headers), "req-42");

        let generated = correlation_id(&HeaderMap::new());
        assert_eq!(generated.len(), 32);
        assert!(generated.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
