//! HTTP endpoint adapters and the axum application.

mod ail_endpoint;
mod models;
mod pipeline;
mod respond;
mod wire;

pub use ail_endpoint::{AilEndpoint, AilParser};
pub use pipeline::{request_preamble, run_inference_pipeline, ServeFormat};
pub use wire::{ModelOverride, WireEndpoint, WireParser};

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;

use ail::Style;

use crate::gateway::Gateway;

/// Shared state for the axum handlers: the gateway plus the prebuilt
/// endpoint adapters.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    chat: Arc<WireEndpoint>,
    anthropic: Arc<WireEndpoint>,
    google: Arc<WireEndpoint>,
    ail: Arc<AilEndpoint>,
    router_name: String,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, router_name: impl Into<String>) -> Self {
        let router_name = router_name.into();
        AppState {
            chat: WireEndpoint::new(gateway.clone(), Style::ChatCompletions, router_name.clone()),
            anthropic: WireEndpoint::new(gateway.clone(), Style::Anthropic, router_name.clone()),
            google: WireEndpoint::new(gateway.clone(), Style::GoogleGenAi, router_name.clone()),
            ail: AilEndpoint::new(gateway.clone(), router_name.clone()),
            gateway,
            router_name,
        }
    }
}

/// Builds the HTTP application.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{model_action}", post(google_generate))
        .route("/v1/ail", post(raw_ail))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.chat.clone().serve_http(headers, body, None).await
}

async fn anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.anthropic.clone().serve_http(headers, body, None).await
}

/// Google GenAI routes carry the model and action in the path:
/// `/v1beta/models/{model}:generateContent` or `:streamGenerateContent`.
async fn google_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return respond::plain_error(
            StatusCode::BAD_REQUEST,
            "expected models/{model}:generateContent",
        );
    };
    let streaming = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return respond::plain_error(
                StatusCode::BAD_REQUEST,
                &format!("unsupported action {action:?}"),
            )
        }
    };
    let over = ModelOverride {
        model: model.to_string(),
        streaming,
    };
    state.google.clone().serve_http(headers, body, Some(over)).await
}

async fn raw_ail(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.ail.clone().serve_http(headers, body).await
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    models::list_models(&state.gateway, &state.router_name, &headers).await
}
