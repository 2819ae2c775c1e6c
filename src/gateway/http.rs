//! axum surface for the gateway.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

use super::GatewayError;
use super::message::Message;
use super::model_list::fetch_provider_models;
use super::orchestrator::{ChatOrchestrator, ChatReply, ChatRequest};
use super::provider::model_options;
use super::settings::CostSettings;
use super::tasks::{MediaTask, run_media_task};

const CACHE_HIT_HEADER: &str = "x-cache-hit";

#[derive(Clone)]
pub struct GatewayHttpState {
    orchestrator: Arc<ChatOrchestrator>,
    http_client: reqwest::Client,
}

impl GatewayHttpState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self {
            orchestrator,
            http_client: reqwest::Client::new(),
        }
    }

    /// Client used for provider model-list fetches.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }
}

fn default_task() -> String {
    "chat".to_string()
}

fn default_mode() -> String {
    "text2img".to_string()
}

#[derive(Debug, Deserialize)]
struct AiRequest {
    #[serde(default = "default_task")]
    task: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    prompt: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    client: String,
    #[serde(default, alias = "bypassCostOptimizer")]
    bypass_cost_optimizer: bool,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ai", post(handle_ai))
        .route(
            "/v1/cost-settings",
            get(get_cost_settings).put(put_cost_settings),
        )
        .route("/v1/models", get(list_models))
        .route("/v1/providers", get(list_providers))
        .route(
            "/v1/providers/:id/upstream-models",
            get(fetch_upstream_models),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({"error": message.to_string()}))).into_response()
}

fn map_gateway_error(err: GatewayError) -> Response {
    let status = match &err {
        GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        GatewayError::ProviderNotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::ProviderFile(_) | GatewayError::Settings(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    error_response(status, err)
}

async fn handle_ai(State(state): State<GatewayHttpState>, body: Bytes) -> Response {
    let request: AiRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
    };
    if request.model.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing model");
    }

    let task = match request.task.as_str() {
        "chat" => None,
        "image" => Some(MediaTask::image(
            &request.mode,
            request.prompt.clone(),
            request.image.clone(),
        )),
        "video" => Some(MediaTask::Video {
            prompt: request.prompt.clone(),
        }),
        _ => return error_response(StatusCode::BAD_REQUEST, "invalid task"),
    };

    if let Some(task) = task {
        let orchestrator = &state.orchestrator;
        return match run_media_task(
            orchestrator.providers().as_ref(),
            orchestrator.upstream().as_ref(),
            &request.model,
            &task,
        )
        .await
        {
            Ok(reply) => json_bytes_response(reply.status, reply.body, false),
            Err(err) => map_gateway_error(err),
        };
    }

    let chat = ChatRequest {
        model: request.model,
        messages: request.messages,
        stream: request.stream,
        client: request.client,
        bypass_cost_optimizer: request.bypass_cost_optimizer,
    };
    match state.orchestrator.handle_chat(chat).await {
        Ok(reply) => chat_reply_response(reply),
        Err(err) => map_gateway_error(err),
    }
}

fn chat_reply_response(reply: ChatReply) -> Response {
    match reply {
        ChatReply::Json {
            status,
            body,
            cache_hit,
        } => json_bytes_response(status, body, cache_hit),
        ChatReply::Stream { cache_hit, body } => {
            let mut response = Response::new(Body::from_stream(body));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
            if cache_hit {
                headers.insert(CACHE_HIT_HEADER, HeaderValue::from_static("true"));
            }
            response
        }
    }
}

fn json_bytes_response(status: u16, body: Bytes, cache_hit: bool) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if cache_hit {
        headers.insert(CACHE_HIT_HEADER, HeaderValue::from_static("true"));
    }
    response
}

async fn get_cost_settings(State(state): State<GatewayHttpState>) -> Response {
    let settings = state.orchestrator.settings().load().await;
    Json(json!({"success": true, "settings": settings})).into_response()
}

async fn put_cost_settings(State(state): State<GatewayHttpState>, body: Bytes) -> Response {
    let parsed = serde_json::from_slice::<Value>(&body)
        .map_err(|err| err.to_string())
        .and_then(|mut value| match value.get_mut("settings").map(Value::take) {
            Some(settings) if settings.is_object() => {
                serde_json::from_value::<CostSettings>(settings).map_err(|err| err.to_string())
            }
            _ => Err("missing settings object".to_string()),
        });
    let settings = match parsed {
        Ok(settings) => settings,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": format!("invalid settings: {err}")})),
            )
                .into_response();
        }
    };

    match state.orchestrator.settings().save(&settings).await {
        Ok(()) => {
            tracing::info!("cost settings updated");
            Json(json!({"success": true})).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "saving cost settings failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn list_models(State(state): State<GatewayHttpState>) -> Response {
    match state.orchestrator.providers().list_providers().await {
        Ok(providers) => Json(json!({"models": model_options(&providers)})).into_response(),
        Err(err) => map_gateway_error(err.into()),
    }
}

/// Provider records with credentials removed.
async fn list_providers(State(state): State<GatewayHttpState>) -> Response {
    let providers = match state.orchestrator.providers().list_providers().await {
        Ok(providers) => providers,
        Err(err) => return map_gateway_error(err.into()),
    };
    let redacted: Vec<Value> = providers
        .iter()
        .filter_map(|provider| serde_json::to_value(provider).ok())
        .map(|mut value| {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("api_key");
            }
            value
        })
        .collect();
    Json(Value::Array(redacted)).into_response()
}

async fn fetch_upstream_models(
    State(state): State<GatewayHttpState>,
    Path(id): Path<String>,
) -> Response {
    let provider = match state.orchestrator.providers().find_provider(&id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": format!("provider not found: {id}")})),
            )
                .into_response();
        }
        Err(err) => return map_gateway_error(err.into()),
    };

    match fetch_provider_models(&state.http_client, &provider).await {
        Ok(models) => Json(json!({"success": true, "models": models})).into_response(),
        Err(err) => {
            tracing::warn!(provider = %provider.id, error = %err, "model list fetch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"success": false, "error": err.to_string()})),
            )
                .into_response()
        }
    }
}
