//! Chat request handling: cache, routing, the cost pipeline and the upstream relay.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::{Value, json};
use tracing::Instrument as _;

use super::GatewayError;
use super::kv_cache::{KvCache, cache_hit_json, cache_hit_sse_events};
use super::message::Message;
use super::pipeline::{PipelineOutput, light_model, run_cost_pipeline, should_route_to_light_model};
use super::provider::{ModelTarget, Provider, ProviderDirectory};
use super::settings::{CostSettings, KvCacheSettings, SettingsStore};
use super::upstream::{Upstream, UpstreamBody, UpstreamRequest, UpstreamResponse};

pub const ERROR_MARKER: &str = "[error] ";
pub const CONNECTION_ERROR_MARKER: &str = "\n[connection error] ";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SSE_CAPTURE_MAX_LINE_BYTES: usize = 512 * 1024;

pub type ReplyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Clone, Debug)]
pub struct ChatRequest {
    /// `provider_id::model_id` as sent by the client.
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub client: String,
    pub bypass_cost_optimizer: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            client: String::new(),
            bypass_cost_optimizer: false,
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

pub enum ChatReply {
    Json {
        status: u16,
        body: Bytes,
        cache_hit: bool,
    },
    Stream {
        cache_hit: bool,
        body: ReplyStream,
    },
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatReply::Json {
                status, cache_hit, ..
            } => f
                .debug_struct("Json")
                .field("status", status)
                .field("cache_hit", cache_hit)
                .finish_non_exhaustive(),
            ChatReply::Stream { cache_hit, .. } => f
                .debug_struct("Stream")
                .field("cache_hit", cache_hit)
                .finish_non_exhaustive(),
        }
    }
}

impl ChatReply {
    pub fn is_cache_hit(&self) -> bool {
        match self {
            ChatReply::Json { cache_hit, .. } | ChatReply::Stream { cache_hit, .. } => *cache_hit,
        }
    }

    fn json(status: u16, body: &Value) -> Self {
        ChatReply::Json {
            status,
            body: Bytes::from(body.to_string()),
            cache_hit: false,
        }
    }
}

/// Which clients may skip the cost optimizer with `bypass_cost_optimizer`.
#[derive(Clone, Debug)]
pub struct BypassPolicy {
    pub allowlist_enabled: bool,
    pub allowed_clients: Vec<String>,
    pub allow_empty_client: bool,
}

impl Default for BypassPolicy {
    fn default() -> Self {
        Self {
            allowlist_enabled: true,
            allowed_clients: vec!["cyoa".to_string()],
            allow_empty_client: false,
        }
    }
}

impl BypassPolicy {
    pub fn allows(&self, client: &str) -> bool {
        if !self.allowlist_enabled {
            return true;
        }
        let client = client.trim();
        if client.is_empty() {
            return self.allow_empty_client;
        }
        self.allowed_clients.iter().any(|allowed| allowed == client)
    }
}

/// Per-request state: the untouched snapshot that keys the cache, and the target the request is
/// currently headed for.
struct ChatContext {
    original: Vec<Message>,
    requested: ModelTarget,
    requested_provider: Provider,
    target: ModelTarget,
    provider: Provider,
    stream: bool,
}

impl ChatContext {
    fn routed(&self) -> bool {
        self.target != self.requested
    }

    fn revert_to_requested(&mut self) {
        self.target = self.requested.clone();
        self.provider = self.requested_provider.clone();
    }

    fn run_pipeline(&self, settings: &CostSettings) -> PipelineOutput {
        run_cost_pipeline(
            settings,
            &self.original,
            &self.provider,
            &self.target.model,
            self.stream,
        )
    }
}

pub struct ChatOrchestrator {
    settings: Arc<SettingsStore>,
    providers: Arc<dyn ProviderDirectory>,
    cache: KvCache,
    upstream: Arc<dyn Upstream>,
    bypass: BypassPolicy,
}

impl ChatOrchestrator {
    pub fn new(
        settings: Arc<SettingsStore>,
        providers: Arc<dyn ProviderDirectory>,
        cache: KvCache,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            settings,
            providers,
            cache,
            upstream,
            bypass: BypassPolicy::default(),
        }
    }

    pub fn with_bypass_policy(mut self, bypass: BypassPolicy) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn providers(&self) -> &Arc<dyn ProviderDirectory> {
        &self.providers
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub async fn handle_chat(&self, request: ChatRequest) -> Result<ChatReply, GatewayError> {
        let requested =
            ModelTarget::parse(&request.model).ok_or_else(|| GatewayError::InvalidRequest {
                reason: "invalid model format, expected provider_id::model_id".to_string(),
            })?;
        let requested_provider = self
            .providers
            .find_provider(&requested.provider_id)
            .await?
            .ok_or_else(|| GatewayError::ProviderNotFound {
                id: requested.provider_id.clone(),
            })?;

        let span = tracing::info_span!(
            "chat",
            model = %requested,
            provider = %requested_provider.id,
            cache = tracing::field::Empty,
            routed = tracing::field::Empty,
        );

        let bypass = request.bypass_cost_optimizer && self.bypass_allowed(&request.client);
        let ctx = ChatContext {
            original: request.messages,
            target: requested.clone(),
            provider: requested_provider.clone(),
            requested,
            requested_provider,
            stream: request.stream,
        };

        if bypass {
            return self.dispatch_bypass(ctx).instrument(span).await;
        }
        self.dispatch_optimized(ctx).instrument(span).await
    }

    fn bypass_allowed(&self, client: &str) -> bool {
        let allowed = self.bypass.allows(client);
        if !allowed {
            tracing::warn!(client, "cost optimizer bypass refused for client");
        }
        allowed
    }

    async fn dispatch_bypass(&self, ctx: ChatContext) -> Result<ChatReply, GatewayError> {
        tracing::info!("cost optimizer bypassed");
        let output = PipelineOutput {
            messages: ctx.original.clone(),
            max_tokens: None,
            model: ctx.target.model.clone(),
            stream: ctx.stream,
        };
        Ok(self.dispatch(&ctx, &output, None).await)
    }

    async fn dispatch_optimized(&self, mut ctx: ChatContext) -> Result<ChatReply, GatewayError> {
        let settings = self.settings.load().await;
        let span = tracing::Span::current();

        if let Some(content) = self
            .cache
            .lookup_any(&settings.kv_cache, &ctx.original, &ctx.requested.model)
            .await
        {
            span.record("cache", "hit");
            tracing::info!(chars = content.chars().count(), "serving cached response");
            return Ok(cache_hit_reply(&content, &ctx.requested.model, ctx.stream));
        }
        span.record("cache", "miss");

        if should_route_to_light_model(&settings.model_routing, &ctx.original) {
            if let Some(light) = light_model(&settings.model_routing) {
                match self.providers.find_provider(&light.provider_id).await {
                    Ok(Some(provider)) => {
                        tracing::info!(from = %ctx.requested, to = %light, "routing to light model");
                        ctx.target = light;
                        ctx.provider = provider;
                    }
                    Ok(None) => {
                        tracing::warn!(light_model = %light, "light model provider not found");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "light model provider lookup failed");
                    }
                }
            }
        }
        span.record("routed", ctx.routed());

        let mut output = ctx.run_pipeline(&settings);
        if ctx.routed() && self.probe_rate_limited(&ctx, &output).await {
            tracing::info!(
                light_model = %ctx.target,
                model = %ctx.requested,
                "light model rate limited, falling back"
            );
            ctx.revert_to_requested();
            span.record("routed", false);
            output = ctx.run_pipeline(&settings);
        }

        let store = CacheStore {
            cache: self.cache.clone(),
            settings: settings.kv_cache.clone(),
            messages: ctx.original.clone(),
            model: ctx.requested.model.clone(),
        };
        Ok(self.dispatch(&ctx, &output, Some(store)).await)
    }

    /// One-token non-streaming call against the routed target; true only on HTTP 429.
    async fn probe_rate_limited(&self, ctx: &ChatContext, output: &PipelineOutput) -> bool {
        let mut body = output.payload();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(false));
            obj.insert("max_tokens".to_string(), Value::from(1));
        }
        let request =
            UpstreamRequest::for_provider(&ctx.provider, ctx.provider.chat_url(), body, false)
                .with_timeout(PROBE_TIMEOUT);
        match self.upstream.call(request).await {
            Ok(response) => response.status == 429,
            Err(err) => {
                tracing::debug!(error = %err, "probe failed, keeping light model");
                false
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &ChatContext,
        output: &PipelineOutput,
        store: Option<CacheStore>,
    ) -> ChatReply {
        let request = UpstreamRequest::for_provider(
            &ctx.provider,
            ctx.provider.chat_url(),
            output.payload(),
            ctx.stream,
        );
        tracing::debug!(url = %request.url, stream = ctx.stream, "dispatching chat request");
        let result = self.upstream.call(request).await;

        if ctx.stream {
            stream_reply(result, store).await
        } else {
            json_reply(result, store).await
        }
    }
}

fn cache_hit_reply(content: &str, model: &str, stream: bool) -> ChatReply {
    if stream {
        let events = cache_hit_sse_events(content);
        return ChatReply::Stream {
            cache_hit: true,
            body: stream::iter(events.into_iter().map(Ok)).boxed(),
        };
    }
    ChatReply::Json {
        status: 200,
        body: Bytes::from(cache_hit_json(content, model).to_string()),
        cache_hit: true,
    }
}

async fn json_reply(
    result: Result<UpstreamResponse, GatewayError>,
    store: Option<CacheStore>,
) -> ChatReply {
    let response = match result {
        Ok(response) => response,
        Err(err) => return transport_error_json(&err),
    };
    let status = response.status;
    let body = match response.into_bytes().await {
        Ok(body) => body,
        Err(err) => return transport_error_json(&err),
    };

    if status == 200 {
        if let Some(store) = store {
            let content = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .pointer("/choices/0/message/content")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            store.save(&content).await;
        }
    } else {
        tracing::warn!(status, "upstream returned an error status");
    }

    ChatReply::Json {
        status,
        body,
        cache_hit: false,
    }
}

fn transport_error_json(err: &GatewayError) -> ChatReply {
    tracing::warn!(error = %err, "upstream call failed");
    let message = err.to_string();
    ChatReply::json(
        502,
        &json!({
            "error": message,
            "choices": [{"message": {"role": "assistant", "content": format!("{ERROR_MARKER}{message}")}}],
        }),
    )
}

async fn stream_reply(
    result: Result<UpstreamResponse, GatewayError>,
    store: Option<CacheStore>,
) -> ChatReply {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "upstream call failed");
            return single_event_stream(&format!("{CONNECTION_ERROR_MARKER}{err}"));
        }
    };

    if !response.is_success() {
        let status = response.status;
        let body = response.into_bytes().await.unwrap_or_default();
        let message = upstream_error_message(status, &body);
        tracing::warn!(status, message = %message, "upstream returned an error status");
        return single_event_stream(&format!("{ERROR_MARKER}{message}"));
    }

    let upstream = match response.body {
        UpstreamBody::Stream(stream) => stream,
        UpstreamBody::Full(bytes) => stream::iter([Ok(bytes)]).boxed(),
    };
    let state = RelayState {
        upstream,
        capture: SseContentCapture::default(),
        store,
        finished: false,
    };

    let body = stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.capture.ingest(&chunk);
                Some((Ok::<_, std::io::Error>(chunk), state))
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "upstream stream interrupted");
                state.store = None;
                state.finished = true;
                let events = delta_events(&format!("{CONNECTION_ERROR_MARKER}{err}"));
                Some((Ok(events), state))
            }
            None => {
                state.capture.finish();
                if let Some(store) = state.store.take() {
                    store.save(state.capture.content()).await;
                }
                None
            }
        }
    });

    ChatReply::Stream {
        cache_hit: false,
        body: body.boxed(),
    }
}

fn single_event_stream(content: &str) -> ChatReply {
    ChatReply::Stream {
        cache_hit: false,
        body: stream::iter([Ok(delta_events(content))]).boxed(),
    }
}

/// One content delta followed by the end-of-stream marker.
fn delta_events(content: &str) -> Bytes {
    let event = json!({"choices": [{"delta": {"content": content}}]});
    Bytes::from(format!("data: {event}\n\ndata: [DONE]\n\n"))
}

fn upstream_error_message(status: u16, body: &[u8]) -> String {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    if let Some(message) = error
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }
    if let Some(message) = error.and_then(Value::as_str) {
        return message.to_string();
    }
    format!("upstream API error (HTTP {status})")
}

/// Writes a finished response into both cache indexes.
struct CacheStore {
    cache: KvCache,
    settings: KvCacheSettings,
    messages: Vec<Message>,
    model: String,
}

impl CacheStore {
    async fn save(self, content: &str) {
        if content.is_empty() {
            return;
        }
        self.cache
            .store_all(&self.settings, &self.messages, &self.model, content)
            .await;
    }
}

struct RelayState {
    upstream: BoxStream<'static, Result<Bytes, GatewayError>>,
    capture: SseContentCapture,
    store: Option<CacheStore>,
    finished: bool,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        if self.store.is_some() {
            tracing::debug!("client disconnected mid-stream, response not cached");
        }
    }
}

/// Accumulates `choices[0].delta.content` from `data:` lines, buffering partial lines across
/// chunk boundaries.
#[derive(Default)]
struct SseContentCapture {
    line: Vec<u8>,
    content: String,
}

impl SseContentCapture {
    fn ingest(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            self.line.extend_from_slice(&rest[..pos]);
            self.take_line();
            rest = &rest[pos + 1..];
        }
        self.line.extend_from_slice(rest);

        if self.line.len() > SSE_CAPTURE_MAX_LINE_BYTES {
            tracing::debug!(bytes = self.line.len(), "dropping oversized sse line");
            self.line.clear();
        }
    }

    fn finish(&mut self) {
        if !self.line.is_empty() {
            self.take_line();
        }
    }

    fn content(&self) -> &str {
        &self.content
    }

    fn take_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&line);
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" || data.is_empty() {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if let Some(delta) = event
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            self.content.push_str(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::kv_cache::{KvStore, MemoryKvStore, exact_key};
    use crate::gateway::provider::StaticProviders;
    use crate::utils::test_support::ManualClock;

    #[derive(Default)]
    struct ScriptedUpstream {
        responses: Mutex<VecDeque<Result<UpstreamResponse, GatewayError>>>,
        calls: Mutex<Vec<UpstreamRequest>>,
    }

    impl ScriptedUpstream {
        fn push(&self, response: Result<UpstreamResponse, GatewayError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> Vec<UpstreamRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
            self.calls.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(UpstreamResponse::full(500, "unscripted")))
        }
    }

    struct Harness {
        orchestrator: ChatOrchestrator,
        upstream: Arc<ScriptedUpstream>,
        kv: Arc<MemoryKvStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(settings: CostSettings) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SettingsStore::new(dir.path().join("cost_settings.json")));
        store.save(&settings).await.expect("save settings");

        let providers = StaticProviders::new(vec![
            Provider::new("main", "https://main.example/v1").with_api_key("sk-main"),
            Provider::new("cheap", "https://cheap.example/v1").with_api_key("sk-cheap"),
        ]);
        let kv = Arc::new(MemoryKvStore::new());
        let cache = KvCache::new(kv.clone(), Arc::new(ManualClock::new(1_000)));
        let upstream = Arc::new(ScriptedUpstream::default());
        let orchestrator =
            ChatOrchestrator::new(store, Arc::new(providers), cache, upstream.clone());
        Harness {
            orchestrator,
            upstream,
            kv,
            _dir: dir,
        }
    }

    fn cached_settings() -> CostSettings {
        let mut settings = CostSettings::default();
        settings.kv_cache.enabled = true;
        settings
    }

    fn routing_settings() -> CostSettings {
        let mut settings = cached_settings();
        settings.model_routing.enabled = true;
        settings.model_routing.light_model = "cheap::mini".to_string();
        settings
    }

    fn completion(content: &str) -> Result<UpstreamResponse, GatewayError> {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": content}}]});
        Ok(UpstreamResponse::full(200, body.to_string()))
    }

    fn sse(chunks: &[&'static str]) -> Result<UpstreamResponse, GatewayError> {
        let chunks: Vec<Result<Bytes, GatewayError>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Ok(UpstreamResponse {
            status: 200,
            body: UpstreamBody::Stream(stream::iter(chunks).boxed()),
        })
    }

    fn conversation() -> Vec<Message> {
        vec![Message::system("be helpful"), Message::user("what is rust?")]
    }

    async fn collect(reply: ChatReply) -> String {
        match reply {
            ChatReply::Stream { body, .. } => {
                let chunks: Vec<_> = body.collect().await;
                chunks
                    .into_iter()
                    .map(|chunk| String::from_utf8(chunk.expect("chunk").to_vec()).expect("utf8"))
                    .collect()
            }
            ChatReply::Json { body, .. } => String::from_utf8(body.to_vec()).expect("utf8"),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_model_and_unknown_provider() {
        let h = harness(CostSettings::default()).await;
        let err = h
            .orchestrator
            .handle_chat(ChatRequest::new("no-separator", conversation()))
            .await
            .expect_err("bad model");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));

        let err = h
            .orchestrator
            .handle_chat(ChatRequest::new("ghost::m", conversation()))
            .await
            .expect_err("unknown provider");
        assert!(matches!(err, GatewayError::ProviderNotFound { id } if id == "ghost"));
        assert!(h.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let h = harness(cached_settings()).await;
        h.upstream.push(completion("Rust is a language."));

        let first = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()))
            .await
            .expect("first");
        assert!(!first.is_cache_hit());
        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://main.example/v1/chat/completions");
        assert_eq!(calls[0].body["model"], "big");
        assert_eq!(calls[0].body["stream"], false);
        assert_eq!(calls[0].headers["Authorization"], "Bearer sk-main");

        let second = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()))
            .await
            .expect("second");
        assert!(second.is_cache_hit());
        assert_eq!(h.upstream.calls().len(), 1);
        let body: Value = serde_json::from_str(&collect(second).await).expect("json");
        assert_eq!(body["choices"][0]["message"]["content"], "Rust is a language.");
        assert_eq!(body["model"], "big");
    }

    #[tokio::test]
    async fn cache_hit_replays_as_sse_when_streaming() {
        let h = harness(cached_settings()).await;
        h.orchestrator
            .cache
            .store_all(&cached_settings().kv_cache, &conversation(), "big", "cached!")
            .await;

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()).streaming(true))
            .await
            .expect("reply");
        assert!(reply.is_cache_hit());
        let text = collect(reply).await;
        assert!(text.starts_with("data: {\"choices\":[{\"delta\":{\"content\":\"cach\"}}]}\n\n"));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert!(h.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_is_relayed_and_cached_after_completion() {
        let h = harness(cached_settings()).await;
        h.upstream.push(sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\nda",
            "ta: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()).streaming(true))
            .await
            .expect("reply");
        let text = collect(reply).await;
        assert!(text.contains("\"Hel\""));
        assert!(text.ends_with("data: [DONE]\n\n"));

        let entry = h
            .kv
            .get(&exact_key(&conversation(), "big"))
            .await
            .expect("get")
            .expect("cached");
        assert_eq!(entry.content, "Hello");
        assert_eq!(entry.time, 1_000);
    }

    #[tokio::test]
    async fn dropped_stream_caches_nothing() {
        let h = harness(cached_settings()).await;
        h.upstream.push(sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" answer\"}}]}\n\n",
        ]));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()).streaming(true))
            .await
            .expect("reply");
        let ChatReply::Stream { mut body, .. } = reply else {
            panic!("expected a stream");
        };
        let first = body.next().await.expect("first chunk").expect("ok");
        assert!(String::from_utf8_lossy(&first).contains("partial"));
        drop(body);

        assert!(h.kv.is_empty().await);
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_connection_error_and_skips_cache() {
        let h = harness(cached_settings()).await;
        let chunks: Vec<Result<Bytes, GatewayError>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n",
            )),
            Err(GatewayError::Upstream {
                message: "reset by peer".to_string(),
            }),
        ];
        h.upstream.push(Ok(UpstreamResponse {
            status: 200,
            body: UpstreamBody::Stream(stream::iter(chunks).boxed()),
        }));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()).streaming(true))
            .await
            .expect("reply");
        let text = collect(reply).await;
        assert!(text.contains("[connection error] upstream error: reset by peer"));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert!(h.kv.is_empty().await);
    }

    #[tokio::test]
    async fn streaming_error_status_becomes_inline_error_chunk() {
        let h = harness(cached_settings()).await;
        h.upstream.push(Ok(UpstreamResponse::full(
            401,
            r#"{"error": {"message": "bad key"}}"#,
        )));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()).streaming(true))
            .await
            .expect("reply");
        assert_eq!(
            collect(reply).await,
            "data: {\"choices\":[{\"delta\":{\"content\":\"[error] bad key\"}}]}\n\ndata: [DONE]\n\n"
        );
        assert!(h.kv.is_empty().await);
    }

    #[tokio::test]
    async fn non_streaming_transport_error_is_a_502_json_body() {
        let h = harness(cached_settings()).await;
        h.upstream.push(Err(GatewayError::Upstream {
            message: "connect refused".to_string(),
        }));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()))
            .await
            .expect("reply");
        let ChatReply::Json { status, body, .. } = reply else {
            panic!("expected json");
        };
        assert_eq!(status, 502);
        let body: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["error"], "upstream error: connect refused");
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "[error] upstream error: connect refused"
        );
    }

    #[tokio::test]
    async fn upstream_error_status_passes_through_uncached() {
        let h = harness(cached_settings()).await;
        h.upstream
            .push(Ok(UpstreamResponse::full(503, r#"{"error":"overloaded"}"#)));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", conversation()))
            .await
            .expect("reply");
        let ChatReply::Json { status, body, .. } = reply else {
            panic!("expected json");
        };
        assert_eq!(status, 503);
        assert_eq!(&body[..], br#"{"error":"overloaded"}"#);
        assert!(h.kv.is_empty().await);
    }

    #[tokio::test]
    async fn short_turn_is_routed_after_a_successful_probe() {
        let h = harness(routing_settings()).await;
        h.upstream.push(completion("x"));
        h.upstream.push(completion("hi!"));

        h.orchestrator
            .handle_chat(ChatRequest::new("main::big", vec![Message::user("hi")]))
            .await
            .expect("reply");

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].url, "https://cheap.example/v1/chat/completions");
        assert_eq!(calls[0].body["max_tokens"], 1);
        assert_eq!(calls[0].body["stream"], false);
        assert_eq!(calls[0].timeout, Some(PROBE_TIMEOUT));
        assert_eq!(calls[1].url, "https://cheap.example/v1/chat/completions");
        assert_eq!(calls[1].body["model"], "mini");
        assert!(calls[1].body.get("max_tokens").is_none());
        assert_eq!(calls[1].headers["Authorization"], "Bearer sk-cheap");

        // cached under the requested model, so the next identical turn hits
        let hit = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", vec![Message::user("hi")]))
            .await
            .expect("reply");
        assert!(hit.is_cache_hit());
    }

    #[tokio::test]
    async fn rate_limited_probe_falls_back_to_requested_model() {
        let h = harness(routing_settings()).await;
        h.upstream.push(Ok(UpstreamResponse::full(429, "slow down")));
        h.upstream.push(completion("from big"));

        let reply = h
            .orchestrator
            .handle_chat(ChatRequest::new("main::big", vec![Message::user("hi")]))
            .await
            .expect("reply");
        assert!(collect(reply).await.contains("from big"));

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].url, "https://main.example/v1/chat/completions");
        assert_eq!(calls[1].body["model"], "big");
        assert_eq!(calls[1].headers["Authorization"], "Bearer sk-main");
    }

    #[tokio::test]
    async fn long_turn_is_not_routed_or_probed() {
        let h = harness(routing_settings()).await;
        h.upstream.push(completion("ok"));

        h.orchestrator
            .handle_chat(ChatRequest::new(
                "main::big",
                vec![Message::user("explain ownership and borrowing in depth please")],
            ))
            .await
            .expect("reply");
        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["model"], "big");
    }

    #[tokio::test]
    async fn allowed_bypass_skips_cache_and_pipeline() {
        let mut settings = routing_settings();
        settings.compress_output.enabled = true;
        settings.compress_output.instruction = "short".to_string();
        let h = harness(settings.clone()).await;
        h.orchestrator
            .cache
            .store_all(&settings.kv_cache, &[Message::user("hi")], "big", "cached")
            .await;
        h.upstream.push(completion("fresh"));

        let mut request = ChatRequest::new("main::big", vec![Message::user("hi")]);
        request.bypass_cost_optimizer = true;
        request.client = "cyoa".to_string();
        let reply = h.orchestrator.handle_chat(request).await.expect("reply");
        assert!(!reply.is_cache_hit());

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body["model"], "big");
        assert_eq!(calls[0].body["messages"], json!([{"role": "user", "content": "hi"}]));
        assert_eq!(h.kv.len().await, 1);
    }

    #[tokio::test]
    async fn refused_bypass_runs_the_normal_pipeline() {
        let h = harness(cached_settings()).await;
        h.orchestrator
            .cache
            .store_all(&cached_settings().kv_cache, &conversation(), "big", "cached")
            .await;

        let mut request = ChatRequest::new("main::big", conversation());
        request.bypass_cost_optimizer = true;
        request.client = "someone-else".to_string();
        let reply = h.orchestrator.handle_chat(request).await.expect("reply");
        assert!(reply.is_cache_hit());
    }

    #[test]
    fn bypass_policy_rules() {
        let policy = BypassPolicy::default();
        assert!(policy.allows("cyoa"));
        assert!(!policy.allows("web"));
        assert!(!policy.allows(""));

        let policy = BypassPolicy {
            allow_empty_client: true,
            ..BypassPolicy::default()
        };
        assert!(policy.allows("  "));

        let policy = BypassPolicy {
            allowlist_enabled: false,
            ..BypassPolicy::default()
        };
        assert!(policy.allows("anyone"));
    }

    #[test]
    fn capture_handles_split_lines_and_crlf() {
        let mut capture = SseContentCapture::default();
        capture.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: {\"cho");
        capture.ingest(b"ices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n: keep-alive\n");
        capture.ingest(b"data: {\"choices\":[{\"delta\":{}}]}\n\ndata: [DONE]");
        capture.finish();
        assert_eq!(capture.content(), "ab");
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            upstream_error_message(400, br#"{"error":{"message":"too long"}}"#),
            "too long"
        );
        assert_eq!(upstream_error_message(400, br#"{"error":"nope"}"#), "nope");
        assert_eq!(
            upstream_error_message(502, b"<html>bad gateway</html>"),
            "upstream API error (HTTP 502)"
        );
    }
}
