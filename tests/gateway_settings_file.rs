#![cfg(feature = "gateway")]

use std::path::Path;
use std::sync::Arc;

use ada_gateway::gateway::http::{GatewayHttpState, router};
use ada_gateway::gateway::{
    ChatOrchestrator, CostSettings, GatewayPaths, HttpUpstream, KvCache, MemoryKvStore,
    ProviderFile, SettingsStore, SystemClock,
};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn build_app(data_dir: &Path) -> Router {
    let paths = GatewayPaths::new(data_dir);
    let orchestrator = ChatOrchestrator::new(
        Arc::new(SettingsStore::new(paths.settings_file())),
        Arc::new(ProviderFile::new(&paths.providers_file)),
        KvCache::new(Arc::new(MemoryKvStore::new()), Arc::new(SystemClock)),
        Arc::new(HttpUpstream::new().expect("upstream")),
    );
    router(GatewayHttpState::new(Arc::new(orchestrator)))
}

fn put_settings(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/v1/cost-settings")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn get_settings(app: &Router) -> ada_gateway::Result<Value> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/cost-settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    Ok(serde_json::from_slice(&body)?)
}

#[tokio::test]
async fn defaults_are_served_until_something_is_saved() -> ada_gateway::Result<()> {
    let dir = tempfile::tempdir()?;
    let app = build_app(dir.path());

    let body = get_settings(&app).await?;
    assert_eq!(body["success"], true);
    assert_eq!(
        body["settings"],
        json!({
            "sliding_window": {"enabled": true, "max_tokens": 10000, "keep_first_rounds": 2, "keep_last_rounds": 5},
            "model_routing": {"enabled": false, "light_model": "", "simple_max_chars": 30, "complex_keywords": ""},
            "compress_output": {"enabled": false, "instruction": ""},
            "kv_cache": {"enabled": false, "ttl": 3600, "loose_match": false},
            "smart_max_tokens": {"enabled": false, "tiers": "20:512,100:1024,500:2048,0:4096"},
            "prompt_compress": {"enabled": false}
        })
    );
    assert!(!dir.path().join("cost_settings.json").exists());
    Ok(())
}

#[tokio::test]
async fn saved_settings_round_trip_through_the_file() -> ada_gateway::Result<()> {
    let dir = tempfile::tempdir()?;
    let app = build_app(dir.path());

    let response = app
        .clone()
        .oneshot(put_settings(
            json!({"settings": {
                "kv_cache": {"enabled": true, "ttl": 60},
                "model_routing": {"enabled": true, "light_model": "cheap::mini"}
            }})
            .to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&body)?, json!({"success": true}));

    let settings = get_settings(&app).await?["settings"].clone();
    assert_eq!(settings["kv_cache"], json!({"enabled": true, "ttl": 60, "loose_match": false}));
    assert_eq!(settings["model_routing"]["light_model"], "cheap::mini");
    assert_eq!(settings["model_routing"]["simple_max_chars"], 30);
    assert_eq!(settings["sliding_window"]["enabled"], true);

    // the whole document is written, not just the keys that were sent
    let raw = std::fs::read(dir.path().join("cost_settings.json"))?;
    let on_disk: CostSettings = serde_json::from_slice(&raw)?;
    assert!(on_disk.kv_cache.enabled);
    assert_eq!(on_disk.kv_cache.ttl, 60);
    let on_disk: Value = serde_json::from_slice(&raw)?;
    assert!(on_disk.get("prompt_compress").is_some());
    let leftovers = std::fs::read_dir(dir.path())?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn legacy_documents_are_completed_on_read() -> ada_gateway::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("cost_settings.json"),
        r#"{"sliding_window": {"max_tokens": 2048}, "unknown_section": {"x": 1}}"#,
    )?;
    let app = build_app(dir.path());

    let settings = get_settings(&app).await?["settings"].clone();
    assert_eq!(settings["sliding_window"]["max_tokens"], 2048);
    assert_eq!(settings["sliding_window"]["keep_last_rounds"], 5);
    assert_eq!(settings["kv_cache"]["ttl"], 3600);
    assert!(settings.get("unknown_section").is_none());
    Ok(())
}

#[tokio::test]
async fn invalid_updates_are_rejected_and_leave_the_file_alone() -> ada_gateway::Result<()> {
    let dir = tempfile::tempdir()?;
    let app = build_app(dir.path());

    for body in [
        "{not json".to_string(),
        json!({"kv_cache": {"enabled": true}}).to_string(),
        json!({"settings": "off"}).to_string(),
        json!({"settings": {"kv_cache": {"ttl": "an hour"}}}).to_string(),
    ] {
        let response = app.clone().oneshot(put_settings(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body)?;
        assert_eq!(parsed["success"], false);
        assert!(
            parsed["error"]
                .as_str()
                .is_some_and(|err| err.starts_with("invalid settings"))
        );
    }

    assert!(!dir.path().join("cost_settings.json").exists());
    Ok(())
}
