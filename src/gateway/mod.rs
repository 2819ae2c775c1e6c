//! Cost-optimizing chat gateway.

pub mod kv_cache;
pub mod message;
pub mod model_list;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod settings;
pub mod tasks;
pub mod telemetry;
pub mod token_count;
pub mod upstream;

#[cfg(feature = "gateway")]
pub mod http;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use kv_cache::{CacheEntry, FileKvStore, KvCache, KvStore, MemoryKvStore};
pub use orchestrator::{BypassPolicy, ChatOrchestrator, ChatReply, ChatRequest};
pub use pipeline::{PipelineOutput, run_cost_pipeline};
pub use provider::{
    CacheStrategy, EnabledModel, ModelTarget, Provider, ProviderDirectory, ProviderFile,
    StaticProviders,
};
pub use settings::{CostSettings, SettingsStore};
pub use tasks::{MediaReply, MediaTask, run_media_task};
pub use upstream::{HttpUpstream, Upstream, UpstreamBody, UpstreamRequest, UpstreamResponse};

#[cfg(feature = "gateway")]
pub use http::GatewayHttpState;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("provider not found: {id}")]
    ProviderNotFound { id: String },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("provider file error: {0}")]
    ProviderFile(#[from] provider::ProviderFileError),
    #[error("settings error: {0}")]
    Settings(#[from] settings::SettingsError),
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// On-disk layout under the gateway data directory.
#[derive(Clone, Debug)]
pub struct GatewayPaths {
    pub data_dir: PathBuf,
    pub providers_file: PathBuf,
}

impl GatewayPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let providers_file = data_dir.join("providers.json");
        Self {
            data_dir,
            providers_file,
        }
    }

    pub fn with_providers_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.providers_file = path.into();
        self
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("cost_settings.json")
    }

    pub fn kv_cache_dir(&self) -> PathBuf {
        self.data_dir.join("kv_cache")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
