//! Provider records and the read-only directory the gateway resolves them from.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;

fn default_models_path() -> String {
    "/models".to_string()
}

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

fn default_image_gen_path() -> String {
    "/images/generations".to_string()
}

fn default_image_edit_path() -> String {
    "/images/edits".to_string()
}

fn default_video_path() -> String {
    "/videos/generations".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_models_path")]
    pub models_path: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_image_gen_path")]
    pub image_gen_path: String,
    #[serde(default = "default_image_edit_path")]
    pub image_edit_path: String,
    #[serde(default = "default_video_path")]
    pub video_path: String,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    #[serde(default)]
    pub all_models: Vec<String>,
    /// Models enabled for use; the rest of `all_models` is only listed.
    #[serde(default)]
    pub models: Vec<EnabledModel>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("models_path", &self.models_path)
            .field("chat_path", &self.chat_path)
            .field("image_gen_path", &self.image_gen_path)
            .field("image_edit_path", &self.image_edit_path)
            .field("video_path", &self.video_path)
            .field("cache_strategy", &self.cache_strategy)
            .field("all_models", &self.all_models)
            .field("models", &self.models)
            .finish()
    }
}

impl Provider {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            base_url: base_url.into(),
            api_key: String::new(),
            models_path: default_models_path(),
            chat_path: default_chat_path(),
            image_gen_path: default_image_gen_path(),
            image_edit_path: default_image_edit_path(),
            video_path: default_video_path(),
            cache_strategy: CacheStrategy::Auto,
            all_models: Vec::new(),
            models: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    /// `base_url` joined with one of the `*_path` fields.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn chat_url(&self) -> String {
        self.endpoint(&self.chat_path)
    }

    pub fn models_url(&self) -> String {
        self.endpoint(&self.models_path)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    Auto,
    Breakpoint,
    Prefix,
    None,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Auto => "auto",
            CacheStrategy::Breakpoint => "breakpoint",
            CacheStrategy::Prefix => "prefix",
            CacheStrategy::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledModel {
    Id(String),
    Typed {
        id: String,
        #[serde(rename = "type", default = "default_model_type")]
        kind: String,
    },
}

fn default_model_type() -> String {
    "chat".to_string()
}

impl EnabledModel {
    pub fn id(&self) -> &str {
        match self {
            EnabledModel::Id(id) => id,
            EnabledModel::Typed { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            EnabledModel::Id(_) => "chat",
            EnabledModel::Typed { kind, .. } => kind,
        }
    }
}

/// `provider_id::model_id`, split on the first `::`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelTarget {
    pub provider_id: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (provider_id, model) = raw.trim().split_once("::")?;
        if provider_id.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider_id, model))
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.provider_id, self.model)
    }
}

#[derive(Debug, Error)]
pub enum ProviderFileError {
    #[error("read provider file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse provider file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<Provider>, ProviderFileError>;

    async fn find_provider(&self, id: &str) -> Result<Option<Provider>, ProviderFileError> {
        Ok(self
            .list_providers()
            .await?
            .into_iter()
            .find(|provider| provider.id == id))
    }
}

/// Providers stored as a JSON array, re-read on every call so edits made by the
/// provider admin surface are picked up without a restart.
#[derive(Debug)]
pub struct ProviderFile {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ProviderFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProviderDirectory for ProviderFile {
    async fn list_providers(&self) -> Result<Vec<Provider>, ProviderFileError> {
        let _guard = self.lock.read().await;
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ProviderFileError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| ProviderFileError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory directory, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticProviders {
    providers: Vec<Provider>,
}

impl StaticProviders {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ProviderDirectory for StaticProviders {
    async fn list_providers(&self) -> Result<Vec<Provider>, ProviderFileError> {
        Ok(self.providers.clone())
    }
}

/// Selectable `{value, label, type}` entries for every enabled model.
pub fn model_options(providers: &[Provider]) -> Vec<Value> {
    providers
        .iter()
        .flat_map(|provider| {
            let label_suffix = if provider.name.is_empty() {
                provider.id.as_str()
            } else {
                provider.name.as_str()
            };
            provider.models.iter().map(move |model| {
                json!({
                    "value": ModelTarget::new(&provider.id, model.id()).to_string(),
                    "label": format!("{} ({label_suffix})", model.id()),
                    "type": model.kind(),
                })
            })
        })
        .collect()
}
