use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// The persisted cost-optimization document.
///
/// Every sub-object and every key inside it falls back to its default when absent, so a file
/// written before a setting existed still loads into a complete document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSettings {
    pub sliding_window: SlidingWindowSettings,
    pub model_routing: ModelRoutingSettings,
    pub compress_output: CompressOutputSettings,
    pub kv_cache: KvCacheSettings,
    pub smart_max_tokens: SmartMaxTokensSettings,
    pub prompt_compress: PromptCompressSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingWindowSettings {
    pub enabled: bool,
    pub max_tokens: u64,
    pub keep_first_rounds: usize,
    pub keep_last_rounds: usize,
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 10_000,
            keep_first_rounds: 2,
            keep_last_rounds: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRoutingSettings {
    pub enabled: bool,
    /// `provider_id::model_id`
    pub light_model: String,
    pub simple_max_chars: usize,
    /// Comma separated.
    pub complex_keywords: String,
}

impl Default for ModelRoutingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            light_model: String::new(),
            simple_max_chars: 30,
            complex_keywords: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressOutputSettings {
    pub enabled: bool,
    pub instruction: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheSettings {
    pub enabled: bool,
    /// Seconds.
    pub ttl: u64,
    pub loose_match: bool,
}

impl Default for KvCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: 3600,
            loose_match: false,
        }
    }
}

pub const DEFAULT_MAX_TOKEN_TIERS: &str = "20:512,100:1024,500:2048,0:4096";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartMaxTokensSettings {
    pub enabled: bool,
    /// `chars:limit` pairs, comma separated.
    pub tiers: String,
}

impl Default for SmartMaxTokensSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            tiers: DEFAULT_MAX_TOKEN_TIERS.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptCompressSettings {
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("read settings file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse settings file failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write settings file failed: {0}")]
    Write(std::io::Error),
}

/// JSON settings document on disk.
///
/// Loads share a read lock and saves take the write lock; saves replace the file through a
/// rename so a reader never observes a half-written document.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    lock: RwLock<()>,
    tmp_seq: AtomicU64,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings; a missing or unreadable document yields the defaults.
    pub async fn load(&self) -> CostSettings {
        match self.try_load().await {
            Ok(Some(settings)) => settings,
            Ok(None) => CostSettings::default(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "cost settings unreadable, using defaults"
                );
                CostSettings::default()
            }
        }
    }

    /// `Ok(None)` when no document has been saved yet.
    pub async fn try_load(&self) -> Result<Option<CostSettings>, SettingsError> {
        let _guard = self.lock.read().await;
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SettingsError::Read(err)),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// `.<file name>.<pid>.<seq>.tmp` beside the document, unique across processes sharing the
    /// data directory.
    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings".to_string());
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
    }

    pub async fn save(&self, settings: &CostSettings) -> Result<(), SettingsError> {
        let payload = serde_json::to_vec_pretty(settings)?;

        let _guard = self.lock.write().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(SettingsError::Write)?;
            }
        }

        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, payload)
            .await
            .map_err(SettingsError::Write)?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SettingsError::Write(err));
        }
        tracing::debug!(path = %self.path.display(), "cost settings saved");
        Ok(())
    }
}
