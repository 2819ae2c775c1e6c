//! Content-addressed response cache.
//!
//! Responses are keyed by a SHA-256 of the conversation text and model. The exact index hashes
//! every message with its role; the loose index hashes only user turns, so a changed system prompt
//! still hits. Entries expire on read once older than the configured TTL; nothing sweeps them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;

use super::Clock;
use super::message::{Message, Role};
use super::settings::KvCacheSettings;

const LOOSE_KEY_PREFIX: &str = "loose_";
const SSE_CHUNK_CHARS: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: String,
    pub model: String,
    /// Unix seconds at store time.
    pub time: u64,
}

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, KvStoreError>;
    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), KvStoreError>;
    async fn delete(&self, key: &str) -> Result<(), KvStoreError>;
}

/// One JSON file per key under a directory, replaced atomically on write.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, KvStoreError> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-');
        if !valid {
            return Err(KvStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, KvStoreError> {
        let path = self.entry_path(key)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), KvStoreError> {
        let path = self.entry_path(key)?;
        let payload = serde_json::to_vec(entry)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .dir
            .join(format!(".{key}.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&tmp_path, payload).await?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, KvStoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), KvStoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

pub fn exact_key(messages: &[Message], model: &str) -> String {
    let parts: Vec<String> = messages
        .iter()
        .map(|message| format!("{}:{}", message.role.as_str(), message.text()))
        .collect();
    hash_key(&parts.join("|"), model)
}

pub fn loose_key(messages: &[Message], model: &str) -> String {
    let parts: Vec<String> = messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(Message::text)
        .collect();
    format!("{LOOSE_KEY_PREFIX}{}", hash_key(&parts.join("|"), model))
}

fn hash_key(joined: &str, model: &str) -> String {
    use sha2::Digest as _;

    let mut hasher = sha2::Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(b"|model:");
    hasher.update(model.as_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for &byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[derive(Clone)]
pub struct KvCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl KvCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Exact-index hit for this conversation and model.
    pub async fn lookup(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
    ) -> Option<String> {
        if !settings.enabled {
            return None;
        }
        self.read_fresh(settings, &exact_key(messages, model)).await
    }

    /// Loose-index hit; only consulted when loose matching is on.
    pub async fn loose_lookup(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
    ) -> Option<String> {
        if !settings.enabled || !settings.loose_match {
            return None;
        }
        self.read_fresh(settings, &loose_key(messages, model)).await
    }

    pub async fn lookup_any(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
    ) -> Option<String> {
        match self.lookup(settings, messages, model).await {
            Some(content) => Some(content),
            None => self.loose_lookup(settings, messages, model).await,
        }
    }

    pub async fn store(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
        content: &str,
    ) {
        if !settings.enabled {
            return;
        }
        self.write(&exact_key(messages, model), model, content).await;
    }

    pub async fn loose_store(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
        content: &str,
    ) {
        if !settings.enabled || !settings.loose_match {
            return;
        }
        self.write(&loose_key(messages, model), model, content).await;
    }

    pub async fn store_all(
        &self,
        settings: &KvCacheSettings,
        messages: &[Message],
        model: &str,
        content: &str,
    ) {
        self.store(settings, messages, model, content).await;
        self.loose_store(settings, messages, model, content).await;
    }

    async fn read_fresh(&self, settings: &KvCacheSettings, key: &str) -> Option<String> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache read failed, treating as miss");
                return None;
            }
        };

        let age = self.clock.now_epoch_seconds().saturating_sub(entry.time);
        if age > settings.ttl {
            tracing::debug!(key, age, ttl = settings.ttl, "cache entry expired");
            if let Err(err) = self.store.delete(key).await {
                tracing::warn!(key, error = %err, "failed to delete expired cache entry");
            }
            return None;
        }
        Some(entry.content)
    }

    async fn write(&self, key: &str, model: &str, content: &str) {
        let entry = CacheEntry {
            content: content.to_string(),
            model: model.to_string(),
            time: self.clock.now_epoch_seconds(),
        };
        match self.store.put(key, &entry).await {
            Ok(()) => tracing::debug!(key, model, "cached response"),
            Err(err) => tracing::warn!(key, error = %err, "cache write failed"),
        }
    }
}

/// Replays cached content as a chat-completions event stream, four characters per event.
pub fn cache_hit_sse_events(content: &str) -> Vec<Bytes> {
    let chars: Vec<char> = content.chars().collect();
    let mut events: Vec<Bytes> = chars
        .chunks(SSE_CHUNK_CHARS)
        .map(|chunk| {
            let chunk: String = chunk.iter().collect();
            let event = json!({"choices": [{"delta": {"content": chunk}}]});
            Bytes::from(format!("data: {event}\n\n"))
        })
        .collect();
    events.push(Bytes::from_static(b"data: [DONE]\n\n"));
    events
}

/// Non-streaming reply body for a cache hit.
pub fn cache_hit_json(content: &str, model: &str) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "model": model,
    })
}
