//! Embedding client with an on-disk cache.
//!
//! Re-runs over an unchanged project should not re-embed anything: vectors
//! are cached keyed by `sha256(model:text)`. Transient API failures retry
//! with exponential backoff; persistent failure surfaces as
//! `embedding_failed` so the caller can mark the chunk `embedding_missing`.

use crate::error::{Error, ErrorKind, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Client for an OpenAI-compatible `/embeddings` endpoint
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    cache_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    /// Create a new client. When `cache_dir` is given, previously computed
    /// vectors are loaded from disk.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::new(ErrorKind::EmbeddingFailed, format!("http client: {e}")))?;

        let mut cache = HashMap::new();
        if let Some(dir) = &cache_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("failed to create embedding cache dir: {e}");
            }
            cache = load_cache(&dir.join("embedding_cache.json"));
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            cache_dir,
            cache: Mutex::new(cache),
        })
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Embed one text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.cache_key(text);
        if let Some(cached) = self.cache.lock().expect("cache lock").get(&key).cloned() {
            return Ok(cached);
        }

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.embed_once(text).await {
                Ok(vector) => {
                    self.cache
                        .lock()
                        .expect("cache lock")
                        .insert(key, vector.clone());
                    self.persist_cache();
                    return Ok(vector);
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BACKOFF_BASE_MS * (1 << (attempt - 1)));
                    tracing::warn!(
                        "embedding failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::new(ErrorKind::EmbeddingFailed, "retries exhausted")))
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| {
                Error::new(ErrorKind::EmbeddingFailed, format!("embedding request: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(
                ErrorKind::EmbeddingFailed,
                format!("embedding API error: {status} - {body}"),
            ));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            Error::new(
                ErrorKind::EmbeddingFailed,
                format!("failed to parse embedding response: {e}"),
            )
        })?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::new(ErrorKind::EmbeddingFailed, "empty embedding data"))
    }

    fn persist_cache(&self) {
        let Some(dir) = &self.cache_dir else {
            return;
        };
        let snapshot = self.cache.lock().expect("cache lock").clone();
        let path = dir.join("embedding_cache.json");
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("failed to persist embedding cache: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize embedding cache: {e}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().expect("cache lock").len()
    }
}

fn load_cache(path: &std::path::Path) -> HashMap<String, Vec<f32>> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read(path).map_err(|e| e.to_string()).and_then(|bytes| {
        serde_json::from_slice::<HashMap<String, Vec<f32>>>(&bytes).map_err(|e| e.to_string())
    }) {
        Ok(cache) => {
            tracing::info!("loaded {} cached embeddings", cache.len());
            cache
        }
        Err(e) => {
            tracing::warn!("failed to load embedding cache, starting empty: {e}");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client_with_cache(dir: Option<PathBuf>) -> EmbeddingClient {
        EmbeddingClient::new(
            "http://localhost:9",
            "key",
            "test-model",
            Duration::from_secs(1),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_cache_key_depends_on_model_and_text() {
        let client = client_with_cache(None);
        let a = client.cache_key("hello");
        let b = client.cache_key("world");
        assert_ne!(a, b);
        assert_eq!(a, client.cache_key("hello"));
    }

    #[test]
    fn test_cache_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let client = client_with_cache(Some(dir.path().to_path_buf()));
        let key = client.cache_key("contract text");
        client
            .cache
            .lock()
            .unwrap()
            .insert(key.clone(), vec![0.1, 0.2, 0.3]);
        client.persist_cache();

        let reloaded = client_with_cache(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.cache_len(), 1);
        assert_eq!(
            reloaded.cache.lock().unwrap().get(&key).unwrap(),
            &vec![0.1, 0.2, 0.3]
        );
    }

    #[test]
    fn test_corrupt_cache_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("embedding_cache.json"), b"not json").unwrap();
        let client = client_with_cache(Some(dir.path().to_path_buf()));
        assert_eq!(client.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_cached_embed_skips_network() {
        let client = client_with_cache(None);
        let key = client.cache_key("cached text");
        client.cache.lock().unwrap().insert(key, vec![1.0]);
        // base_url points nowhere; success proves the cache short-circuits.
        let vector = client.embed("cached text").await.unwrap();
        assert_eq!(vector, vec![1.0]);
    }
}
