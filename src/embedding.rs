//! Embedding client: batched, parallel, rate-limit-aware calls to the
//! external embedding endpoint, plus the vector utilities used across the
//! crate.
//!
//! The wire contract is `POST {content: [...]}` returning one item per input
//! with `embedding[0]` holding the vector. Every non-zero vector is
//! L2-normalized on receipt. Query embeddings go through a two-level cache:
//! an in-memory LRU of the 200 most recent queries and a persistent mirror
//! in the store, both keyed by the raw query text.
//!
//! # Retry strategy
//!
//! - HTTP 429 and 5xx → exponential backoff with jitter: 1s, 2s, 4s, ... (capped)
//! - other 4xx → fail immediately
//! - network errors → retry
//! - a failed batch is retried item by item after a short pause; items that
//!   still fail yield a zero vector and a counted error rather than aborting
//!   the run
//!
//! Every ~300 batches the client pauses for ~60 s to let upstream rate
//! limits reset, then probes endpoint health before resuming.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::future::join_all;
use lru::LruCache;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::shutdown::Shutdown;
use crate::store::Store;

/// Prefix for query-side embeddings, per the embedding model's convention.
const QUERY_PREFIX: &str = "search_query: ";
/// Prefix for document-side embeddings.
const DOC_PREFIX: &str = "search_document: ";
/// Inputs longer than this are truncated before the request.
const MAX_INPUT_CHARS: usize = 8000;
/// Pause before the item-by-item retry of a failed batch.
const BATCH_RETRY_PAUSE: Duration = Duration::from_secs(2);

pub struct EmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

/// Result of embedding a document set. `failed` counts inputs that ended up
/// as zero vectors after the retry budget was exhausted.
#[derive(Debug)]
pub struct EmbedOutcome {
    pub vectors: Vec<Vec<f32>>,
    pub failed: usize,
}

#[derive(Deserialize)]
struct WireItem {
    index: usize,
    embedding: Vec<Vec<f32>>,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let capacity =
            NonZeroUsize::new(config.query_cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            http,
            config,
            query_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    /// POST a probe input and require a parseable response.
    pub async fn health_check(&self) -> Result<()> {
        let vectors = self.post_embed(&["test".to_string()]).await?;
        if vectors.len() != 1 {
            bail!("health probe returned {} embeddings for 1 input", vectors.len());
        }
        Ok(())
    }

    /// Embed a search query, consulting the in-memory LRU and the store's
    /// persistent cache before going to the network. Writes through to both
    /// on a miss.
    pub async fn embed_query(&self, store: &Store, query: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self
            .query_cache
            .lock()
            .expect("query cache poisoned")
            .get(query)
            .cloned()
        {
            return Ok(hit);
        }

        if let Some(hit) = store.get_cached_query_embedding(query).await? {
            self.query_cache
                .lock()
                .expect("query cache poisoned")
                .put(query.to_string(), hit.clone());
            return Ok(hit);
        }

        let input = format!("{QUERY_PREFIX}{}", sanitize_input(query));
        let mut vectors = self.embed_batch_with_retry(&[input]).await?;
        let Some(vector) = vectors.pop() else {
            bail!("embedding endpoint returned no vector for query");
        };

        store.put_cached_query_embedding(query, &vector).await?;
        self.query_cache
            .lock()
            .expect("query cache poisoned")
            .put(query.to_string(), vector.clone());
        Ok(vector)
    }

    /// Embed a document set, preserving input order. Batches of up to
    /// `batch_size` run at most `max_concurrent` at a time; a cooldown kicks
    /// in every `cooldown_every` batches. Inputs that fail terminally come
    /// back as zero vectors, counted in the outcome.
    pub async fn embed_documents(
        &self,
        texts: &[String],
        shutdown: &Shutdown,
    ) -> Result<EmbedOutcome> {
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| format!("{DOC_PREFIX}{}", sanitize_input(t)))
            .collect();

        let batches: Vec<&[String]> = inputs.chunks(self.config.batch_size.max(1)).collect();
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(inputs.len());
        let mut failed = 0usize;
        let mut batches_done = 0usize;

        for wave in batches.chunks(self.config.max_concurrent.max(1)) {
            if shutdown.is_triggered() {
                bail!("embedding cancelled by shutdown");
            }

            let results = join_all(wave.iter().map(|batch| self.embed_batch_salvaging(batch))).await;
            for (batch_vectors, batch_failed) in results {
                vectors.extend(batch_vectors);
                failed += batch_failed;
            }

            let before = batches_done;
            batches_done += wave.len();
            if crossed_multiple(before, batches_done, self.config.cooldown_every) {
                self.cooldown(shutdown).await;
            }
        }

        Ok(EmbedOutcome { vectors, failed })
    }

    /// Embed one batch; on failure, back off briefly and retry each item
    /// individually, substituting a zero vector as the last resort.
    async fn embed_batch_salvaging(&self, batch: &[String]) -> (Vec<Vec<f32>>, usize) {
        match self.embed_batch_with_retry(batch).await {
            Ok(vectors) => (vectors, 0),
            Err(e) => {
                warn!("embedding batch of {} failed ({e}); retrying items individually", batch.len());
                tokio::time::sleep(BATCH_RETRY_PAUSE).await;
                let mut vectors = Vec::with_capacity(batch.len());
                let mut failed = 0usize;
                for item in batch {
                    match self.embed_batch_with_retry(std::slice::from_ref(item)).await {
                        Ok(mut v) if !v.is_empty() => vectors.push(v.remove(0)),
                        Ok(_) | Err(_) => {
                            failed += 1;
                            vectors.push(vec![0.0; self.config.dims]);
                        }
                    }
                }
                (vectors, failed)
            }
        }
    }

    async fn cooldown(&self, shutdown: &Shutdown) {
        debug!(
            "embedding cooldown: pausing {}s after {} batches",
            self.config.cooldown_secs, self.config.cooldown_every
        );
        tokio::time::sleep(Duration::from_secs(self.config.cooldown_secs)).await;
        for _ in 0..3 {
            if shutdown.is_triggered() {
                return;
            }
            match self.health_check().await {
                Ok(()) => return,
                Err(e) => {
                    warn!("embedding endpoint not healthy after cooldown: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// One batch with the full retry budget.
    async fn embed_batch_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let base = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(base + jitter(Duration::from_millis(500))).await;
            }

            match self.post_embed(inputs).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.downcast_ref::<Fatal>().is_some() => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
    }

    /// A single request, no retries.
    async fn post_embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "content": inputs });
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                bail!("embedding endpoint error {status}: {body_text}");
            }
            // Non-retryable client error.
            return Err(anyhow::Error::new(Fatal(format!(
                "embedding endpoint error {status}: {body_text}"
            ))));
        }

        let mut items: Vec<WireItem> = response.json().await?;
        items.sort_by_key(|item| item.index);
        if items.len() != inputs.len() {
            bail!(
                "embedding endpoint returned {} items for {} inputs",
                items.len(),
                inputs.len()
            );
        }

        let mut vectors = Vec::with_capacity(items.len());
        for item in items {
            let mut vector = item
                .embedding
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("embedding item {} was empty", item.index))?;
            if vector.len() != self.config.dims {
                bail!(
                    "embedding dimension mismatch: got {}, expected {}",
                    vector.len(),
                    self.config.dims
                );
            }
            normalize_l2(&mut vector);
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

/// Marker for errors that must not be retried.
#[derive(Debug)]
struct Fatal(String);

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Fatal {}

/// True when `[before, after)` contains a positive multiple of `step`.
fn crossed_multiple(before: usize, after: usize, step: usize) -> bool {
    if step == 0 {
        return false;
    }
    after / step > before / step
}

/// Sub-second random-ish jitter derived from the clock.
fn jitter(cap: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % cap.as_millis().max(1) as u64)
}

/// Strip control bytes (keeping newline and tab), collapse base64 data URIs
/// to `[image]`, and truncate to the service's input limit.
pub fn sanitize_input(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let cleaned = crate::chunker::strip_data_uris(&cleaned);
    if cleaned.chars().count() > MAX_INPUT_CHARS {
        cleaned.chars().take(MAX_INPUT_CHARS).collect()
    } else {
        cleaned
    }
}

/// Scale a vector to unit L2 norm in place. Zero vectors pass through.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`. Empty or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
