//! Per-chunk context prefixes (the contextual-retrieval pattern).
//!
//! Each chunk gets a 1-2 sentence description of where it sits in its
//! document, generated by one or more LLM slots. Results are cached by the
//! SHA-256 of (document ‖ NUL ‖ chunk), so an unchanged document never pays
//! for generation twice. Uncached chunks are assigned round-robin across the
//! configured slots and grouped into per-slot batches; every slot runs up to
//! its own `parallelism` batches in flight, and all slots proceed in
//! parallel. Any batch failure degrades to empty prefixes — contextualization
//! never blocks indexing.

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::chunker::approx_token_count;
use crate::config::{ContextConfig, LlmSlot};
use crate::hash::context_cache_key;
use crate::llm::{first_json_array, LlmClient};
use crate::store::Store;

/// Accepted length band for a generated prefix.
const MIN_PREFIX_CHARS: usize = 10;
const MAX_PREFIX_CHARS: usize = 500;

pub struct Contextualizer {
    llm: LlmClient,
    config: ContextConfig,
}

struct PendingChunk {
    /// Position in the caller's chunk list.
    position: usize,
    cache_key: String,
    content: String,
}

impl Contextualizer {
    pub fn new(config: ContextConfig) -> Result<Self> {
        Ok(Self {
            llm: LlmClient::new(120)?,
            config,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.slots.is_empty()
    }

    /// How many files the indexer may contextualize concurrently.
    pub fn file_concurrency(&self) -> usize {
        self.config.file_concurrency
    }

    /// Context prefixes for every chunk of one document, in input order.
    /// Cached entries are returned without any network traffic; the rest are
    /// generated and written through to the cache. A chunk whose batch fails
    /// gets an empty prefix.
    pub async fn contextualize(
        &self,
        store: &Store,
        doc_content: &str,
        chunks: &[String],
    ) -> Result<Vec<String>> {
        let mut prefixes = vec![String::new(); chunks.len()];
        if !self.is_enabled() || chunks.is_empty() {
            return Ok(prefixes);
        }

        let mut pending: Vec<PendingChunk> = Vec::new();
        for (position, content) in chunks.iter().enumerate() {
            let cache_key = context_cache_key(doc_content, content);
            match store.get_context(&cache_key).await? {
                Some(cached) => prefixes[position] = cached,
                None => pending.push(PendingChunk {
                    position,
                    cache_key,
                    content: content.clone(),
                }),
            }
        }
        if pending.is_empty() {
            return Ok(prefixes);
        }
        debug!(
            "contextualizing {} of {} chunks ({} cached)",
            pending.len(),
            chunks.len(),
            chunks.len() - pending.len()
        );

        let doc_excerpt = truncate_document(doc_content, self.config.max_doc_tokens);

        // Round-robin chunks across slots, then batch within each slot.
        let slots = &self.config.slots;
        let mut per_slot: Vec<Vec<PendingChunk>> = (0..slots.len()).map(|_| Vec::new()).collect();
        for (i, chunk) in pending.into_iter().enumerate() {
            per_slot[i % slots.len()].push(chunk);
        }

        let slot_runs = slots.iter().zip(per_slot.into_iter()).map(|(slot, assigned)| {
            self.run_slot(slot, &doc_excerpt, assigned)
        });
        let produced: Vec<Vec<(usize, String, String)>> =
            futures_util::future::join_all(slot_runs).await;

        for (position, cache_key, prefix) in produced.into_iter().flatten() {
            if let Err(e) = store.put_context(&cache_key, &prefix).await {
                warn!("failed to persist context prefix: {e}");
            }
            prefixes[position] = prefix;
        }

        Ok(prefixes)
    }

    /// All batches of one slot, at most `slot.parallelism` in flight.
    /// Returns (caller position, cache key, prefix) triples for entries that
    /// were actually generated; failed batches produce nothing.
    async fn run_slot(
        &self,
        slot: &LlmSlot,
        doc_excerpt: &str,
        assigned: Vec<PendingChunk>,
    ) -> Vec<(usize, String, String)> {
        let batches: Vec<Vec<PendingChunk>> = {
            let mut batches = Vec::new();
            let mut assigned = assigned;
            while !assigned.is_empty() {
                let take = assigned.len().min(slot.batch_size);
                batches.push(assigned.drain(..take).collect());
            }
            batches
        };

        stream::iter(batches.into_iter().map(|batch| self.run_batch(slot, doc_excerpt, batch)))
            .buffer_unordered(slot.parallelism.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn run_batch(
        &self,
        slot: &LlmSlot,
        doc_excerpt: &str,
        batch: Vec<PendingChunk>,
    ) -> Vec<(usize, String, String)> {
        let prompt = build_prompt(doc_excerpt, &batch);
        let response = match self.llm.complete(slot, &prompt, 200 * batch.len() as u32, 0.0).await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("context batch of {} on {} failed: {e}", batch.len(), slot.model);
                return Vec::new();
            }
        };

        let Some(entries) = first_json_array(&response) else {
            warn!("context batch response had no JSON array");
            return Vec::new();
        };

        batch
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let prefix = entries
                    .get(i)
                    .and_then(|v| v.as_str())
                    .filter(|s| (MIN_PREFIX_CHARS..=MAX_PREFIX_CHARS).contains(&s.chars().count()))
                    .map(str::to_string)
                    .unwrap_or_default();
                (chunk.position, chunk.cache_key, prefix)
            })
            .collect()
    }
}

/// Fit the document into the prompt budget: whole document when it fits,
/// otherwise 70% head and 25% tail joined by an ellipsis line.
fn truncate_document(doc: &str, max_tokens: usize) -> String {
    if approx_token_count(doc) <= max_tokens {
        return doc.to_string();
    }
    let max_chars = max_tokens * 3;
    let chars: Vec<char> = doc.chars().collect();
    let head_len = (max_chars * 70) / 100;
    let tail_len = (max_chars * 25) / 100;
    let head: String = chars[..head_len.min(chars.len())].iter().collect();
    let tail: String = chars[chars.len().saturating_sub(tail_len)..].iter().collect();
    format!("{head}\n...\n{tail}")
}

fn build_prompt(doc_excerpt: &str, batch: &[PendingChunk]) -> String {
    let mut prompt = String::with_capacity(doc_excerpt.len() + batch.len() * 256);
    prompt.push_str("<document>\n");
    prompt.push_str(doc_excerpt);
    prompt.push_str("\n</document>\n\n");
    prompt.push_str(&format!(
        "Below are {} chunks taken from the document above. For each chunk, \
         write 1-2 short sentences situating it within the document, to be \
         used as a retrieval prefix. Answer with a JSON array of exactly {} \
         strings, one per chunk, in order. No other text.\n\n",
        batch.len(),
        batch.len()
    ));
    for (i, chunk) in batch.iter().enumerate() {
        prompt.push_str(&format!("<chunk index=\"{i}\">\n{}\n</chunk>\n", chunk.content));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(position: usize, content: &str) -> PendingChunk {
        PendingChunk {
            position,
            cache_key: format!("key-{position}"),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_truncate_short_document_untouched() {
        let doc = "short document body";
        assert_eq!(truncate_document(doc, 1000), doc);
    }

    #[test]
    fn test_truncate_long_document_head_and_tail() {
        let doc: String = (0..2000).map(|i| format!("w{i} ")).collect();
        let out = truncate_document(&doc, 100);
        assert!(out.contains("\n...\n"));
        assert!(out.starts_with("w0 "));
        assert!(out.trim_end().ends_with("w1999"));
        // 70% + 25% of the budget, plus the joiner.
        assert!(out.chars().count() < 300 + 10);
    }

    #[test]
    fn test_prompt_contains_indexed_chunks() {
        let batch = vec![pending(3, "first chunk text"), pending(7, "second chunk text")];
        let prompt = build_prompt("the document", &batch);
        assert!(prompt.contains("<chunk index=\"0\">\nfirst chunk text"));
        assert!(prompt.contains("<chunk index=\"1\">\nsecond chunk text"));
        assert!(prompt.contains("exactly 2 strings"));
    }

    #[tokio::test]
    async fn test_disabled_returns_empty_prefixes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = crate::store::Store::open(
            &crate::config::StoreConfig {
                index_path: tmp.path().join("index.db"),
            },
            4,
        )
        .await
        .unwrap();
        let ctx = Contextualizer::new(ContextConfig::default()).unwrap();
        let prefixes = ctx
            .contextualize(&store, "doc", &["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(prefixes, vec![String::new(), String::new()]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_generation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = crate::store::Store::open(
            &crate::config::StoreConfig {
                index_path: tmp.path().join("index.db"),
            },
            4,
        )
        .await
        .unwrap();

        let doc = "a document about deployment";
        let chunk = "the chunk body";
        let key = context_cache_key(doc, chunk);
        store.put_context(&key, "Cached prefix sentence.").await.unwrap();

        // Slot points at a dead endpoint; a cache miss would fail loudly,
        // a hit never dials out.
        let config = ContextConfig {
            enabled: true,
            slots: vec![LlmSlot {
                endpoint: "http://127.0.0.1:1/never".to_string(),
                model: "m".to_string(),
                api_key: None,
                parallelism: 1,
                batch_size: 10,
            }],
            ..ContextConfig::default()
        };
        let ctx = Contextualizer::new(config).unwrap();
        let prefixes = ctx
            .contextualize(&store, doc, &[chunk.to_string()])
            .await
            .unwrap();
        assert_eq!(prefixes, vec!["Cached prefix sentence.".to_string()]);
    }
}
