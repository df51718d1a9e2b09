//! Cross-encoder reranking with a persistent per-(query, doc, model) cache
//! and position-aware blending.
//!
//! Retrieval order is trusted more near the top: the blend weight table is
//! 0.95/0.05 for retrieval ranks 1-3, 0.90/0.10 for 4-10, and 0.80/0.20
//! beyond. Scores cached under the current model tag never trigger a rerank
//! call; a changed blend recipe changes the tag and invalidates the cache.
//! A failing rerank endpoint leaves the retrieval order unchanged — the
//! pipeline stays deterministic for the caller.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RerankConfig;
use crate::hash::{rerank_doc_key, sha256_hex};
use crate::searcher::SearchResult;
use crate::store::Store;

/// Queries shorter than this skip reranking entirely.
const MIN_QUERY_CHARS: usize = 3;

pub struct Reranker {
    http: reqwest::Client,
    config: RerankConfig,
    model_tag: String,
}

#[derive(Debug, Deserialize)]
struct WireScore {
    index: usize,
    score: f64,
    #[serde(default)]
    scores: Option<SubScores>,
}

#[derive(Debug, Deserialize)]
struct SubScores {
    bge: Option<f64>,
    qwen: Option<f64>,
    gemma: Option<f64>,
}

impl Reranker {
    pub fn new(config: RerankConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let model_tag = config.model_tag();
        Ok(Self {
            http,
            config,
            model_tag,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn model_tag(&self) -> &str {
        &self.model_tag
    }

    /// Rerank the top of the retrieval list. Returns the (possibly
    /// reordered) results and whether reranking was applied.
    pub async fn rerank(
        &self,
        store: &Store,
        query: &str,
        mut results: Vec<SearchResult>,
    ) -> (Vec<SearchResult>, bool) {
        if !self.config.enabled
            || query.chars().count() < MIN_QUERY_CHARS
            || results.is_empty()
        {
            return (results, false);
        }

        let take = results.len().min(self.config.top_k);
        let query_hash = sha256_hex(query.as_bytes());

        // Cache pass: collect scores we already know under this model tag.
        let mut scores: HashMap<i64, f64> = HashMap::new();
        let mut uncached: Vec<usize> = Vec::new();
        for (i, result) in results[..take].iter().enumerate() {
            let doc_key = rerank_doc_key(result.chunk_id, &result.content_hash);
            match store
                .get_rerank_score(&query_hash, &doc_key, &self.model_tag)
                .await
            {
                Ok(Some(score)) => {
                    scores.insert(result.chunk_id, score);
                }
                Ok(None) => uncached.push(i),
                Err(e) => {
                    warn!("rerank cache read failed: {e}");
                    uncached.push(i);
                }
            }
        }

        if !uncached.is_empty() {
            let documents: Vec<String> = uncached
                .iter()
                .map(|&i| results[i].content.clone())
                .collect();
            match self.call_endpoint(query, &documents).await {
                Ok(fresh) => {
                    for (slot, score) in fresh {
                        let Some(&result_idx) = uncached.get(slot) else {
                            continue;
                        };
                        let result = &results[result_idx];
                        scores.insert(result.chunk_id, score);
                        let doc_key = rerank_doc_key(result.chunk_id, &result.content_hash);
                        if let Err(e) = store
                            .put_rerank_score(&query_hash, &doc_key, &self.model_tag, score)
                            .await
                        {
                            warn!("rerank cache write failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    // Degrade to the retrieval order.
                    warn!("rerank endpoint failed; keeping retrieval order: {e}");
                    return (results, false);
                }
            }
        } else {
            debug!("rerank fully served from cache");
        }

        // Per-query min-max over everything we scored.
        let normalized = min_max(&scores);

        for result in results[..take].iter_mut() {
            let Some(&rerank_score) = normalized.get(&result.chunk_id) else {
                continue;
            };
            let (retrieval_weight, reranker_weight) =
                blend_weights(result.explain.retrieval_rank);
            result.score = retrieval_weight * result.score + reranker_weight * rerank_score;
            result.explain.reranker_score = Some(rerank_score);
            result.explain.retrieval_weight = Some(retrieval_weight);
            result.explain.reranker_weight = Some(reranker_weight);
        }

        results[..take].sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        (results, true)
    }

    /// One rerank call. Returns (input slot, normalized blended score).
    async fn call_endpoint(&self, query: &str, documents: &[String]) -> Result<Vec<(usize, f64)>> {
        let body = serde_json::json!({ "query": query, "documents": documents });
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("rerank endpoint error {status}: {body_text}");
        }

        let items: Vec<WireScore> = response.json().await?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if item.index >= documents.len() {
                continue;
            }
            out.push((item.index, self.blend_item(&item)));
        }
        Ok(out)
    }

    /// Normalize one wire item into [0, 1], blending sub-model scores when
    /// present.
    fn blend_item(&self, item: &WireScore) -> f64 {
        if let Some(subs) = &item.scores {
            let pairs = [
                (self.config.weight_bge, subs.bge),
                (self.config.weight_qwen, subs.qwen),
                (self.config.weight_gemma, subs.gemma),
            ];
            let present: Vec<(f64, f64)> = pairs
                .iter()
                .filter_map(|(w, s)| s.map(|s| (*w, normalize_score(s))))
                .collect();
            let total_weight: f64 = present.iter().map(|(w, _)| w).sum();
            if total_weight > 0.0 {
                return present.iter().map(|(w, s)| w * s).sum::<f64>() / total_weight;
            }
        }
        normalize_score(item.score)
    }
}

/// Position-aware blend weights by 1-based retrieval rank:
/// (retrieval weight, reranker weight).
pub fn blend_weights(retrieval_rank: usize) -> (f64, f64) {
    match retrieval_rank {
        1..=3 => (0.95, 0.05),
        4..=10 => (0.90, 0.10),
        _ => (0.80, 0.20),
    }
}

/// Map an upstream score into [0, 1]:
/// values already in [0, 1] pass through, values in [-1, 1] are scaled
/// linearly, anything else (a logit) goes through a sigmoid. Always clamped.
pub fn normalize_score(score: f64) -> f64 {
    let normalized = if (0.0..=1.0).contains(&score) {
        score
    } else if (-1.0..=1.0).contains(&score) {
        (score + 1.0) / 2.0
    } else {
        1.0 / (1.0 + (-score).exp())
    };
    normalized.clamp(0.0, 1.0)
}

fn min_max(scores: &HashMap<i64, f64>) -> HashMap<i64, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = scores.values().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    scores
        .iter()
        .map(|(&id, &s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (id, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_interval_passthrough() {
        for v in [0.0, 0.25, 0.5, 1.0] {
            assert_eq!(normalize_score(v), v);
        }
    }

    #[test]
    fn test_normalize_negative_unit_scaled() {
        assert!((normalize_score(-1.0) - 0.0).abs() < 1e-9);
        assert!((normalize_score(-0.5) - 0.25).abs() < 1e-9);
        // -0.0..0.0 boundary belongs to the pass-through branch.
        assert_eq!(normalize_score(0.0), 0.0);
    }

    #[test]
    fn test_normalize_logit_sigmoid() {
        let s = normalize_score(4.0);
        assert!((s - 1.0 / (1.0 + (-4.0f64).exp())).abs() < 1e-9);
        let s = normalize_score(-3.0);
        assert!((s - 1.0 / (1.0 + 3.0f64.exp())).abs() < 1e-9);
        assert!(normalize_score(100.0) <= 1.0);
        assert!(normalize_score(-100.0) >= 0.0);
    }

    #[test]
    fn test_blend_weights_tiers() {
        assert_eq!(blend_weights(1), (0.95, 0.05));
        assert_eq!(blend_weights(3), (0.95, 0.05));
        assert_eq!(blend_weights(4), (0.90, 0.10));
        assert_eq!(blend_weights(10), (0.90, 0.10));
        assert_eq!(blend_weights(11), (0.80, 0.20));
        assert_eq!(blend_weights(500), (0.80, 0.20));
    }

    #[test]
    fn test_blend_item_submodel_weights_renormalized() {
        let reranker = Reranker::new(RerankConfig::default()).unwrap();
        // Only bge and qwen present: weights 0.5/0.3 re-normalize to 5/8, 3/8.
        let item = WireScore {
            index: 0,
            score: 0.0,
            scores: Some(SubScores {
                bge: Some(1.0),
                qwen: Some(0.0),
                gemma: None,
            }),
        };
        let blended = reranker.blend_item(&item);
        assert!((blended - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_blend_item_single_score_fallback() {
        let reranker = Reranker::new(RerankConfig::default()).unwrap();
        let item = WireScore {
            index: 0,
            score: -0.5,
            scores: None,
        };
        assert!((reranker.blend_item(&item) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_min_max_degenerate() {
        let mut scores = HashMap::new();
        scores.insert(1i64, 0.7);
        scores.insert(2i64, 0.7);
        let norm = min_max(&scores);
        assert_eq!(norm[&1], 1.0);
        assert_eq!(norm[&2], 1.0);
    }
}
