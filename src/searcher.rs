//! Hybrid retrieval pipeline.
//!
//! A query fans out into weighted subqueries — the original (optionally
//! spell-corrected, with the uncorrected form kept at half weight), keyword
//! variants, semantic variants, and a hypothetical answer — and every
//! variant's BM25 and vector arms run in parallel. Results fuse with
//! weighted reciprocal-rank contributions for the variants and a min-max
//! score blend for the original query, then normalize to [0, 1], rank, and
//! optionally pass through the cross-encoder reranker.
//!
//! The pipeline always returns a (possibly empty) result list: a failing
//! expansion, embedding, or rerank call degrades and is reported through
//! stage events and the per-result explain record, never as an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::embedding::EmbeddingClient;
use crate::expander::QueryExpander;
use crate::reranker::Reranker;
use crate::spell::SpellCorrector;
use crate::store::Store;

/// Snippet length in the result object.
const SNIPPET_CHARS: usize = 300;
/// Vector arms fetch up to this multiple of the candidate cap to seed RRF.
const VECTOR_SEED_FACTOR: usize = 4;

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    /// Owning file's absolute path.
    pub file: String,
    pub line_start: i64,
    pub line_end: i64,
    /// Content trimmed for display.
    pub snippet: String,
    /// Full chunk content.
    pub content: String,
    pub content_hash: String,
    /// Final score in [0, 1] (post-rerank when reranking ran).
    pub score: f64,
    pub explain: Explain,
}

/// Why a result scored the way it did.
#[derive(Debug, Clone, Serialize)]
pub struct Explain {
    /// 1-based rank after fusion, before reranking.
    pub retrieval_rank: usize,
    /// 1-based rank in the original query's keyword list, if present there.
    pub bm25_rank: Option<usize>,
    /// Min-max normalized BM25 score for the original query.
    pub bm25_score: f64,
    /// Min-max normalized semantic score for the original query.
    pub semantic_score: f64,
    pub bm25_weight: f64,
    pub semantic_weight: f64,
    /// Set by the reranker when it ran.
    pub reranker_score: Option<f64>,
    pub retrieval_weight: Option<f64>,
    pub reranker_weight: Option<f64>,
}

/// Pipeline progress, reported alongside results.
#[derive(Debug, Clone, Serialize)]
pub enum StageEvent {
    Corrected {
        original: String,
        replacement: String,
    },
    Expanded {
        lex: usize,
        vec: usize,
        hyde: bool,
    },
    Reranked {
        count: usize,
        model_tag: String,
    },
    RerankSkipped {
        reason: String,
    },
    Degraded {
        what: String,
    },
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageEvent::Corrected {
                original,
                replacement,
            } => write!(f, "Corrected: {original} → {replacement}"),
            StageEvent::Expanded { lex, vec, hyde } => {
                write!(f, "Expanded: {lex} keyword, {vec} semantic, hyde={hyde}")
            }
            StageEvent::Reranked { count, model_tag } => {
                write!(f, "Reranked: {count} results ({model_tag})")
            }
            StageEvent::RerankSkipped { reason } => write!(f, "Rerank skipped: {reason}"),
            StageEvent::Degraded { what } => write!(f, "Degraded: {what}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub stages: Vec<StageEvent>,
}

pub struct Searcher {
    store: Arc<Store>,
    embedder: Arc<EmbeddingClient>,
    expander: Option<Arc<QueryExpander>>,
    reranker: Option<Reranker>,
    config: SearchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariantKind {
    Original,
    Uncorrected,
    Lex,
    Vector,
    Hyde,
}

struct Variant {
    kind: VariantKind,
    text: String,
    weight: f64,
    use_bm25: bool,
    use_vector: bool,
}

/// Per-variant retrieval output feeding fusion.
struct FusionInput {
    kind: VariantKind,
    weight: f64,
    /// (chunk id, bm25 score), best first.
    bm25: Vec<(i64, f64)>,
    /// (chunk id, similarity), best first.
    vector: Vec<(i64, f64)>,
    degraded: Option<String>,
}

/// A fused candidate before truncation.
#[derive(Debug, Clone)]
struct Fused {
    chunk_id: i64,
    score: f64,
    bm25_rank: Option<usize>,
    bm25_norm: f64,
    sem_norm: f64,
}

impl Searcher {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<EmbeddingClient>,
        expander: Option<Arc<QueryExpander>>,
        reranker: Option<Reranker>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            expander,
            reranker,
            config,
        }
    }

    pub async fn search(&self, query: &str) -> Result<SearchOutcome> {
        self.search_with_hints(query, &[]).await
    }

    pub async fn search_with_hints(
        &self,
        query: &str,
        context_hints: &[String],
    ) -> Result<SearchOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                stages: Vec::new(),
            });
        }

        let mut stages: Vec<StageEvent> = Vec::new();

        // Spell correction against the indexed vocabulary.
        let mut effective_query = query.to_string();
        let mut run_uncorrected = false;
        if self.config.spell_correct {
            match SpellCorrector::from_store(&self.store).await {
                Ok(Some(corrector)) => {
                    let result = corrector.correct(query);
                    if !result.corrections.is_empty() {
                        for c in &result.corrections {
                            stages.push(StageEvent::Corrected {
                                original: c.original.clone(),
                                replacement: c.replacement.clone(),
                            });
                        }
                        effective_query = result.corrected;
                        run_uncorrected = true;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("spell correction unavailable: {e}"),
            }
        }

        // Expansion (lex / vec / HyDE variants).
        let expansion = match &self.expander {
            Some(expander) if expander.is_enabled() => {
                let expansion = expander.expand(&effective_query, context_hints).await;
                if !expansion.is_empty() {
                    stages.push(StageEvent::Expanded {
                        lex: expansion.lex.len(),
                        vec: expansion.vec.len(),
                        hyde: expansion.hyde.is_some(),
                    });
                }
                expansion
            }
            _ => Default::default(),
        };

        let variants = self.build_variants(&effective_query, query, run_uncorrected, &expansion);

        // All subqueries, both arms each, in parallel.
        let inputs: Vec<FusionInput> =
            join_all(variants.iter().map(|v| self.run_variant(v))).await;
        for input in &inputs {
            if let Some(what) = &input.degraded {
                stages.push(StageEvent::Degraded { what: what.clone() });
            }
        }

        let fused = fuse(&inputs, &self.config);
        if fused.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                stages,
            });
        }

        let top: Vec<Fused> = fused.into_iter().take(self.config.top_k).collect();
        let ids: Vec<i64> = top.iter().map(|f| f.chunk_id).collect();
        let rows = self.store.get_chunks_by_ids(&ids).await?;
        let rows_by_id: HashMap<i64, _> = rows.into_iter().map(|r| (r.id, r)).collect();

        let mut results: Vec<SearchResult> = Vec::with_capacity(top.len());
        for (i, cand) in top.iter().enumerate() {
            let Some(row) = rows_by_id.get(&cand.chunk_id) else {
                // Deleted between fusion and fetch; skip rather than fail.
                continue;
            };
            results.push(SearchResult {
                chunk_id: row.id,
                file: row.file_path.clone(),
                line_start: row.line_start,
                line_end: row.line_end,
                snippet: make_snippet(&row.content),
                content: row.content.clone(),
                content_hash: row.content_hash.clone(),
                score: cand.score,
                explain: Explain {
                    retrieval_rank: i + 1,
                    bm25_rank: cand.bm25_rank,
                    bm25_score: cand.bm25_norm,
                    semantic_score: cand.sem_norm,
                    bm25_weight: self.config.bm25_blend,
                    semantic_weight: self.config.semantic_blend,
                    reranker_score: None,
                    retrieval_weight: None,
                    reranker_weight: None,
                },
            });
        }

        // Reranking, unless switched off.
        match &self.reranker {
            _ if self.config.disable_rerank => {
                stages.push(StageEvent::RerankSkipped {
                    reason: "disabled by configuration".to_string(),
                });
            }
            Some(reranker) if reranker.is_enabled() => {
                let (reranked, applied) = reranker
                    .rerank(&self.store, &effective_query, results)
                    .await;
                results = reranked;
                if applied {
                    stages.push(StageEvent::Reranked {
                        count: results.len(),
                        model_tag: reranker.model_tag().to_string(),
                    });
                } else {
                    stages.push(StageEvent::RerankSkipped {
                        reason: "endpoint unavailable or query too short".to_string(),
                    });
                }
            }
            _ => {}
        }

        Ok(SearchOutcome { results, stages })
    }

    fn build_variants(
        &self,
        effective_query: &str,
        raw_query: &str,
        run_uncorrected: bool,
        expansion: &crate::expander::Expansion,
    ) -> Vec<Variant> {
        let mut variants = vec![Variant {
            kind: VariantKind::Original,
            text: effective_query.to_string(),
            weight: self.config.weight_original,
            use_bm25: true,
            use_vector: true,
        }];
        if run_uncorrected {
            variants.push(Variant {
                kind: VariantKind::Uncorrected,
                text: raw_query.to_string(),
                weight: self.config.weight_original / 2.0,
                use_bm25: true,
                use_vector: true,
            });
        }
        for lex in &expansion.lex {
            variants.push(Variant {
                kind: VariantKind::Lex,
                text: lex.clone(),
                weight: self.config.weight_lex,
                use_bm25: true,
                use_vector: false,
            });
        }
        for vec in &expansion.vec {
            variants.push(Variant {
                kind: VariantKind::Vector,
                text: vec.clone(),
                weight: self.config.weight_vec,
                use_bm25: false,
                use_vector: true,
            });
        }
        if let Some(hyde) = &expansion.hyde {
            variants.push(Variant {
                kind: VariantKind::Hyde,
                text: hyde.clone(),
                weight: self.config.weight_hyde,
                use_bm25: false,
                use_vector: true,
            });
        }
        variants
    }

    async fn run_variant(&self, variant: &Variant) -> FusionInput {
        let (bm25, vector) = tokio::join!(
            self.run_bm25_arm(variant),
            self.run_vector_arm(variant)
        );
        let (bm25, bm25_degraded) = bm25;
        let (vector, vector_degraded) = vector;
        FusionInput {
            kind: variant.kind,
            weight: variant.weight,
            bm25,
            vector,
            degraded: bm25_degraded.or(vector_degraded),
        }
    }

    async fn run_bm25_arm(&self, variant: &Variant) -> (Vec<(i64, f64)>, Option<String>) {
        if !variant.use_bm25 {
            return (Vec::new(), None);
        }
        let strict = match self.store.search_fts(&variant.text, self.config.candidates).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("keyword search failed: {e}");
                return (Vec::new(), Some("keyword search failed".to_string()));
            }
        };
        if !strict.is_empty() {
            return (strict, None);
        }
        // Strict AND found nothing; try the fuzzy OR fallback.
        match self
            .store
            .search_fts_fuzzy(&variant.text, self.config.candidates)
            .await
        {
            Ok(hits) => (hits, None),
            Err(e) => {
                warn!("fuzzy keyword search failed: {e}");
                (Vec::new(), Some("keyword search failed".to_string()))
            }
        }
    }

    async fn run_vector_arm(&self, variant: &Variant) -> (Vec<(i64, f64)>, Option<String>) {
        if !variant.use_vector {
            return (Vec::new(), None);
        }
        let embedding = match self.embedder.embed_query(&self.store, &variant.text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("query embedding failed: {e}");
                return (Vec::new(), Some("semantic search unavailable".to_string()));
            }
        };
        let limit = self.config.candidates * VECTOR_SEED_FACTOR;
        match self.store.search_vss(&embedding, limit).await {
            Ok(hits) => {
                let similarities = hits
                    .into_iter()
                    .map(|(id, distance)| (id, (1.0 - distance).max(0.0)))
                    .collect();
                (similarities, None)
            }
            Err(e) => {
                warn!("vector search failed: {e}");
                (Vec::new(), Some("semantic search unavailable".to_string()))
            }
        }
    }
}

/// Fuse all variants' arms into a ranked candidate list with scores
/// normalized to [0, 1]. Deterministic: equal scores order by chunk id.
fn fuse(inputs: &[FusionInput], config: &SearchConfig) -> Vec<Fused> {
    struct Acc {
        total: f64,
        bm25_rank: Option<usize>,
        bm25_norm: f64,
        sem_norm: f64,
    }
    fn touch(map: &mut HashMap<i64, Acc>, id: i64) -> &mut Acc {
        map.entry(id).or_insert(Acc {
            total: 0.0,
            bm25_rank: None,
            bm25_norm: 0.0,
            sem_norm: 0.0,
        })
    }
    let mut acc: HashMap<i64, Acc> = HashMap::new();

    for input in inputs {
        if input.kind == VariantKind::Original {
            let bm25_norm = min_max_map(&input.bm25);
            let sem_norm = min_max_map(&input.vector);

            // Best 0-based rank across either arm, for the top-rank bonus.
            let mut best_rank: HashMap<i64, usize> = HashMap::new();
            for list in [&input.bm25, &input.vector] {
                for (rank, (id, _)) in list.iter().enumerate() {
                    best_rank
                        .entry(*id)
                        .and_modify(|r| *r = (*r).min(rank))
                        .or_insert(rank);
                }
            }

            for (&id, &rank) in &best_rank {
                let b = bm25_norm.get(&id).copied().unwrap_or(0.0);
                let s = sem_norm.get(&id).copied().unwrap_or(0.0);
                let entry = touch(&mut acc, id);
                entry.total +=
                    input.weight * (config.bm25_blend * b + config.semantic_blend * s);
                entry.total += match rank {
                    0 => 0.05,
                    1 | 2 => 0.02,
                    _ => 0.0,
                };
                entry.bm25_norm = b;
                entry.sem_norm = s;
                entry.bm25_rank = input
                    .bm25
                    .iter()
                    .position(|(cid, _)| *cid == id)
                    .map(|p| p + 1);
            }
        } else {
            for list in [&input.bm25, &input.vector] {
                for (rank, (id, _)) in list.iter().enumerate() {
                    touch(&mut acc, *id).total += input.weight / (config.rrf_k + rank as f64);
                }
            }
        }
    }

    if acc.is_empty() {
        return Vec::new();
    }

    let min = acc.values().fold(f64::INFINITY, |a, c| a.min(c.total));
    let max = acc.values().fold(f64::NEG_INFINITY, |a, c| a.max(c.total));
    let span = max - min;

    let mut fused: Vec<Fused> = acc
        .into_iter()
        .map(|(chunk_id, a)| Fused {
            chunk_id,
            score: if span.abs() < f64::EPSILON {
                1.0
            } else {
                (a.total - min) / span
            },
            bm25_rank: a.bm25_rank,
            bm25_norm: a.bm25_norm,
            sem_norm: a.sem_norm,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    debug!("fused {} candidates from {} variants", fused.len(), inputs.len());
    fused
}

/// Min-max normalize an arm's scores; a degenerate set normalizes to 1.0.
fn min_max_map(list: &[(i64, f64)]) -> HashMap<i64, f64> {
    if list.is_empty() {
        return HashMap::new();
    }
    let min = list.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = list
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    list.iter()
        .map(|(id, s)| {
            let norm = if span.abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / span
            };
            (*id, norm)
        })
        .collect()
}

fn make_snippet(content: &str) -> String {
    if content.chars().count() <= SNIPPET_CHARS {
        return content.to_string();
    }
    content.chars().take(SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: VariantKind, weight: f64, bm25: Vec<(i64, f64)>, vector: Vec<(i64, f64)>) -> FusionInput {
        FusionInput {
            kind,
            weight,
            bm25,
            vector,
            degraded: None,
        }
    }

    fn config() -> SearchConfig {
        SearchConfig::default()
    }

    #[test]
    fn test_fuse_original_blend_and_bonus() {
        // Chunk 1 tops both arms, chunk 2 trails.
        let inputs = vec![input(
            VariantKind::Original,
            4.0,
            vec![(1, 10.0), (2, 4.0)],
            vec![(1, 0.9), (2, 0.3)],
        )];
        let fused = fuse(&inputs, &config());
        assert_eq!(fused[0].chunk_id, 1);
        assert_eq!(fused[0].score, 1.0);
        assert_eq!(fused[0].bm25_rank, Some(1));
        assert_eq!(fused[0].bm25_norm, 1.0);
        assert_eq!(fused[0].sem_norm, 1.0);
        assert_eq!(fused[1].chunk_id, 2);
        assert!(fused[1].score < 1.0);
        assert_eq!(fused[1].bm25_norm, 0.0);
    }

    #[test]
    fn test_fuse_scores_in_unit_interval_weakly_decreasing() {
        let inputs = vec![
            input(
                VariantKind::Original,
                4.0,
                vec![(1, 9.0), (2, 5.0), (3, 2.0)],
                vec![(2, 0.8), (4, 0.6)],
            ),
            input(VariantKind::Lex, 0.5, vec![(3, 7.0), (5, 6.0)], vec![]),
            input(VariantKind::Hyde, 0.25, vec![], vec![(4, 0.9), (1, 0.2)]),
        ];
        let fused = fuse(&inputs, &config());
        assert!(!fused.is_empty());
        for w in fused.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
        for f in &fused {
            assert!((0.0..=1.0).contains(&f.score));
        }
    }

    #[test]
    fn test_fuse_rrf_contribution_only_for_variants() {
        // A single non-original variant: pure RRF, rank order preserved.
        let inputs = vec![input(
            VariantKind::Lex,
            0.5,
            vec![(7, 3.0), (8, 2.0), (9, 1.0)],
            vec![],
        )];
        let fused = fuse(&inputs, &config());
        let order: Vec<i64> = fused.iter().map(|f| f.chunk_id).collect();
        assert_eq!(order, vec![7, 8, 9]);
        // RRF candidates carry no original-arm explain fields.
        assert_eq!(fused[0].bm25_rank, None);
    }

    #[test]
    fn test_fuse_tie_breaks_by_chunk_id() {
        let inputs = vec![input(
            VariantKind::Lex,
            0.5,
            vec![],
            vec![(12, 0.5), (3, 0.5)],
        )];
        // Identical RRF totals at ranks 0 and 1 differ, so use two variants
        // mirroring each other for an exact tie.
        let inputs = vec![
            inputs.into_iter().next().unwrap(),
            input(VariantKind::Vector, 0.5, vec![], vec![(3, 0.5), (12, 0.5)]),
        ];
        let fused = fuse(&inputs, &config());
        assert_eq!(fused[0].chunk_id, 3);
        assert_eq!(fused[1].chunk_id, 12);
        assert_eq!(fused[0].score, fused[1].score);
    }

    #[test]
    fn test_fuse_top_rank_bonus_tiers() {
        // Same normalized blend for both chunks (each tops one arm), but
        // chunk 1 holds rank 0 in bm25 while chunk 2's best rank is 1.
        let inputs = vec![input(
            VariantKind::Original,
            4.0,
            vec![(1, 5.0), (2, 5.0)],
            vec![(1, 0.4), (2, 0.4)],
        )];
        let fused = fuse(&inputs, &config());
        // Both normalize to 1.0 blend; the bonus separates them pre-normalization.
        assert_eq!(fused[0].chunk_id, 1);
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn test_min_max_map_degenerate_is_one() {
        let m = min_max_map(&[(1, 0.5), (2, 0.5)]);
        assert_eq!(m[&1], 1.0);
        assert_eq!(m[&2], 1.0);
        assert!(min_max_map(&[]).is_empty());
    }

    #[test]
    fn test_snippet_trimmed() {
        let long = "x".repeat(1000);
        assert_eq!(make_snippet(&long).chars().count(), SNIPPET_CHARS);
        assert_eq!(make_snippet("short"), "short");
    }

    #[test]
    fn test_stage_event_display() {
        let e = StageEvent::Corrected {
            original: "autentication".to_string(),
            replacement: "authentication".to_string(),
        };
        assert_eq!(e.to_string(), "Corrected: autentication → authentication");
    }
}
