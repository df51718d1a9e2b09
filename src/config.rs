//! Configuration structs with documented defaults and environment overrides.
//!
//! There is no config-file surface here; callers build a [`Config`] in code
//! (or start from [`Config::default`]) and [`Config::from_env`] layers the
//! `MEMORY_*` environment variables on top. Every tunable the pipeline reads
//! is an enumerated field with a default, never a dynamic option bag.
//!
//! # Environment overrides
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `MEMORY_INDEX_PATH` | store database file |
//! | `MEMORY_EMBEDDING_ENDPOINT` | embedding service URL |
//! | `MEMORY_LLM_ENDPOINT` | first LLM slot URL |
//! | `MEMORY_LLM_MODEL` | first LLM slot model |
//! | `MEMORY_LLM_API_KEY` | cascades into every configured LLM slot |
//! | `MEMORY_RERANK_ENDPOINT` | rerank service URL |
//! | `MEMORY_SEARCH_DISABLE_RERANK` | any truthy value skips reranking |
//! | `MEMORY_LOG_LEVEL` | debug, info, warn, error, or silent |

use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub expand: ExpandConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the single-file database.
    pub index_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("./memory/index.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkConfig {
    /// Token budget per chunk before a non-heading flush.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tail carried into the next chunk on a non-heading flush.
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Chunks shorter than this (after trim) are dropped.
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap_tokens() -> usize {
    50
}
fn default_min_chunk_chars() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding service URL. `POST {content: [...]}`.
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    /// Vector dimensionality of the deployed model.
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Inputs per request.
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
    /// Concurrent in-flight requests.
    #[serde(default = "default_embed_concurrency")]
    pub max_concurrent: usize,
    /// Pause after this many batches to let upstream rate limits reset.
    #[serde(default = "default_cooldown_every")]
    pub cooldown_every: usize,
    /// Length of that pause, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// In-memory query-embedding LRU capacity.
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            dims: default_dims(),
            batch_size: default_embed_batch(),
            max_concurrent: default_embed_concurrency(),
            cooldown_every: default_cooldown_every(),
            cooldown_secs: default_cooldown_secs(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            query_cache_size: default_query_cache_size(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "http://localhost:8089/embed".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_embed_batch() -> usize {
    50
}
fn default_embed_concurrency() -> usize {
    2
}
fn default_cooldown_every() -> usize {
    300
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_query_cache_size() -> usize {
    200
}

/// One LLM endpoint used by the contextualizer (and, for the first slot,
/// the query expander).
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSlot {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Concurrent in-flight batches on this slot.
    #[serde(default = "default_slot_parallelism")]
    pub parallelism: usize,
    /// Chunks per batch prompt.
    #[serde(default = "default_slot_batch")]
    pub batch_size: usize,
}

fn default_slot_parallelism() -> usize {
    2
}
fn default_slot_batch() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub slots: Vec<LlmSlot>,
    /// Token budget for the document portion of each batch prompt.
    #[serde(default = "default_context_doc_tokens")]
    pub max_doc_tokens: usize,
    /// Files contextualized concurrently during indexing.
    #[serde(default = "default_context_files")]
    pub file_concurrency: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slots: Vec::new(),
            max_doc_tokens: default_context_doc_tokens(),
            file_concurrency: default_context_files(),
        }
    }
}

fn default_context_doc_tokens() -> usize {
    6000
}
fn default_context_files() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpandConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_expand_cache")]
    pub cache_size: usize,
    #[serde(default = "default_expand_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ExpandConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_size: default_expand_cache(),
            max_tokens: default_expand_max_tokens(),
        }
    }
}

fn default_expand_cache() -> usize {
    64
}
fn default_expand_max_tokens() -> u32 {
    400
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Results returned to the caller.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidate cap per retrieval arm.
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_weight_original")]
    pub weight_original: f64,
    #[serde(default = "default_weight_lex")]
    pub weight_lex: f64,
    #[serde(default = "default_weight_vec")]
    pub weight_vec: f64,
    #[serde(default = "default_weight_hyde")]
    pub weight_hyde: f64,
    /// Blend of the original query's normalized BM25 and semantic scores.
    #[serde(default = "default_bm25_blend")]
    pub bm25_blend: f64,
    #[serde(default = "default_semantic_blend")]
    pub semantic_blend: f64,
    #[serde(default = "default_true")]
    pub spell_correct: bool,
    #[serde(default)]
    pub disable_rerank: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidates: default_candidates(),
            rrf_k: default_rrf_k(),
            weight_original: default_weight_original(),
            weight_lex: default_weight_lex(),
            weight_vec: default_weight_vec(),
            weight_hyde: default_weight_hyde(),
            bm25_blend: default_bm25_blend(),
            semantic_blend: default_semantic_blend(),
            spell_correct: true,
            disable_rerank: false,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_candidates() -> usize {
    300
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_weight_original() -> f64 {
    4.0
}
fn default_weight_lex() -> f64 {
    0.5
}
fn default_weight_vec() -> f64 {
    0.5
}
fn default_weight_hyde() -> f64 {
    0.25
}
fn default_bm25_blend() -> f64 {
    0.6
}
fn default_semantic_blend() -> f64 {
    0.4
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Results handed to the cross-encoder.
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    #[serde(default = "default_weight_bge")]
    pub weight_bge: f64,
    #[serde(default = "default_weight_qwen")]
    pub weight_qwen: f64,
    #[serde(default = "default_weight_gemma")]
    pub weight_gemma: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rerank_endpoint(),
            enabled: true,
            top_k: default_rerank_top_k(),
            weight_bge: default_weight_bge(),
            weight_qwen: default_weight_qwen(),
            weight_gemma: default_weight_gemma(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_endpoint() -> String {
    "http://localhost:8091/rerank".to_string()
}
fn default_true() -> bool {
    true
}
fn default_rerank_top_k() -> usize {
    20
}
fn default_weight_bge() -> f64 {
    0.5
}
fn default_weight_qwen() -> f64 {
    0.3
}
fn default_weight_gemma() -> f64 {
    0.2
}

impl RerankConfig {
    /// Cache-busting tag encoding the blend recipe.
    ///
    /// A cached score is only reused while the recipe that produced it is
    /// still in effect; changing any weight changes the tag.
    pub fn model_tag(&self) -> String {
        format!(
            "xenc:bge{:.2}-qwen{:.2}-gemma{:.2}",
            self.weight_bge, self.weight_qwen, self.weight_gemma
        )
    }
}

/// One scanned root. Files under it join `collection`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRoot {
    pub root: PathBuf,
    pub collection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub sources: Vec<SourceRoot>,
    /// Glob patterns excluded from every scan.
    #[serde(default = "default_ignores")]
    pub ignore_globs: Vec<String>,
    /// Concurrent file stat/read operations during a scan.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            ignore_globs: default_ignores(),
            scan_concurrency: default_scan_concurrency(),
        }
    }
}

fn default_ignores() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}
fn default_scan_concurrency() -> usize {
    50
}

/// Interpret an env value as a boolean switch.
fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

impl Config {
    /// Defaults with `MEMORY_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Layer `MEMORY_*` variables over the current values.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("MEMORY_INDEX_PATH") {
            self.store.index_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("MEMORY_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = url;
        }
        if let Ok(url) = std::env::var("MEMORY_RERANK_ENDPOINT") {
            self.rerank.endpoint = url;
        }
        if let Ok(v) = std::env::var("MEMORY_SEARCH_DISABLE_RERANK") {
            if is_truthy(&v) {
                self.search.disable_rerank = true;
            }
        }

        let llm_endpoint = std::env::var("MEMORY_LLM_ENDPOINT").ok();
        let llm_model = std::env::var("MEMORY_LLM_MODEL").ok();
        if let Some(endpoint) = llm_endpoint {
            let model = llm_model.unwrap_or_else(|| "default".to_string());
            match self.context.slots.first_mut() {
                Some(slot) => {
                    slot.endpoint = endpoint;
                    slot.model = model;
                }
                None => self.context.slots.push(LlmSlot {
                    endpoint,
                    model,
                    api_key: None,
                    parallelism: default_slot_parallelism(),
                    batch_size: default_slot_batch(),
                }),
            }
        } else if let Some(model) = llm_model {
            if let Some(slot) = self.context.slots.first_mut() {
                slot.model = model;
            }
        }

        // The shared key cascades into every configured slot.
        if let Ok(key) = std::env::var("MEMORY_LLM_API_KEY") {
            for slot in &mut self.context.slots {
                slot.api_key = Some(key.clone());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            anyhow::bail!("chunking.overlap_tokens must be < max_tokens");
        }
        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if self.search.top_k == 0 {
            anyhow::bail!("search.top_k must be >= 1");
        }
        for slot in &self.context.slots {
            if slot.parallelism == 0 || slot.batch_size == 0 {
                anyhow::bail!("LLM slot parallelism and batch_size must be > 0");
            }
        }
        Ok(())
    }

    /// First LLM slot, used for expansion prompts.
    pub fn primary_llm(&self) -> Option<&LlmSlot> {
        self.context.slots.first()
    }
}
