//! # Memory Search
//!
//! **Personal-scale hybrid semantic search over a corpus of Markdown notes.**
//!
//! Memory Search indexes Markdown files into a single-file store of chunks
//! with vector embeddings and a full-text index, and answers natural-language
//! queries with a hybrid pipeline: BM25 keyword search, approximate vector
//! search, optional LLM query expansion (including hypothetical-answer
//! embedding), optional per-chunk context prefixes, reciprocal-rank fusion,
//! and cross-encoder reranking with position-aware blending.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌───────────┐
//! │ Scanner  │──▶│ Chunk → Context → Embed   │──▶│  SQLite   │
//! │ **/*.md  │   │       (indexer)           │   │ FTS5+Vec  │
//! └──────────┘   └───────────────────────────┘   └─────┬─────┘
//!                                                      │
//!                ┌────────────────────────────────┐    │
//!                │ Spell → Expand → BM25 ∥ Vector │◀───┘
//!                │   → RRF fusion → Rerank        │
//!                │          (searcher)            │
//!                └────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **indexer** ([`indexer`]) scans configured roots for Markdown
//!    files, detects changes by mtime and content hash, and re-chunks only
//!    what changed.
//! 2. The **chunker** ([`chunker`]) splits on heading boundaries with a
//!    token budget and overlap, recording line spans and heading lineage.
//! 3. The **contextualizer** ([`contextualizer`]) optionally generates a
//!    short context prefix per chunk via round-robin LLM slots, cached by
//!    content hash.
//! 4. The **embedding client** ([`embedding`]) batches chunks to the
//!    external embedding endpoint with rate-limit cooldowns and retries.
//! 5. The **store** ([`store`]) persists files, chunks, collections,
//!    sessions, the FTS mirror, vector rows, and the on-disk caches, one
//!    transaction per file.
//! 6. The **searcher** ([`searcher`]) fans a query out into weighted
//!    subqueries, fuses rankings with RRF and a score blend, and hands the
//!    top of the list to the **reranker** ([`reranker`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Configuration structs, defaults, `MEMORY_*` env overrides |
//! | [`hash`] | SHA-256 hashing, cache keys, `memory://` virtual paths |
//! | [`chunker`] | Markdown-aware splitter with heading lineage and overlap |
//! | [`embedding`] | Batched embedding client, query caches, vector utilities |
//! | [`llm`] | Chat-endpoint client and response normalization |
//! | [`store`] | Single-file SQLite store: schema, search, caches |
//! | [`contextualizer`] | Per-chunk context prefixes via LLM slots |
//! | [`spell`] | Vocabulary-based typo correction |
//! | [`expander`] | LLM query expansion with drift filtering |
//! | [`searcher`] | Hybrid retrieval: parallel subqueries, RRF, blending |
//! | [`reranker`] | Cross-encoder reranking with persistent cache |
//! | [`indexer`] | Scan, change detection, and orchestration |
//! | [`shutdown`] | Cooperative cancellation flag |

pub mod chunker;
pub mod config;
pub mod contextualizer;
pub mod embedding;
pub mod expander;
pub mod hash;
pub mod indexer;
pub mod llm;
pub mod reranker;
pub mod searcher;
pub mod shutdown;
pub mod spell;
pub mod store;
