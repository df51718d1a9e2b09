//! End-to-end pipeline tests against a temp-dir store.
//!
//! No network: document chunks are inserted with handcrafted embeddings, and
//! query embeddings are injected through the persistent query-embedding
//! cache, which the embedding client consults before dialing out. The
//! embedding endpoint in these tests points at a dead port with a zero retry
//! budget, so an unexpected cache miss degrades instantly instead of
//! hanging.

use std::sync::Arc;

use memory_search::config::{Config, EmbeddingConfig, RerankConfig, SearchConfig, StoreConfig};
use memory_search::embedding::EmbeddingClient;
use memory_search::hash::{content_hash, rerank_doc_key, sha256_hex};
use memory_search::reranker::Reranker;
use memory_search::searcher::{Explain, SearchResult, Searcher, StageEvent};
use memory_search::store::{FilePersist, FtsMeta, NewChunk, Store};
use tempfile::TempDir;

const DIMS: usize = 4;

async fn open_store(tmp: &TempDir) -> Arc<Store> {
    let config = StoreConfig {
        index_path: tmp.path().join("index.db"),
    };
    Arc::new(Store::open(&config, DIMS).await.unwrap())
}

fn dead_embedder() -> Arc<EmbeddingClient> {
    let config = EmbeddingConfig {
        endpoint: "http://127.0.0.1:9/embed".to_string(),
        dims: DIMS,
        max_retries: 0,
        timeout_secs: 2,
        ..EmbeddingConfig::default()
    };
    Arc::new(EmbeddingClient::new(config).unwrap())
}

fn searcher(store: Arc<Store>, config: SearchConfig) -> Searcher {
    Searcher::new(store, dead_embedder(), None, None, config)
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

async fn seed_file(store: &Store, path: &str, content: &str, embedding: Vec<f32>) {
    let filename = path.rsplit('/').next().unwrap_or(path).to_string();
    let record = FilePersist {
        path: path.to_string(),
        mtime: 1_700_000_000,
        content_hash: content_hash(content),
        virtual_path: None,
        collections: vec!["notes".to_string()],
        chunks: vec![NewChunk {
            chunk_index: 0,
            content: content.to_string(),
            line_start: 1,
            line_end: 1,
            embedding,
            content_hash: content_hash(content),
            context_prefix: None,
            observation: None,
            session_id: None,
            fts: FtsMeta {
                filename,
                path_tokens: path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" "),
                headings: String::new(),
            },
        }],
    };
    store.persist_indexed_file(&record).await.unwrap();
}

async fn seed_language_corpus(store: &Store) {
    seed_file(
        store,
        "/notes/typescript.md",
        "TypeScript generics enable reusable typed components",
        normalize(vec![1.0, 0.0, 0.0, 0.0]),
    )
    .await;
    seed_file(
        store,
        "/notes/python.md",
        "Python decorators for caching and memoization",
        normalize(vec![0.0, 1.0, 0.0, 0.0]),
    )
    .await;
    seed_file(
        store,
        "/notes/rust.md",
        "Rust ownership model prevents memory leaks",
        normalize(vec![0.0, 0.0, 1.0, 0.0]),
    )
    .await;
}

// S1 — BM25 wins on the exact term.
#[tokio::test]
async fn test_bm25_wins_on_exact_term() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    seed_language_corpus(&store).await;

    let query = "TypeScript generics";
    store
        .put_cached_query_embedding(query, &normalize(vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();

    let outcome = searcher(Arc::clone(&store), SearchConfig::default())
        .search(query)
        .await
        .unwrap();

    let top = &outcome.results[0];
    assert_eq!(top.file, "/notes/typescript.md");
    assert_eq!(top.line_start, 1);
    assert_eq!(top.explain.bm25_rank, Some(1));
    assert_eq!(top.explain.retrieval_rank, 1);
}

// S2 — semantic retrieval wins over an orthogonal lexicon.
#[tokio::test]
async fn test_semantic_over_orthogonal_lexicon() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    seed_language_corpus(&store).await;

    // The query shares no keyword with the corpus; its embedding is
    // injected to sit on the Python chunk's axis.
    let query = "snake language closures";
    store
        .put_cached_query_embedding(query, &normalize(vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let outcome = searcher(Arc::clone(&store), SearchConfig::default())
        .search(query)
        .await
        .unwrap();

    let top = &outcome.results[0];
    assert_eq!(top.file, "/notes/python.md");
    assert!((top.explain.semantic_score - 1.0).abs() < 1e-9);
    assert_eq!(top.explain.bm25_score, 0.0);
}

// S3 — top-K limit honored, scores weakly decreasing.
#[tokio::test]
async fn test_top_k_limit_honored() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    for i in 0..10 {
        seed_file(
            &store,
            &format!("/notes/doc-{i}.md"),
            &format!("unrelated filler body for document number {i}"),
            normalize(vec![1.0, i as f32 * 0.35, 0.0, 0.0]),
        )
        .await;
    }

    let query = "vector ordering probe";
    store
        .put_cached_query_embedding(query, &normalize(vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();

    let config = SearchConfig {
        top_k: 3,
        ..SearchConfig::default()
    };
    let outcome = searcher(Arc::clone(&store), config).search(query).await.unwrap();

    assert_eq!(outcome.results.len(), 3);
    for pair in outcome.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for result in &outcome.results {
        assert!((0.0..=1.0).contains(&result.score));
    }
    // Most similar document first.
    assert_eq!(outcome.results[0].file, "/notes/doc-0.md");
}

// S4 — rerank disabled is the identity on retrieval order.
#[tokio::test]
async fn test_rerank_disabled_is_identity() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    seed_language_corpus(&store).await;

    let query = "TypeScript generics";
    store
        .put_cached_query_embedding(query, &normalize(vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();

    let config = SearchConfig {
        disable_rerank: true,
        ..SearchConfig::default()
    };
    // A reranker is wired in but must not run.
    let reranker = Reranker::new(RerankConfig {
        endpoint: "http://127.0.0.1:9/rerank".to_string(),
        ..RerankConfig::default()
    })
    .unwrap();
    let searcher = Searcher::new(
        Arc::clone(&store),
        dead_embedder(),
        None,
        Some(reranker),
        config,
    );
    let outcome = searcher.search(query).await.unwrap();

    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.explain.retrieval_rank, i + 1);
        assert!(result.explain.reranker_score.is_none());
    }
    assert!(outcome
        .stages
        .iter()
        .any(|s| matches!(s, StageEvent::RerankSkipped { .. })));
}

// The env switch drives the same flag.
#[test]
fn test_disable_rerank_env_override() {
    std::env::set_var("MEMORY_SEARCH_DISABLE_RERANK", "1");
    let config = Config::from_env().unwrap();
    std::env::remove_var("MEMORY_SEARCH_DISABLE_RERANK");
    assert!(config.search.disable_rerank);
}

// S5 — spell correction against a large vocabulary.
#[tokio::test]
async fn test_spell_correction_stage_and_result() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    for i in 0..110 {
        seed_file(
            &store,
            &format!("/notes/auth-{i}.md"),
            &format!("authentication rotation policy entry token{i:03}"),
            normalize(vec![0.1, 0.2, 0.3, 0.4]),
        )
        .await;
    }

    let outcome = searcher(Arc::clone(&store), SearchConfig::default())
        .search("autentication rotation")
        .await
        .unwrap();

    let corrected = outcome.stages.iter().find_map(|s| match s {
        StageEvent::Corrected {
            original,
            replacement,
        } => Some((original.clone(), replacement.clone())),
        _ => None,
    });
    let (original, replacement) = corrected.expect("expected a correction stage event");
    assert_eq!(original, "autentication");
    assert_eq!(replacement, "authentication");

    let top = &outcome.results[0];
    assert!(top.content.contains("authentication"));
}

// S6 — idempotent reindex: second run skips everything.
#[tokio::test]
async fn test_idempotent_reindex() {
    use memory_search::config::{ChunkConfig, IndexConfig, SourceRoot};
    use memory_search::indexer::{IndexOptions, Indexer};
    use memory_search::shutdown::Shutdown;

    let tmp = TempDir::new().unwrap();
    let notes = tmp.path().join("notes");
    std::fs::create_dir_all(&notes).unwrap();
    for i in 0..3 {
        std::fs::write(
            notes.join(format!("note-{i}.md")),
            format!("# Note {i}\n\nA body paragraph long enough to clear the minimum chunk length, number {i}."),
        )
        .unwrap();
    }

    let store = open_store(&tmp).await;
    let index_config = IndexConfig {
        sources: vec![SourceRoot {
            root: notes.clone(),
            collection: "notes".to_string(),
        }],
        ..IndexConfig::default()
    };
    let indexer = Indexer::new(
        Arc::clone(&store),
        dead_embedder(),
        None,
        ChunkConfig::default(),
        index_config,
    );

    let shutdown = Shutdown::new();
    let options = IndexOptions::default();
    let first = indexer.run(&options, &shutdown, None).await.unwrap();
    assert_eq!(first.scanned, 3);
    assert_eq!(first.indexed, 3);
    assert_eq!(first.skipped, 0);
    // The dead endpoint makes every chunk fall back to a zero vector.
    assert!(first.embed_errors > 0);

    let chunks_before: Vec<(i64, i64, String)> = store
        .get_all_chunks()
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.file_id, c.chunk_index, c.content_hash))
        .collect();
    let files_before: Vec<(String, i64, String)> = store
        .get_all_files()
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.mtime, f.content_hash))
        .collect();

    let second = indexer.run(&options, &shutdown, None).await.unwrap();
    assert_eq!(second.scanned, 3);
    assert_eq!(second.indexed, 0);
    assert_eq!(second.skipped, 3);

    let chunks_after: Vec<(i64, i64, String)> = store
        .get_all_chunks()
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.file_id, c.chunk_index, c.content_hash))
        .collect();
    let files_after: Vec<(String, i64, String)> = store
        .get_all_files()
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.mtime, f.content_hash))
        .collect();
    assert_eq!(chunks_before, chunks_after);
    assert_eq!(files_before, files_after);
}

// Indexer prune removes files that vanished from disk.
#[tokio::test]
async fn test_index_prune_removes_missing_files() {
    use memory_search::config::{ChunkConfig, IndexConfig, SourceRoot};
    use memory_search::indexer::{IndexOptions, Indexer};
    use memory_search::shutdown::Shutdown;

    let tmp = TempDir::new().unwrap();
    let notes = tmp.path().join("notes");
    std::fs::create_dir_all(&notes).unwrap();
    let keep = notes.join("keep.md");
    let gone = notes.join("gone.md");
    std::fs::write(&keep, "A note body that is long enough to clear the chunk minimum easily.").unwrap();
    std::fs::write(&gone, "Another note body that is long enough to clear the chunk minimum.").unwrap();

    let store = open_store(&tmp).await;
    let index_config = IndexConfig {
        sources: vec![SourceRoot {
            root: notes.clone(),
            collection: "notes".to_string(),
        }],
        ..IndexConfig::default()
    };
    let indexer = Indexer::new(
        Arc::clone(&store),
        dead_embedder(),
        None,
        ChunkConfig::default(),
        index_config,
    );
    let shutdown = Shutdown::new();

    indexer
        .run(&IndexOptions::default(), &shutdown, None)
        .await
        .unwrap();
    assert_eq!(store.get_all_files().await.unwrap().len(), 2);

    std::fs::remove_file(&gone).unwrap();
    let report = indexer
        .run(
            &IndexOptions {
                prune: true,
                dry_run: false,
            },
            &shutdown,
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);

    let files = store.get_all_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("keep.md"));
}

fn result_fixture(chunk_id: i64, rank: usize, score: f64) -> SearchResult {
    SearchResult {
        chunk_id,
        file: format!("/notes/{chunk_id}.md"),
        line_start: 1,
        line_end: 1,
        snippet: "snippet".to_string(),
        content: format!("document body {chunk_id}"),
        content_hash: format!("hash{chunk_id}"),
        score,
        explain: Explain {
            retrieval_rank: rank,
            bm25_rank: None,
            bm25_score: 0.0,
            semantic_score: 0.0,
            bm25_weight: 0.6,
            semantic_weight: 0.4,
            reranker_score: None,
            retrieval_weight: None,
            reranker_weight: None,
        },
    }
}

// A fully cached rerank never dials the endpoint.
#[tokio::test]
async fn test_rerank_cache_hit_avoids_endpoint() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let reranker = Reranker::new(RerankConfig {
        endpoint: "http://127.0.0.1:9/rerank".to_string(),
        timeout_secs: 2,
        ..RerankConfig::default()
    })
    .unwrap();

    let query = "cached query";
    let query_hash = sha256_hex(query.as_bytes());
    let results = vec![result_fixture(1, 1, 0.9), result_fixture(2, 2, 0.8)];
    for (result, score) in results.iter().zip([0.2, 0.9]) {
        let doc_key = rerank_doc_key(result.chunk_id, &result.content_hash);
        store
            .put_rerank_score(&query_hash, &doc_key, reranker.model_tag(), score)
            .await
            .unwrap();
    }

    let (reranked, applied) = reranker.rerank(&store, query, results).await;
    assert!(applied, "cached scores should be enough to rerank");

    // Rank 1-2 tier blends 0.95 retrieval / 0.05 reranker; cached scores
    // min-max to 0.0 and 1.0.
    let by_id = |id: i64| reranked.iter().find(|r| r.chunk_id == id).unwrap();
    assert!((by_id(1).score - 0.95 * 0.9).abs() < 1e-9);
    assert!((by_id(2).score - (0.95 * 0.8 + 0.05)).abs() < 1e-9);
    assert_eq!(by_id(1).explain.retrieval_weight, Some(0.95));
    assert_eq!(by_id(1).explain.reranker_weight, Some(0.05));
}

// An unreachable rerank endpoint leaves retrieval order unchanged.
#[tokio::test]
async fn test_rerank_endpoint_failure_keeps_order() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let reranker = Reranker::new(RerankConfig {
        endpoint: "http://127.0.0.1:9/rerank".to_string(),
        timeout_secs: 2,
        ..RerankConfig::default()
    })
    .unwrap();

    let results = vec![result_fixture(1, 1, 0.9), result_fixture(2, 2, 0.8)];
    let (reranked, applied) = reranker.rerank(&store, "uncached query", results).await;
    assert!(!applied);
    assert_eq!(reranked[0].chunk_id, 1);
    assert_eq!(reranked[1].chunk_id, 2);
    assert_eq!(reranked[0].score, 0.9);
    assert!(reranked[0].explain.reranker_score.is_none());
}
