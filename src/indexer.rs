//! Indexing orchestration: scan → change detection → chunk → contextualize
//! → embed → persist.
//!
//! Scanning and change detection run with bounded concurrency and touch the
//! store read-only; all writes happen afterwards on the single logical
//! writer, one transaction per file. A file whose mtime is unchanged only
//! refreshes its collection memberships; an unchanged content hash updates
//! the file row and skips re-chunking; everything else is re-chunked,
//! optionally contextualized, embedded centrally, and persisted atomically.
//!
//! A cooperative [`Shutdown`] flag halts new work at per-file boundaries.
//! Dry-run reports what would happen without writing anything.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunker::{chunk_markdown, ChunkOptions, DocChunk};
use crate::config::{ChunkConfig, IndexConfig, SourceRoot};
use crate::contextualizer::Contextualizer;
use crate::embedding::EmbeddingClient;
use crate::hash::{content_hash, virtual_path};
use crate::shutdown::Shutdown;
use crate::store::{FilePersist, FtsMeta, NewChunk, Store};

pub struct Indexer {
    store: Arc<Store>,
    embedder: Arc<EmbeddingClient>,
    contextualizer: Option<Arc<Contextualizer>>,
    chunking: ChunkConfig,
    config: IndexConfig,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Delete file rows whose paths were not encountered during the scan.
    pub prune: bool,
    /// Report counts without mutating the store.
    pub dry_run: bool,
}

/// Counters for one index run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub empty: usize,
    pub embed_errors: usize,
    pub errors: usize,
}

/// Progress messages, sent best-effort over an optional channel.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    ScanStarted { root: PathBuf },
    FileIndexed { path: String, chunks: usize },
    FileSkipped { path: String },
    FilePruned { path: String },
    FileFailed { path: String, message: String },
    Done,
}

/// A file that needs (re)indexing, carried between pipeline phases.
struct PendingFile {
    path: String,
    virtual_path: String,
    collection: String,
    mtime: i64,
    content_hash: String,
    content: String,
    chunks: Vec<DocChunk>,
    prefixes: Vec<String>,
}

enum ScanDecision {
    /// mtime unchanged: refresh memberships only.
    SkipFresh { file_id: i64, path: String, collection: String },
    /// Content unchanged under a new mtime: update the file row.
    SkipSameContent {
        path: String,
        virtual_path: String,
        collection: String,
        mtime: i64,
        content_hash: String,
    },
    /// No chunk survived the minimum length: drop existing chunks.
    Empty {
        path: String,
        virtual_path: String,
        collection: String,
        mtime: i64,
        content_hash: String,
    },
    Index(PendingFile),
    Failed { path: String, message: String },
}

impl Indexer {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<EmbeddingClient>,
        contextualizer: Option<Arc<Contextualizer>>,
        chunking: ChunkConfig,
        config: IndexConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            contextualizer,
            chunking,
            config,
        }
    }

    pub async fn run(
        &self,
        options: &IndexOptions,
        shutdown: &Shutdown,
        progress: Option<&UnboundedSender<IndexEvent>>,
    ) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let ignores = build_globset(&self.config.ignore_globs)?;

        // Enumerate candidate files across all source roots.
        let mut seen_paths: HashSet<String> = HashSet::new();
        let mut candidates: Vec<(PathBuf, PathBuf, String)> = Vec::new();
        for source in &self.config.sources {
            emit(progress, IndexEvent::ScanStarted {
                root: source.root.clone(),
            });
            for (abs, rel) in scan_markdown_files(source, &ignores)? {
                let key = abs.to_string_lossy().to_string();
                if seen_paths.insert(key) {
                    candidates.push((abs, rel, source.collection.clone()));
                }
            }
        }
        report.scanned = candidates.len();
        info!("scan found {} markdown files", report.scanned);

        // Change detection, bounded concurrency, store reads only.
        let decisions: Vec<ScanDecision> = stream::iter(
            candidates
                .into_iter()
                .map(|(abs, rel, collection)| self.decide(abs, rel, collection)),
        )
        .buffered(self.config.scan_concurrency.max(1))
        .collect()
        .await;

        if options.dry_run {
            for decision in &decisions {
                match decision {
                    ScanDecision::Index(p) => {
                        debug!("would index {} ({} chunks)", p.path, p.chunks.len());
                        report.indexed += 1;
                    }
                    ScanDecision::Empty { .. } => report.empty += 1,
                    ScanDecision::Failed { .. } => report.errors += 1,
                    _ => report.skipped += 1,
                }
            }
            if options.prune {
                let keep: HashSet<&str> = decisions.iter().filter_map(decision_path).collect();
                for file in self.store.get_all_files().await? {
                    if !keep.contains(file.path.as_str()) {
                        report.deleted += 1;
                    }
                }
            }
            return Ok(report);
        }

        // Apply skips and collect pending work on the single writer.
        let mut pending: Vec<PendingFile> = Vec::new();
        let mut encountered: HashSet<String> = HashSet::new();
        for decision in decisions {
            if shutdown.is_triggered() {
                warn!("index run cancelled during skip processing");
                return Ok(report);
            }
            match decision {
                ScanDecision::SkipFresh {
                    file_id,
                    path,
                    collection,
                } => {
                    encountered.insert(path.clone());
                    self.store
                        .set_file_collections(file_id, std::slice::from_ref(&collection))
                        .await?;
                    report.skipped += 1;
                    emit(progress, IndexEvent::FileSkipped { path });
                }
                ScanDecision::SkipSameContent {
                    path,
                    virtual_path,
                    collection,
                    mtime,
                    content_hash,
                } => {
                    encountered.insert(path.clone());
                    let file_id = self
                        .store
                        .upsert_file(&path, mtime, &content_hash, Some(&virtual_path))
                        .await?;
                    self.store
                        .set_file_collections(file_id, std::slice::from_ref(&collection))
                        .await?;
                    report.skipped += 1;
                    emit(progress, IndexEvent::FileSkipped { path });
                }
                ScanDecision::Empty {
                    path,
                    virtual_path,
                    collection,
                    mtime,
                    content_hash,
                } => {
                    encountered.insert(path.clone());
                    let file_id = self
                        .store
                        .upsert_file(&path, mtime, &content_hash, Some(&virtual_path))
                        .await?;
                    self.store.delete_chunks_for_file(file_id).await?;
                    self.store
                        .set_file_collections(file_id, std::slice::from_ref(&collection))
                        .await?;
                    report.empty += 1;
                    emit(progress, IndexEvent::FileSkipped { path });
                }
                ScanDecision::Index(p) => {
                    encountered.insert(p.path.clone());
                    pending.push(p);
                }
                ScanDecision::Failed { path, message } => {
                    report.errors += 1;
                    emit(progress, IndexEvent::FileFailed { path, message });
                }
            }
        }

        if options.prune {
            for file in self.store.get_all_files().await? {
                if !encountered.contains(&file.path) {
                    self.store.delete_file(&file.path).await?;
                    report.deleted += 1;
                    emit(progress, IndexEvent::FilePruned { path: file.path });
                }
            }
        }

        if pending.is_empty() || shutdown.is_triggered() {
            emit(progress, IndexEvent::Done);
            return Ok(report);
        }

        // Context prefixes, bounded file-level concurrency.
        if let Some(contextualizer) = self.contextualizer.as_ref().filter(|c| c.is_enabled()) {
            let file_concurrency = contextualizer_concurrency(contextualizer);
            pending = stream::iter(pending.into_iter().map(|mut file| {
                let contextualizer = Arc::clone(contextualizer);
                let store = Arc::clone(&self.store);
                async move {
                    let chunk_texts: Vec<String> =
                        file.chunks.iter().map(|c| c.content.clone()).collect();
                    match contextualizer
                        .contextualize(&store, &file.content, &chunk_texts)
                        .await
                    {
                        Ok(prefixes) => file.prefixes = prefixes,
                        Err(e) => {
                            warn!("contextualization failed for {}: {e}", file.path);
                            file.prefixes = vec![String::new(); file.chunks.len()];
                        }
                    }
                    file
                }
            }))
            .buffered(file_concurrency)
            .collect()
            .await;
        } else {
            for file in &mut pending {
                file.prefixes = vec![String::new(); file.chunks.len()];
            }
        }

        if shutdown.is_triggered() {
            emit(progress, IndexEvent::Done);
            return Ok(report);
        }

        // Centralized embedding over every pending chunk, context prefix
        // prepended before the document marker.
        let mut embed_inputs: Vec<String> = Vec::new();
        for file in &pending {
            for (chunk, prefix) in file.chunks.iter().zip(&file.prefixes) {
                embed_inputs.push(if prefix.is_empty() {
                    chunk.content.clone()
                } else {
                    format!("{prefix}\n\n{}", chunk.content)
                });
            }
        }
        let outcome = match self.embedder.embed_documents(&embed_inputs, shutdown).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Cancellation or a terminal endpoint failure: nothing was
                // persisted for the pending files, so the next run retries.
                warn!("embedding aborted: {e}");
                report.errors += pending.len();
                emit(progress, IndexEvent::Done);
                return Ok(report);
            }
        };
        report.embed_errors = outcome.failed;
        let mut vectors = outcome.vectors.into_iter();

        // Persist, one transaction per file.
        for file in pending {
            let embeddings: Vec<Vec<f32>> =
                (&mut vectors).take(file.chunks.len()).collect();
            if shutdown.is_triggered() {
                warn!("index run cancelled before persisting {}", file.path);
                break;
            }
            if embeddings.len() != file.chunks.len() {
                report.errors += 1;
                emit(progress, IndexEvent::FileFailed {
                    path: file.path.clone(),
                    message: "embedding output truncated".to_string(),
                });
                continue;
            }
            match self.persist_file(&file, embeddings).await {
                Ok(chunk_count) => {
                    report.indexed += 1;
                    emit(progress, IndexEvent::FileIndexed {
                        path: file.path.clone(),
                        chunks: chunk_count,
                    });
                }
                Err(e) => {
                    report.errors += 1;
                    emit(progress, IndexEvent::FileFailed {
                        path: file.path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        emit(progress, IndexEvent::Done);
        Ok(report)
    }

    /// Classify one candidate file without writing anything.
    async fn decide(&self, abs: PathBuf, rel: PathBuf, collection: String) -> ScanDecision {
        let path = abs.to_string_lossy().to_string();
        let vpath = virtual_path(&collection, &rel);

        let metadata = match tokio::fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) => {
                return ScanDecision::Failed {
                    path,
                    message: format!("stat failed: {e}"),
                }
            }
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let existing = match self.store.get_file(&path).await {
            Ok(row) => row,
            Err(e) => {
                return ScanDecision::Failed {
                    path,
                    message: format!("store lookup failed: {e}"),
                }
            }
        };

        if let Some(file) = &existing {
            if file.mtime == mtime {
                return ScanDecision::SkipFresh {
                    file_id: file.id,
                    path,
                    collection,
                };
            }
        }

        let content = match tokio::fs::read_to_string(&abs).await {
            Ok(c) => c,
            Err(e) => {
                return ScanDecision::Failed {
                    path,
                    message: format!("read failed: {e}"),
                }
            }
        };
        let hash = content_hash(&content);

        if let Some(file) = &existing {
            if file.content_hash == hash {
                return ScanDecision::SkipSameContent {
                    path,
                    virtual_path: vpath,
                    collection,
                    mtime,
                    content_hash: hash,
                };
            }
        }

        let chunk_opts = ChunkOptions::from_config(&self.chunking, Some(abs.as_path()));
        let chunks = chunk_markdown(&content, &chunk_opts);
        if chunks.is_empty() {
            return ScanDecision::Empty {
                path,
                virtual_path: vpath,
                collection,
                mtime,
                content_hash: hash,
            };
        }

        ScanDecision::Index(PendingFile {
            path,
            virtual_path: vpath,
            collection,
            mtime,
            content_hash: hash,
            content,
            chunks,
            prefixes: Vec::new(),
        })
    }

    async fn persist_file(&self, file: &PendingFile, embeddings: Vec<Vec<f32>>) -> Result<usize> {
        let filename = Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path_tokens = path_tokens(&file.path);

        let chunks: Vec<NewChunk> = file
            .chunks
            .iter()
            .zip(file.prefixes.iter())
            .zip(embeddings)
            .enumerate()
            .map(|(i, ((chunk, prefix), embedding))| {
                let mut headings = chunk.headings.clone();
                if let Some(header) = &chunk.header {
                    if !headings.contains(header) {
                        headings.insert(0, header.clone());
                    }
                }
                NewChunk {
                    chunk_index: i as i64,
                    content: chunk.content.clone(),
                    line_start: chunk.line_start as i64,
                    line_end: chunk.line_end as i64,
                    embedding,
                    content_hash: content_hash(&chunk.content),
                    context_prefix: (!prefix.is_empty()).then(|| prefix.clone()),
                    observation: None,
                    session_id: None,
                    fts: FtsMeta {
                        filename: filename.clone(),
                        path_tokens: path_tokens.clone(),
                        headings: headings.join(" "),
                    },
                }
            })
            .collect();
        let count = chunks.len();

        let record = FilePersist {
            path: file.path.clone(),
            mtime: file.mtime,
            content_hash: file.content_hash.clone(),
            virtual_path: Some(file.virtual_path.clone()),
            collections: vec![file.collection.clone()],
            chunks,
        };
        self.store
            .persist_indexed_file(&record)
            .await
            .with_context(|| format!("persisting {}", file.path))?;
        Ok(count)
    }
}

fn contextualizer_concurrency(contextualizer: &Arc<Contextualizer>) -> usize {
    contextualizer.file_concurrency().max(1)
}

fn decision_path(decision: &ScanDecision) -> Option<&str> {
    match decision {
        ScanDecision::SkipFresh { path, .. }
        | ScanDecision::SkipSameContent { path, .. }
        | ScanDecision::Empty { path, .. }
        | ScanDecision::Failed { path, .. } => Some(path),
        ScanDecision::Index(p) => Some(&p.path),
    }
}

fn emit(progress: Option<&UnboundedSender<IndexEvent>>, event: IndexEvent) {
    if let Some(sender) = progress {
        let _ = sender.send(event);
    }
}

/// Walk one source root for `**/*.md` files, returning (absolute, relative)
/// pairs sorted for deterministic ordering.
fn scan_markdown_files(
    source: &SourceRoot,
    ignores: &GlobSet,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !source.root.exists() {
        anyhow::bail!("source root does not exist: {}", source.root.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(&source.root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().map(|e| e != "md").unwrap_or(true) {
            continue;
        }
        let rel = path.strip_prefix(&source.root).unwrap_or(path).to_path_buf();
        if ignores.is_match(&rel) {
            continue;
        }
        files.push((path.to_path_buf(), rel));
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Path components as space-separated tokens for the FTS index.
fn path_tokens(path: &str) -> String {
    Path::new(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .filter(|c| !c.is_empty() && c != "/" && c != "\\")
        .collect::<Vec<_>>()
        .join(" ")
}
