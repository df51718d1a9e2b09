//! Single-file SQLite store for files, chunks, collections, sessions, the
//! full-text index, vector rows, and the on-disk caches.
//!
//! Schema is created on open and evolved by additive, idempotent migrations:
//! adding a column that already exists is silently ignored, any other DDL
//! failure logs and degrades (most notably the `vec0` vector table, which is
//! optional — without it nearest-neighbor queries fall back to a linear
//! cosine scan over the stored embedding blobs).
//!
//! Writes follow a single-writer discipline. Re-indexing a file replaces its
//! chunk set atomically: one transaction upserts the file row, refreshes
//! collection links, deletes prior chunks with their FTS/vector mirrors, and
//! inserts the new generation. Rowid equality between a chunk row, its FTS
//! row, and its vector row is an invariant.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

/// BM25 column weights: content, filename, path_tokens, headings.
const FTS_WEIGHTS: (f64, f64, f64, f64) = (1.0, 4.0, 2.0, 3.0);

pub struct Store {
    pool: SqlitePool,
    vss_enabled: bool,
    dims: usize,
}

/// A source document row.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub mtime: i64,
    pub content_hash: String,
    pub indexed_at: i64,
    pub virtual_path: Option<String>,
}

/// A stored chunk, joined with its owning file's path.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub chunk_index: i64,
    pub content: String,
    pub line_start: i64,
    pub line_end: i64,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub context_prefix: Option<String>,
    pub observation_type: Option<String>,
    pub concepts: Vec<String>,
    pub referenced_files: Vec<String>,
    pub session_id: Option<String>,
}

/// Capture-session tag.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub started_at: i64,
    pub project_path: String,
    pub summary: Option<String>,
    pub capture_count: i64,
    pub prompt_count: i64,
}

/// Searchable metadata mirrored into the FTS row alongside chunk content.
#[derive(Debug, Clone, Default)]
pub struct FtsMeta {
    pub filename: String,
    pub path_tokens: String,
    pub headings: String,
}

/// Optional observation metadata attached to a chunk.
#[derive(Debug, Clone)]
pub struct Observation {
    pub observation_type: String,
    pub concepts: Vec<String>,
    pub referenced_files: Vec<String>,
}

/// A chunk ready for insertion.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub content: String,
    pub line_start: i64,
    pub line_end: i64,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub context_prefix: Option<String>,
    pub observation: Option<Observation>,
    pub session_id: Option<String>,
    pub fts: FtsMeta,
}

/// Everything persisted for one file in a single transaction.
#[derive(Debug, Clone)]
pub struct FilePersist {
    pub path: String,
    pub mtime: i64,
    pub content_hash: String,
    pub virtual_path: Option<String>,
    pub collections: Vec<String>,
    pub chunks: Vec<NewChunk>,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Store {
    /// Open (creating if missing) the database at `config.index_path`,
    /// run migrations, and probe the vector extension.
    pub async fn open(config: &StoreConfig, dims: usize) -> Result<Self> {
        if let Some(parent) = config.index_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}", config.index_path.display()))?
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let mut store = Self {
            pool,
            vss_enabled: false,
            dims,
        };
        store.migrate().await?;
        store.vss_enabled = store.probe_vss().await;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ============ Schema ============

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                mtime INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                indexed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                UNIQUE(file_id, chunk_index),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_collections (
                file_id INTEGER NOT NULL,
                collection_id INTEGER NOT NULL,
                PRIMARY KEY (file_id, collection_id),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
                FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                project_path TEXT NOT NULL,
                summary TEXT,
                capture_count INTEGER NOT NULL DEFAULT 0,
                prompt_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_embedding_cache (
                query TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS context_cache (
                key TEXT PRIMARY KEY,
                context TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rerank_cache (
                query_hash TEXT NOT NULL,
                doc_key TEXT NOT NULL,
                model_tag TEXT NOT NULL,
                score REAL NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (query_hash, doc_key, model_tag)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // FTS5 is not idempotent natively, check first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE chunks_fts USING fts5(
                    content,
                    filename,
                    path_tokens,
                    headings,
                    tokenize='porter unicode61'
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_path ON files(path)")
            .execute(&self.pool)
            .await?;

        // Additive migrations. Columns introduced after the initial schema;
        // re-adding is a no-op.
        for ddl in [
            "ALTER TABLE files ADD COLUMN virtual_path TEXT",
            "ALTER TABLE chunks ADD COLUMN context_prefix TEXT",
            "ALTER TABLE chunks ADD COLUMN observation_type TEXT",
            "ALTER TABLE chunks ADD COLUMN concepts TEXT",
            "ALTER TABLE chunks ADD COLUMN referenced_files TEXT",
            "ALTER TABLE chunks ADD COLUMN session_id TEXT",
        ] {
            self.add_column_if_missing(ddl).await;
        }

        Ok(())
    }

    async fn add_column_if_missing(&self, ddl: &str) {
        if let Err(e) = sqlx::query(ddl).execute(&self.pool).await {
            let msg = e.to_string();
            if !msg.contains("duplicate column name") {
                warn!("migration `{ddl}` failed: {msg}");
            }
        }
    }

    /// Try to create the `vec0` virtual table. Absent the extension this
    /// fails and every nearest-neighbor query takes the linear-scan path.
    async fn probe_vss(&self) -> bool {
        let ddl = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(embedding float[{}])",
            self.dims
        );
        match sqlx::query(&ddl).execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                debug!("vector extension unavailable ({e}); using linear scan");
                false
            }
        }
    }

    pub fn is_vss_enabled(&self) -> bool {
        self.vss_enabled
    }

    /// Repopulate the vector virtual table from the chunks table.
    /// No-op when the extension is unavailable.
    pub async fn rebuild_vss(&self) -> Result<u64> {
        if !self.vss_enabled {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vec_chunks").execute(&mut *tx).await?;
        let rows = sqlx::query("SELECT id, embedding FROM chunks")
            .fetch_all(&mut *tx)
            .await?;
        let mut inserted = 0u64;
        for row in &rows {
            let id: i64 = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            sqlx::query("INSERT INTO vec_chunks(rowid, embedding) VALUES (?, ?)")
                .bind(id)
                .bind(&blob)
                .execute(&mut *tx)
                .await?;
            inserted += 1;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    // ============ Files ============

    pub async fn get_file(&self, path: &str) -> Result<Option<FileRow>> {
        let row = sqlx::query(
            "SELECT id, path, mtime, content_hash, indexed_at, virtual_path FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| file_from_row(&r)))
    }

    pub async fn get_all_files(&self) -> Result<Vec<FileRow>> {
        let rows = sqlx::query(
            "SELECT id, path, mtime, content_hash, indexed_at, virtual_path FROM files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    pub async fn upsert_file(
        &self,
        path: &str,
        mtime: i64,
        content_hash: &str,
        virtual_path: Option<&str>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO files (path, mtime, content_hash, indexed_at, virtual_path)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at,
                virtual_path = excluded.virtual_path
            "#,
        )
        .bind(path)
        .bind(mtime)
        .bind(content_hash)
        .bind(now_ts())
        .bind(virtual_path)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Delete a file and, by cascade plus explicit mirror cleanup, its chunks.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let Some(file) = self.get_file(path).await? else {
            return Ok(false);
        };
        let mut tx = self.pool.begin().await?;
        delete_chunk_mirrors_tx(&mut tx, file.id, self.vss_enabled).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ============ Collections ============

    pub async fn upsert_collection(&self, name: &str) -> Result<i64> {
        sqlx::query("INSERT INTO collections (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM collections WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn add_file_to_collection(&self, file_id: i64, collection_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_collections (file_id, collection_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(file_id)
        .bind(collection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_file_collections(&self, file_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM file_collections WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear and re-establish a file's collection memberships.
    pub async fn set_file_collections(&self, file_id: i64, names: &[String]) -> Result<()> {
        self.clear_file_collections(file_id).await?;
        for name in names {
            let collection_id = self.upsert_collection(name).await?;
            self.add_file_to_collection(file_id, collection_id).await?;
        }
        Ok(())
    }

    pub async fn get_files_by_collection(&self, name: &str) -> Result<Vec<FileRow>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.path, f.mtime, f.content_hash, f.indexed_at, f.virtual_path
            FROM files f
            JOIN file_collections fc ON fc.file_id = f.id
            JOIN collections c ON c.id = fc.collection_id
            WHERE c.name = ?
            ORDER BY f.path
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    // ============ Sessions ============

    pub async fn upsert_session(&self, session: &SessionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, started_at, project_path, summary, capture_count, prompt_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_path = excluded.project_path,
                summary = excluded.summary,
                capture_count = excluded.capture_count,
                prompt_count = excluded.prompt_count
            "#,
        )
        .bind(&session.id)
        .bind(session.started_at)
        .bind(&session.project_path)
        .bind(&session.summary)
        .bind(session.capture_count)
        .bind(session.prompt_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query(
            "SELECT id, started_at, project_path, summary, capture_count, prompt_count FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SessionRow {
            id: r.get("id"),
            started_at: r.get("started_at"),
            project_path: r.get("project_path"),
            summary: r.get("summary"),
            capture_count: r.get("capture_count"),
            prompt_count: r.get("prompt_count"),
        }))
    }

    pub async fn bump_session_counters(&self, id: &str, captures: i64, prompts: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET capture_count = capture_count + ?, prompt_count = prompt_count + ? WHERE id = ?",
        )
        .bind(captures)
        .bind(prompts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Chunks ============

    /// Persist one indexed file atomically: upsert the file row, refresh its
    /// collection links, drop the prior chunk generation (with FTS and vector
    /// mirrors), and insert the new one. Returns the file id and new chunk ids.
    pub async fn persist_indexed_file(&self, record: &FilePersist) -> Result<(i64, Vec<i64>)> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (path, mtime, content_hash, indexed_at, virtual_path)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at,
                virtual_path = excluded.virtual_path
            "#,
        )
        .bind(&record.path)
        .bind(record.mtime)
        .bind(&record.content_hash)
        .bind(now_ts())
        .bind(&record.virtual_path)
        .execute(&mut *tx)
        .await?;

        let file_id: i64 = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(&record.path)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM file_collections WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        for name in &record.collections {
            sqlx::query(
                "INSERT INTO collections (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(name)
            .bind(now_ts())
            .execute(&mut *tx)
            .await?;
            let collection_id: i64 = sqlx::query_scalar("SELECT id FROM collections WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO file_collections (file_id, collection_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(file_id)
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;
        }

        delete_chunk_mirrors_tx(&mut tx, file_id, self.vss_enabled).await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        let mut chunk_ids = Vec::with_capacity(record.chunks.len());
        for chunk in &record.chunks {
            let blob = vec_to_blob(&chunk.embedding);
            let concepts = chunk
                .observation
                .as_ref()
                .map(|o| serde_json::to_string(&o.concepts))
                .transpose()?;
            let refs = chunk
                .observation
                .as_ref()
                .map(|o| serde_json::to_string(&o.referenced_files))
                .transpose()?;
            let obs_type = chunk.observation.as_ref().map(|o| o.observation_type.clone());

            let result = sqlx::query(
                r#"
                INSERT INTO chunks (
                    file_id, chunk_index, content, line_start, line_end, embedding,
                    content_hash, context_prefix, observation_type, concepts,
                    referenced_files, session_id
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.line_start)
            .bind(chunk.line_end)
            .bind(&blob)
            .bind(&chunk.content_hash)
            .bind(&chunk.context_prefix)
            .bind(&obs_type)
            .bind(&concepts)
            .bind(&refs)
            .bind(&chunk.session_id)
            .execute(&mut *tx)
            .await?;
            let chunk_id = result.last_insert_rowid();

            // FTS content carries the context prefix so a search can hit
            // the generated summary as well as the literal text.
            let fts_content = match &chunk.context_prefix {
                Some(prefix) if !prefix.is_empty() => format!("{}\n{}", prefix, chunk.content),
                _ => chunk.content.clone(),
            };
            sqlx::query(
                "INSERT INTO chunks_fts (rowid, content, filename, path_tokens, headings) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(&fts_content)
            .bind(&chunk.fts.filename)
            .bind(&chunk.fts.path_tokens)
            .bind(&chunk.fts.headings)
            .execute(&mut *tx)
            .await?;

            if self.vss_enabled {
                sqlx::query("INSERT INTO vec_chunks(rowid, embedding) VALUES (?, ?)")
                    .bind(chunk_id)
                    .bind(&blob)
                    .execute(&mut *tx)
                    .await?;
            }

            chunk_ids.push(chunk_id);
        }

        tx.commit().await?;
        Ok((file_id, chunk_ids))
    }

    /// Remove a file's chunks and their mirrors without touching the file row.
    pub async fn delete_chunks_for_file(&self, file_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        delete_chunk_mirrors_tx(&mut tx, file_id, self.vss_enabled).await?;
        let result = sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn get_chunk_by_id(&self, id: i64) -> Result<Option<ChunkRow>> {
        let row = sqlx::query(&format!("{CHUNK_SELECT} WHERE c.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| chunk_from_row(&r)))
    }

    pub async fn get_chunks_by_ids(&self, ids: &[i64]) -> Result<Vec<ChunkRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("{CHUNK_SELECT} WHERE c.id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Neighboring chunks of the same file, within `range` of the given
    /// chunk's index (the chunk itself included), ordered by chunk index.
    pub async fn get_surrounding_chunks(&self, id: i64, range: i64) -> Result<Vec<ChunkRow>> {
        let Some(center) = self.get_chunk_by_id(id).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "{CHUNK_SELECT} WHERE c.file_id = ? AND c.chunk_index BETWEEN ? AND ? ORDER BY c.chunk_index"
        ))
        .bind(center.file_id)
        .bind(center.chunk_index - range)
        .bind(center.chunk_index + range)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    pub async fn get_all_chunks(&self) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(&format!("{CHUNK_SELECT} ORDER BY c.id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Delete chunks whose file row is gone, plus FTS/vector rows whose
    /// chunk is gone. Returns the number of rows removed.
    pub async fn sweep_orphans(&self) -> Result<u64> {
        let mut removed = 0u64;
        let mut tx = self.pool.begin().await?;
        let r = sqlx::query("DELETE FROM chunks WHERE file_id NOT IN (SELECT id FROM files)")
            .execute(&mut *tx)
            .await?;
        removed += r.rows_affected();
        let r = sqlx::query("DELETE FROM chunks_fts WHERE rowid NOT IN (SELECT id FROM chunks)")
            .execute(&mut *tx)
            .await?;
        removed += r.rows_affected();
        if self.vss_enabled {
            let r = sqlx::query("DELETE FROM vec_chunks WHERE rowid NOT IN (SELECT id FROM chunks)")
                .execute(&mut *tx)
                .await?;
            removed += r.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    // ============ Full-text search ============

    /// Strict BM25 search: quoted phrases verbatim, remaining tokens ANDed.
    /// Returns (chunk id, bm25 score) with higher scores better.
    pub async fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let Some(match_expr) = build_match_query(query, false) else {
            return Ok(Vec::new());
        };
        self.run_fts(&match_expr, limit).await
    }

    /// Fuzzy fallback: same tokens ORed. Used when strict matching is empty.
    pub async fn search_fts_fuzzy(&self, query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let Some(match_expr) = build_match_query(query, true) else {
            return Ok(Vec::new());
        };
        self.run_fts(&match_expr, limit).await
    }

    async fn run_fts(&self, match_expr: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        let (w_content, w_filename, w_path, w_headings) = FTS_WEIGHTS;
        let sql = format!(
            "SELECT rowid, bm25(chunks_fts, {w_content}, {w_filename}, {w_path}, {w_headings}) AS score
             FROM chunks_fts WHERE chunks_fts MATCH ? ORDER BY score LIMIT ?"
        );
        let rows = match sqlx::query(&sql)
            .bind(match_expr)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                // A degenerate query string is a user input problem, not a
                // pipeline failure.
                debug!("fts query `{match_expr}` failed: {e}");
                return Ok(Vec::new());
            }
        };
        // bm25() is smaller-is-better and negative; flip to positive.
        Ok(rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("rowid");
                let score: f64 = row.get("score");
                (id, -score)
            })
            .collect())
    }

    /// Indexed vocabulary: lowercased terms with their chunk frequency.
    /// Unstemmed (unlike the FTS tokens) so typo correction maps onto real
    /// words.
    pub async fn vocabulary(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT content FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for row in &rows {
            let content: String = row.get("content");
            let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
            for token in content.split(|c: char| !c.is_alphanumeric()) {
                if token.chars().count() < 3 {
                    continue;
                }
                let term = token.to_lowercase();
                if seen.insert(term.clone()) {
                    *counts.entry(term).or_insert(0) += 1;
                }
            }
        }
        let mut vocab: Vec<(String, i64)> = counts.into_iter().collect();
        vocab.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(vocab)
    }

    // ============ Vector search ============

    /// Nearest neighbors by cosine distance: (chunk id, distance), closest
    /// first. Uses the vector virtual table when present, otherwise a linear
    /// scan over stored blobs.
    pub async fn search_vss(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<(i64, f64)>> {
        if self.vss_enabled {
            let blob = vec_to_blob(query_embedding);
            let rows = sqlx::query(
                "SELECT rowid, distance FROM vec_chunks WHERE embedding MATCH ? AND k = ? ORDER BY distance",
            )
            .bind(&blob)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            return Ok(rows
                .iter()
                .map(|row| (row.get::<i64, _>("rowid"), row.get::<f64, _>("distance")))
                .collect());
        }

        let rows = sqlx::query("SELECT id, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        let mut scored: Vec<(i64, f64)> = rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let distance = 1.0 - cosine_similarity(query_embedding, &vec) as f64;
                (id, distance)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    // ============ Caches ============

    pub async fn get_cached_query_embedding(&self, query: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM query_embedding_cache WHERE query = ?")
                .bind(query)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    pub async fn put_cached_query_embedding(&self, query: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_embedding_cache (query, embedding, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(query) DO UPDATE SET
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(query)
        .bind(vec_to_blob(embedding))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn prune_query_cache(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = now_ts() - max_age_secs;
        let r = sqlx::query("DELETE FROM query_embedding_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }

    pub async fn get_context(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT context FROM context_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn put_context(&self, key: &str, context: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO context_cache (key, context, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                context = excluded.context,
                created_at = excluded.created_at
            "#,
        )
        .bind(key)
        .bind(context)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn prune_context_cache(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = now_ts() - max_age_secs;
        let r = sqlx::query("DELETE FROM context_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }

    pub async fn get_rerank_score(
        &self,
        query_hash: &str,
        doc_key: &str,
        model_tag: &str,
    ) -> Result<Option<f64>> {
        Ok(sqlx::query_scalar(
            "SELECT score FROM rerank_cache WHERE query_hash = ? AND doc_key = ? AND model_tag = ?",
        )
        .bind(query_hash)
        .bind(doc_key)
        .bind(model_tag)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn put_rerank_score(
        &self,
        query_hash: &str,
        doc_key: &str,
        model_tag: &str,
        score: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rerank_cache (query_hash, doc_key, model_tag, score, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(query_hash, doc_key, model_tag) DO UPDATE SET
                score = excluded.score,
                created_at = excluded.created_at
            "#,
        )
        .bind(query_hash)
        .bind(doc_key)
        .bind(model_tag)
        .bind(score)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn prune_rerank_cache(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = now_ts() - max_age_secs;
        let r = sqlx::query("DELETE FROM rerank_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}

const CHUNK_SELECT: &str = r#"
    SELECT c.id, c.file_id, f.path AS file_path, c.chunk_index, c.content,
           c.line_start, c.line_end, c.embedding, c.content_hash,
           c.context_prefix, c.observation_type, c.concepts,
           c.referenced_files, c.session_id
    FROM chunks c
    JOIN files f ON f.id = c.file_id
"#;

async fn delete_chunk_mirrors_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    file_id: i64,
    vss_enabled: bool,
) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)")
        .bind(file_id)
        .execute(&mut **tx)
        .await?;
    if vss_enabled {
        sqlx::query("DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)")
            .bind(file_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> FileRow {
    FileRow {
        id: row.get("id"),
        path: row.get("path"),
        mtime: row.get("mtime"),
        content_hash: row.get("content_hash"),
        indexed_at: row.get("indexed_at"),
        virtual_path: row.get("virtual_path"),
    }
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> ChunkRow {
    let blob: Vec<u8> = row.get("embedding");
    let concepts: Option<String> = row.get("concepts");
    let refs: Option<String> = row.get("referenced_files");
    ChunkRow {
        id: row.get("id"),
        file_id: row.get("file_id"),
        file_path: row.get("file_path"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        line_start: row.get("line_start"),
        line_end: row.get("line_end"),
        embedding: blob_to_vec(&blob),
        content_hash: row.get("content_hash"),
        context_prefix: row.get("context_prefix"),
        observation_type: row.get("observation_type"),
        concepts: parse_json_list(concepts.as_deref()),
        referenced_files: parse_json_list(refs.as_deref()),
        session_id: row.get("session_id"),
    }
}

fn parse_json_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

/// Build an FTS5 MATCH expression. Quoted phrases are preserved verbatim;
/// remaining tokens are required (`AND`) in strict mode, alternatives (`OR`)
/// in fuzzy mode. Returns `None` when nothing searchable remains.
fn build_match_query(query: &str, fuzzy: bool) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut rest = String::new();
    let mut in_phrase = false;
    let mut phrase = String::new();

    for ch in query.chars() {
        match (ch, in_phrase) {
            ('"', false) => in_phrase = true,
            ('"', true) => {
                let p = phrase.trim();
                if !p.is_empty() {
                    parts.push(format!("\"{}\"", p.replace('"', "")));
                }
                phrase.clear();
                in_phrase = false;
            }
            (_, true) => phrase.push(ch),
            (_, false) => rest.push(ch),
        }
    }
    if in_phrase && !phrase.trim().is_empty() {
        rest.push(' ');
        rest.push_str(&phrase);
    }

    for token in rest.split_whitespace() {
        let clean: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !clean.is_empty() {
            parts.push(format!("\"{clean}\""));
        }
    }

    if parts.is_empty() {
        return None;
    }
    let joiner = if fuzzy { " OR " } else { " AND " };
    Some(parts.join(joiner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> Store {
        let config = StoreConfig {
            index_path: tmp.path().join("index.db"),
        };
        Store::open(&config, 4).await.unwrap()
    }

    fn chunk(index: i64, content: &str, embedding: Vec<f32>) -> NewChunk {
        NewChunk {
            chunk_index: index,
            content: content.to_string(),
            line_start: index * 10 + 1,
            line_end: index * 10 + 5,
            embedding,
            content_hash: crate::hash::content_hash(content),
            context_prefix: None,
            observation: None,
            session_id: None,
            fts: FtsMeta {
                filename: "note.md".to_string(),
                path_tokens: "notes note".to_string(),
                headings: String::new(),
            },
        }
    }

    fn persist(path: &str, chunks: Vec<NewChunk>) -> FilePersist {
        FilePersist {
            path: path.to_string(),
            mtime: 1000,
            content_hash: "hash0".to_string(),
            virtual_path: None,
            collections: vec!["notes".to_string()],
            chunks,
        }
    }

    #[tokio::test]
    async fn test_open_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            index_path: tmp.path().join("index.db"),
        };
        let store = Store::open(&config, 4).await.unwrap();
        store.close().await;
        // Second open runs the same migrations over the existing schema.
        Store::open(&config, 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let embedding = vec![0.5f32, 0.5, 0.5, 0.5];
        let record = persist(
            "/notes/a.md",
            vec![chunk(0, "The quick brown fox jumps over the lazy dog", embedding.clone())],
        );
        let (_, ids) = store.persist_indexed_file(&record).await.unwrap();
        assert_eq!(ids.len(), 1);

        let row = store.get_chunk_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.content, "The quick brown fox jumps over the lazy dog");
        assert_eq!(row.line_start, 1);
        assert_eq!(row.line_end, 5);
        assert_eq!(row.embedding, embedding);
        assert_eq!(row.file_path, "/notes/a.md");
    }

    #[tokio::test]
    async fn test_reindex_replaces_chunks_atomically() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![
                chunk(0, "first generation chunk zero", vec![1.0, 0.0, 0.0, 0.0]),
                chunk(1, "first generation chunk one", vec![0.0, 1.0, 0.0, 0.0]),
            ],
        );
        store.persist_indexed_file(&record).await.unwrap();

        let record2 = persist(
            "/notes/a.md",
            vec![chunk(0, "second generation only chunk", vec![0.0, 0.0, 1.0, 0.0])],
        );
        let (file_id, ids) = store.persist_indexed_file(&record2).await.unwrap();
        assert_eq!(ids.len(), 1);

        let all = store.get_all_chunks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_id, file_id);
        assert_eq!(all[0].content, "second generation only chunk");

        // FTS mirror reflects only the new generation.
        let hits = store.search_fts("generation", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, ids[0]);
    }

    #[tokio::test]
    async fn test_fts_exact_phrase_ranks_first() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        for (i, text) in [
            "TypeScript generics enable reusable typed components",
            "Python decorators for caching and memoization",
            "Rust ownership model prevents memory leaks",
        ]
        .iter()
        .enumerate()
        {
            let record = persist(&format!("/notes/{i}.md"), vec![chunk(0, text, vec![0.0; 4])]);
            store.persist_indexed_file(&record).await.unwrap();
        }

        let hits = store.search_fts("\"TypeScript generics\"", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let top = store.get_chunk_by_id(hits[0].0).await.unwrap().unwrap();
        assert!(top.content.contains("TypeScript"));
    }

    #[tokio::test]
    async fn test_fts_strict_and_fuzzy() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![chunk(0, "deployment checklist for kubernetes clusters", vec![0.0; 4])],
        );
        store.persist_indexed_file(&record).await.unwrap();

        // Strict AND requires every term.
        assert!(store
            .search_fts("kubernetes gardening", 10)
            .await
            .unwrap()
            .is_empty());
        // Fuzzy OR matches on any.
        assert_eq!(
            store.search_fts_fuzzy("kubernetes gardening", 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_vss_linear_scan_ordering() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![
                chunk(0, "chunk pointing along the x axis direction", vec![1.0, 0.0, 0.0, 0.0]),
                chunk(1, "chunk pointing along the y axis direction", vec![0.0, 1.0, 0.0, 0.0]),
            ],
        );
        let (_, ids) = store.persist_indexed_file(&record).await.unwrap();

        let hits = store.search_vss(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, ids[0]);
        assert!(hits[0].1 < hits[1].1);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_zero_corpus_vector_search() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![
                chunk(0, "all zero embedding chunk number zero", vec![0.0; 4]),
                chunk(1, "all zero embedding chunk number one", vec![0.0; 4]),
            ],
        );
        store.persist_indexed_file(&record).await.unwrap();

        let hits = store.search_vss(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        for (_, distance) in hits {
            // Zero vectors are orthogonal-by-convention: distance 1, score 0.
            assert!((distance - 1.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_delete_file_cascades() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![chunk(0, "content that will be deleted with its file", vec![0.0; 4])],
        );
        store.persist_indexed_file(&record).await.unwrap();

        assert!(store.delete_file("/notes/a.md").await.unwrap());
        assert_eq!(store.count_chunks().await.unwrap(), 0);
        assert!(store.search_fts("deleted", 10).await.unwrap().is_empty());
        assert!(!store.delete_file("/notes/a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_collections_refresh_on_reindex() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let mut record = persist(
            "/notes/a.md",
            vec![chunk(0, "a chunk that belongs to the notes collection", vec![0.0; 4])],
        );
        store.persist_indexed_file(&record).await.unwrap();
        assert_eq!(store.get_files_by_collection("notes").await.unwrap().len(), 1);

        record.collections = vec!["archive".to_string()];
        store.persist_indexed_file(&record).await.unwrap();
        assert!(store.get_files_by_collection("notes").await.unwrap().is_empty());
        assert_eq!(store.get_files_by_collection("archive").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_surrounding_chunks() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![
                chunk(0, "surrounding test chunk number zero here", vec![0.0; 4]),
                chunk(1, "surrounding test chunk number one here", vec![0.0; 4]),
                chunk(2, "surrounding test chunk number two here", vec![0.0; 4]),
                chunk(3, "surrounding test chunk number three here", vec![0.0; 4]),
            ],
        );
        let (_, ids) = store.persist_indexed_file(&record).await.unwrap();

        let around = store.get_surrounding_chunks(ids[1], 1).await.unwrap();
        let indexes: Vec<i64> = around.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_query_embedding_cache_roundtrip_and_prune() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert!(store.get_cached_query_embedding("q").await.unwrap().is_none());
        store
            .put_cached_query_embedding("q", &[0.1, 0.2, 0.3, 0.4])
            .await
            .unwrap();
        let cached = store.get_cached_query_embedding("q").await.unwrap().unwrap();
        assert_eq!(cached, vec![0.1, 0.2, 0.3, 0.4]);

        // A generous max age keeps the row; a negative one removes it.
        assert_eq!(store.prune_query_cache(3600).await.unwrap(), 0);
        assert_eq!(store.prune_query_cache(-10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rerank_cache_keyed_by_model_tag() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store.put_rerank_score("qh", "1:abc", "tag-a", 0.75).await.unwrap();
        assert_eq!(
            store.get_rerank_score("qh", "1:abc", "tag-a").await.unwrap(),
            Some(0.75)
        );
        // A different blend recipe misses.
        assert_eq!(store.get_rerank_score("qh", "1:abc", "tag-b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sessions() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let session = SessionRow {
            id: "sess-1".to_string(),
            started_at: 1234,
            project_path: "/work/project".to_string(),
            summary: None,
            capture_count: 0,
            prompt_count: 0,
        };
        store.upsert_session(&session).await.unwrap();
        store.bump_session_counters("sess-1", 2, 1).await.unwrap();
        let loaded = store.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(loaded.capture_count, 2);
        assert_eq!(loaded.prompt_count, 1);
    }

    #[tokio::test]
    async fn test_vocabulary_populated() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let record = persist(
            "/notes/a.md",
            vec![chunk(
                0,
                "authentication tokens require rotation and careful storage",
                vec![0.0; 4],
            )],
        );
        store.persist_indexed_file(&record).await.unwrap();
        let vocab = store.vocabulary().await.unwrap();
        assert!(vocab.iter().any(|(t, _)| t == "authentication"));
        // Short tokens are excluded.
        assert!(vocab.iter().all(|(t, _)| t.chars().count() >= 3));
    }

    #[test]
    fn test_build_match_query_phrases_and_tokens() {
        let q = build_match_query("error \"connection refused\" docker", false).unwrap();
        assert!(q.contains("\"connection refused\""));
        assert!(q.contains("\"error\""));
        assert!(q.contains(" AND "));

        let q = build_match_query("alpha beta", true).unwrap();
        assert_eq!(q, "\"alpha\" OR \"beta\"");

        assert!(build_match_query("   ", false).is_none());
        // FTS operator characters are stripped from bare tokens.
        let q = build_match_query("a* NEAR(x)", false).unwrap();
        assert!(!q.contains('*'));
        assert!(!q.contains('('));
    }
}
