//! Content hashing and virtual-path encoding.
//!
//! Every piece of indexed text is identified by its SHA-256 hex digest:
//! file contents for change detection, chunk contents for cache keys, and
//! composite digests for the context and rerank caches. Virtual paths give
//! files a stable `memory://<collection>/<relative>` address that survives
//! moving a source root between machines.

use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content hash of a text body.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Cache key for a generated context prefix.
///
/// The document and chunk contents are joined by a NUL byte so that the pair
/// ("ab", "c") never collides with ("a", "bc").
pub fn context_cache_key(doc_content: &str, chunk_content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_content.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk_content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rerank-cache document key: `{chunkId}:{contentHash}`.
pub fn rerank_doc_key(chunk_id: i64, chunk_content_hash: &str) -> String {
    format!("{}:{}", chunk_id, chunk_content_hash)
}

/// Encode a collection-relative location as `memory://<collection>/<relative>`.
///
/// The relative path is normalized to forward slashes so the address is
/// identical across platforms.
pub fn virtual_path(collection: &str, relative: &Path) -> String {
    let rel = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("memory://{}/{}", collection, rel)
}

/// Split a `memory://` address into (collection, relative) parts.
///
/// Returns `None` for anything that is not a well-formed virtual path.
pub fn parse_virtual_path(vpath: &str) -> Option<(&str, &str)> {
    let rest = vpath.strip_prefix("memory://")?;
    let (collection, relative) = rest.split_once('/')?;
    if collection.is_empty() || relative.is_empty() {
        return None;
    }
    Some((collection, relative))
}
