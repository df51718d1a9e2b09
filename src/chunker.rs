//! Markdown-aware chunker.
//!
//! Splits a document into retrieval units that respect heading structure: a
//! top-three-level heading (`#`, `##`, `###`) always starts a fresh chunk,
//! and within a section lines accumulate until the token budget is exceeded,
//! carrying a configurable overlap tail into the next chunk. Each chunk
//! records its 1-based line span, the heading it sits under, and the distinct
//! headings that occur inside it.
//!
//! Embedded base64 data URIs are collapsed to the literal token `[image]`
//! before splitting so a single pasted screenshot cannot swallow the entire
//! token budget.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::ChunkConfig;

/// Token estimator signature. The default approximates one token per three
/// characters, which tracks the embedding service's tokenizer closely enough
/// for budgeting.
pub type TokenCounter = dyn Fn(&str) -> usize + Send + Sync;

/// Default estimator: ceil(chars / 3).
pub fn approx_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}

/// Splitting options. `file_path` switches on the metadata prefix.
pub struct ChunkOptions<'a> {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub min_chunk_chars: usize,
    pub token_counter: Option<&'a TokenCounter>,
    pub file_path: Option<&'a Path>,
}

impl<'a> ChunkOptions<'a> {
    pub fn from_config(config: &ChunkConfig, file_path: Option<&'a Path>) -> Self {
        Self {
            max_tokens: config.max_tokens,
            overlap_tokens: config.overlap_tokens,
            min_chunk_chars: config.min_chunk_chars,
            token_counter: None,
            file_path,
        }
    }
}

/// One split unit, prior to embedding.
#[derive(Debug, Clone)]
pub struct DocChunk {
    /// Chunk text, including the metadata prefix when a file path was given.
    pub content: String,
    /// 1-based first line of the chunk in the source document.
    pub line_start: usize,
    /// 1-based last line (inclusive).
    pub line_end: usize,
    /// The heading this chunk sits under, if any.
    pub header: Option<String>,
    /// Distinct headings occurring inside the chunk, order of first occurrence.
    pub headings: Vec<String>,
}

fn data_uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"data:[A-Za-z0-9.+/-]+;base64,[A-Za-z0-9+/=]+").unwrap()
    })
}

/// Collapse embedded base64 data URIs to the literal token `[image]`.
pub fn strip_data_uris(text: &str) -> String {
    data_uri_re().replace_all(text, "[image]").into_owned()
}

fn session_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"session-(\d{4}-\d{2}-\d{2})").unwrap())
}

/// Heading line at level 1-3. These are hard chunk boundaries.
fn is_boundary_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    for level in ["# ", "## ", "### "] {
        if trimmed.starts_with(level) {
            return true;
        }
    }
    matches!(trimmed, "#" | "##" | "###")
}

/// Any heading line, for the in-chunk heading list.
fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if rest.is_empty() {
        return None;
    }
    rest.strip_prefix(' ').map(str::trim).filter(|t| !t.is_empty())
}

/// Metadata prefix for a chunk of `file_path`.
///
/// `session-YYYY-MM-DD` file names carry their date into the prefix so
/// date-constrained queries can match on keywords alone.
fn metadata_prefix(file_path: &Path) -> String {
    let basename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(caps) = session_date_re().captures(&basename) {
        format!("[Date: {}] [Source: {}]\n\n", &caps[1], basename)
    } else {
        format!("[Source: {}]\n\n", basename)
    }
}

struct BufferedLine {
    number: usize,
    text: String,
    tokens: usize,
}

/// Split a Markdown document into chunks.
pub fn chunk_markdown(text: &str, opts: &ChunkOptions) -> Vec<DocChunk> {
    let default_counter: &TokenCounter = &approx_token_count;
    let counter = opts.token_counter.unwrap_or(default_counter);
    let cleaned = data_uri_re().replace_all(text, "[image]");
    let prefix = opts.file_path.map(metadata_prefix);

    let mut chunks: Vec<DocChunk> = Vec::new();
    let mut buffer: Vec<BufferedLine> = Vec::new();
    let mut buffer_tokens = 0usize;
    let mut current_header: Option<String> = None;

    let mut flush = |buffer: &mut Vec<BufferedLine>,
                     buffer_tokens: &mut usize,
                     header: &Option<String>,
                     keep_overlap: bool,
                     overlap_budget: usize|
     -> Option<Vec<BufferedLine>> {
        if buffer.is_empty() {
            return None;
        }
        let content: String = buffer
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if content.trim().chars().count() >= opts.min_chunk_chars {
            let mut headings = Vec::new();
            for line in buffer.iter() {
                if let Some(h) = heading_text(&line.text) {
                    if !headings.iter().any(|seen: &String| seen == h) {
                        headings.push(h.to_string());
                    }
                }
            }
            chunks.push(DocChunk {
                content,
                line_start: buffer.first().map(|l| l.number).unwrap_or(1),
                line_end: buffer.last().map(|l| l.number).unwrap_or(1),
                header: header.clone(),
                headings,
            });
        }

        let seed = if keep_overlap && overlap_budget > 0 {
            // Walk back from the tail while the overlap budget holds.
            let mut taken = 0usize;
            let mut start = buffer.len();
            while start > 0 && taken + buffer[start - 1].tokens <= overlap_budget {
                taken += buffer[start - 1].tokens;
                start -= 1;
            }
            if start < buffer.len() {
                Some(buffer.split_off(start))
            } else {
                None
            }
        } else {
            None
        };

        buffer.clear();
        *buffer_tokens = 0;
        seed
    };

    for (idx, raw_line) in cleaned.lines().enumerate() {
        let number = idx + 1;
        if is_boundary_heading(raw_line) {
            flush(&mut buffer, &mut buffer_tokens, &current_header, false, 0);
            current_header = heading_text(raw_line).map(str::to_string);
        }

        let tokens = counter(raw_line);
        buffer.push(BufferedLine {
            number,
            text: raw_line.to_string(),
            tokens,
        });
        buffer_tokens += tokens;

        if buffer_tokens > opts.max_tokens && !is_boundary_heading(raw_line) {
            if let Some(seed) = flush(
                &mut buffer,
                &mut buffer_tokens,
                &current_header,
                true,
                opts.overlap_tokens,
            ) {
                buffer_tokens = seed.iter().map(|l| l.tokens).sum();
                buffer = seed;
            }
        }
    }
    flush(&mut buffer, &mut buffer_tokens, &current_header, false, 0);

    if let Some(prefix) = prefix {
        for chunk in &mut chunks {
            chunk.content = format!("{}{}", prefix, chunk.content);
        }
    }

    chunks
}
