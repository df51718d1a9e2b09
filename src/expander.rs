//! LLM query expansion: keyword variants, semantic variants, and a
//! hypothetical answer (HyDE).
//!
//! A structured chat call asks for `{lex: [..], vec: [..], hyde: ".."}`.
//! Candidates that drift from the original query are filtered out: a variant
//! must keep a majority of the original's meaningful terms (a strict 0.8 for
//! short queries, 0.5 otherwise) and every numeric token. The hypothetical
//! answer is only accepted at a plausible length. Failures degrade, first to
//! a HyDE-only attempt and then to no expansion at all; a search never fails
//! because expansion did.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::Result;
use lru::LruCache;
use tracing::debug;

use crate::config::{ExpandConfig, LlmSlot};
use crate::llm::{first_json_object, LlmClient};

/// Words ignored when measuring query overlap.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "does", "for", "from", "how",
    "i", "in", "into", "is", "it", "my", "of", "on", "or", "that", "the", "this", "to", "was",
    "what", "when", "where", "which", "who", "why", "will", "with",
];

const MIN_HYDE_CHARS: usize = 20;
const MAX_HYDE_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Keyword-optimized variants, routed to BM25 only.
    pub lex: Vec<String>,
    /// Semantic rephrasings, routed to vector search only.
    pub vec: Vec<String>,
    /// Hypothetical answer, embedded for semantic retrieval.
    pub hyde: Option<String>,
}

impl Expansion {
    pub fn is_empty(&self) -> bool {
        self.lex.is_empty() && self.vec.is_empty() && self.hyde.is_none()
    }
}

pub struct QueryExpander {
    llm: LlmClient,
    slot: Option<LlmSlot>,
    enabled: bool,
    max_tokens: u32,
    cache: Mutex<LruCache<String, Expansion>>,
}

impl QueryExpander {
    pub fn new(config: &ExpandConfig, slot: Option<LlmSlot>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            llm: LlmClient::new(60)?,
            slot,
            enabled: config.enabled,
            max_tokens: config.max_tokens,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.slot.is_some()
    }

    /// Expand a query. Short queries and failures yield an empty expansion.
    pub async fn expand(&self, query: &str, context_hints: &[String]) -> Expansion {
        if !self.is_enabled() || meaningful_terms(query).len() < 2 {
            return Expansion::default();
        }

        let cache_key = format!("{query} | {}", context_hints.join(","));
        if let Some(hit) = self
            .cache
            .lock()
            .expect("expansion cache poisoned")
            .get(&cache_key)
            .cloned()
        {
            return hit;
        }

        let Some(slot) = self.slot.as_ref() else {
            return Expansion::default();
        };
        let expansion = match self.expand_structured(slot, query, context_hints).await {
            Ok(expansion) => expansion,
            Err(e) => {
                debug!("structured expansion failed ({e}); falling back to HyDE only");
                self.expand_hyde_only(slot, query).await
            }
        };

        self.cache
            .lock()
            .expect("expansion cache poisoned")
            .put(cache_key, expansion.clone());
        expansion
    }

    async fn expand_structured(
        &self,
        slot: &LlmSlot,
        query: &str,
        context_hints: &[String],
    ) -> Result<Expansion> {
        let prompt = structured_prompt(query, context_hints);
        let response = self.llm.complete(slot, &prompt, self.max_tokens, 0.3).await?;
        let object = first_json_object(&response)
            .ok_or_else(|| anyhow::anyhow!("expansion response had no JSON object"))?;

        let take_strings = |key: &str| -> Vec<String> {
            object
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .take(2)
                        .collect()
                })
                .unwrap_or_default()
        };

        let lex: Vec<String> = take_strings("lex")
            .into_iter()
            .filter(|v| passes_drift_filter(query, v))
            .collect();
        let vec: Vec<String> = take_strings("vec")
            .into_iter()
            .filter(|v| passes_drift_filter(query, v))
            .collect();
        let hyde = object
            .get("hyde")
            .and_then(|v| v.as_str())
            .filter(|s| (MIN_HYDE_CHARS..=MAX_HYDE_CHARS).contains(&s.chars().count()))
            .map(str::to_string);

        Ok(Expansion { lex, vec, hyde })
    }

    async fn expand_hyde_only(&self, slot: &LlmSlot, query: &str) -> Expansion {
        let prompt = format!(
            "Write a short factual paragraph (2-3 sentences) that would answer \
             this search query, as if quoted from a personal note:\n\n{query}"
        );
        let hyde = match self.llm.complete(slot, &prompt, self.max_tokens, 0.3).await {
            Ok(text) => {
                let trimmed = text.trim().to_string();
                ((MIN_HYDE_CHARS..=MAX_HYDE_CHARS).contains(&trimmed.chars().count()))
                    .then_some(trimmed)
            }
            Err(e) => {
                debug!("HyDE fallback failed: {e}");
                None
            }
        };
        Expansion {
            lex: Vec::new(),
            vec: Vec::new(),
            hyde,
        }
    }
}

fn structured_prompt(query: &str, context_hints: &[String]) -> String {
    let hints = if context_hints.is_empty() {
        String::new()
    } else {
        format!("\nRecent context: {}\n", context_hints.join("; "))
    };
    format!(
        "You rewrite search queries over a personal Markdown note archive.\n\
         Query: {query}\n{hints}\n\
         Respond with one JSON object, no other text:\n\
         {{\"lex\": [two keyword-optimized variants], \
           \"vec\": [two semantic rephrasings], \
           \"hyde\": \"a 2-3 sentence hypothetical answer\"}}\n\
         Keep every number and identifier from the query in each variant."
    )
}

/// Lowercased non-stopword terms.
fn meaningful_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// A variant passes when it keeps enough of the original's meaningful terms
/// (0.8 for queries of up to three terms, 0.5 beyond) and every numeric
/// token.
fn passes_drift_filter(original: &str, candidate: &str) -> bool {
    let orig_terms = meaningful_terms(original);
    if orig_terms.is_empty() {
        return true;
    }
    let cand_terms: HashSet<String> = meaningful_terms(candidate).into_iter().collect();

    let kept = orig_terms.iter().filter(|t| cand_terms.contains(*t)).count();
    let overlap = kept as f64 / orig_terms.len() as f64;
    let threshold = if orig_terms.len() <= 3 { 0.8 } else { 0.5 };
    if overlap < threshold {
        return false;
    }

    orig_terms
        .iter()
        .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
        .all(|n| cand_terms.contains(n))
}
