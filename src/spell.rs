//! Vocabulary-based typo correction.
//!
//! Query terms are checked against the indexed FTS vocabulary and replaced
//! when a close neighbor (edit distance 1 or 2) exists. Corrections only run
//! once the index is big enough to have a trustworthy vocabulary; quoted
//! phrases, short tokens, numbers, and path-like tokens are left alone.

use anyhow::Result;
use std::collections::HashMap;

use crate::store::Store;

/// Minimum vocabulary size before corrections are attempted.
const MIN_VOCAB_TERMS: usize = 100;
/// Maximum accepted edit distance.
const MAX_DISTANCE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub original: String,
    pub replacement: String,
}

#[derive(Debug, Clone)]
pub struct SpellResult {
    pub corrected: String,
    pub corrections: Vec<Correction>,
}

pub struct SpellCorrector {
    /// term → document frequency.
    exact: HashMap<String, i64>,
    terms: Vec<(String, i64)>,
}

impl SpellCorrector {
    /// Build from the store's vocabulary. `None` when the index is too small
    /// for corrections to be meaningful.
    pub async fn from_store(store: &Store) -> Result<Option<Self>> {
        let terms = store.vocabulary().await?;
        if terms.len() < MIN_VOCAB_TERMS {
            return Ok(None);
        }
        Ok(Some(Self::from_terms(terms)))
    }

    fn from_terms(terms: Vec<(String, i64)>) -> Self {
        let exact = terms.iter().cloned().collect();
        Self { exact, terms }
    }

    /// Correct a query, preserving quoted phrases verbatim.
    pub fn correct(&self, query: &str) -> SpellResult {
        let mut corrected = String::with_capacity(query.len());
        let mut corrections = Vec::new();

        for token in tokenize(query) {
            if !corrected.is_empty() {
                corrected.push(' ');
            }
            match token {
                Token::Phrase(p) => {
                    corrected.push('"');
                    corrected.push_str(&p);
                    corrected.push('"');
                }
                Token::Word(w) => match self.correct_token(&w) {
                    Some(replacement) => {
                        corrections.push(Correction {
                            original: w,
                            replacement: replacement.clone(),
                        });
                        corrected.push_str(&replacement);
                    }
                    None => corrected.push_str(&w),
                },
            }
        }

        SpellResult {
            corrected,
            corrections,
        }
    }

    fn correct_token(&self, token: &str) -> Option<String> {
        if should_skip(token) {
            return None;
        }
        let lowered = token.to_lowercase();
        if self.exact.contains_key(&lowered) {
            return None;
        }

        let mut best: Option<(usize, i64, &str)> = None;
        for (term, freq) in &self.terms {
            if lowered.len() > 3 && term.len() > 3 {
                let (a, b) = (lowered.chars().next(), term.chars().next());
                if a != b {
                    continue;
                }
            }
            // Length difference alone bounds the distance.
            if lowered.len().abs_diff(term.len()) > MAX_DISTANCE {
                continue;
            }
            if let Some(d) = bounded_edit_distance(&lowered, term, MAX_DISTANCE) {
                if d == 0 {
                    return None;
                }
                // Tuple order prefers the closest, then the most frequent,
                // then the lexicographically first.
                let candidate = (d, -*freq, term.as_str());
                if best.map(|b| candidate < b).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }

        best.filter(|(d, _, _)| (1..=MAX_DISTANCE).contains(d))
            .map(|(_, _, term)| term.to_string())
    }
}

#[derive(Debug)]
enum Token {
    Word(String),
    Phrase(String),
}

/// Split into words, keeping double-quoted phrases intact.
fn tokenize(query: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = query;
    while let Some(start) = rest.find('"') {
        let before = &rest[..start];
        tokens.extend(before.split_whitespace().map(|w| Token::Word(w.to_string())));
        match rest[start + 1..].find('"') {
            Some(end) => {
                let phrase = &rest[start + 1..start + 1 + end];
                if !phrase.trim().is_empty() {
                    tokens.push(Token::Phrase(phrase.to_string()));
                }
                rest = &rest[start + end + 2..];
            }
            None => {
                // Unterminated quote: treat the remainder as plain words.
                rest = &rest[start + 1..];
                tokens.extend(rest.split_whitespace().map(|w| Token::Word(w.to_string())));
                return tokens;
            }
        }
    }
    tokens.extend(rest.split_whitespace().map(|w| Token::Word(w.to_string())));
    tokens
}

/// Tokens that must never be "corrected".
fn should_skip(token: &str) -> bool {
    token.chars().count() <= 2
        || token.chars().all(|c| c.is_ascii_digit())
        || token.contains('/')
        || token.contains('\\')
        || token.contains('.')
}

/// Levenshtein distance capped at `cap`. Returns `None` when the distance
/// exceeds the cap; rows whose minimum already exceeds it end the search
/// early.
fn bounded_edit_distance(a: &str, b: &str, cap: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > cap {
        return None;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > cap {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let d = prev[b.len()];
    (d <= cap).then_some(d)
}
