//! Chat-endpoint client shared by the contextualizer and the query expander.
//!
//! The upstream service answers in one of two shapes: an OpenAI-style
//! `choices[0].message.content` object or a bare `{response: "..."}`. Both
//! are normalized to a single string here, at the boundary, so downstream
//! code never inspects the union.

use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::LlmSlot;

pub struct LlmClient {
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    /// One chat completion against `slot`. Returns the normalized text.
    pub async fn complete(
        &self,
        slot: &LlmSlot,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": slot.model,
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut request = self.http.post(&slot.endpoint).json(&body);
        if let Some(key) = &slot.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("LLM endpoint error {status}: {body_text}");
        }

        let json: Value = response.json().await?;
        extract_text(&json)
            .ok_or_else(|| anyhow::anyhow!("LLM response had no recognizable text field"))
    }
}

/// Normalize the response union into one string.
fn extract_text(json: &Value) -> Option<String> {
    if let Some(content) = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Some(content.to_string());
    }
    if let Some(text) = json.pointer("/choices/0/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    json.get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// First well-formed JSON array embedded in `text`, if any.
///
/// Model output routinely wraps JSON in prose or code fences; scanning for a
/// balanced bracket run is more robust than trusting the whole body.
pub fn first_json_array(text: &str) -> Option<Vec<Value>> {
    first_balanced(text, '[', ']')
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .and_then(|v| v.as_array().cloned())
}

/// First well-formed JSON object embedded in `text`, if any.
pub fn first_json_object(text: &str) -> Option<Value> {
    first_balanced(text, '{', '}')
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .filter(Value::is_object)
}

fn first_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
