//! LLM relevance scorers for reranking.
//!
//! Each scorer asks a chat model to rate how relevant a snippet is to the
//! query on a 0–1 scale and parses the first number in the reply. Calls
//! are made once, without retries: the reranker fails open, so a failed
//! call only leaves that candidate unscored.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use grepctl_core::rerank::Scorer;

use crate::config::RerankConfig;
use crate::embedding::send_with_retry;

const SYSTEM_PROMPT: &str = "You judge search results. Given a query and a document \
snippet, reply with a single number between 0 and 1 for how relevant the snippet is to \
the query, where 1 means it directly answers the query and 0 means it is unrelated. \
Reply with the number only.";

fn user_prompt(query: &str, snippet: &str) -> String {
    format!("Query: {}\n\nSnippet:\n{}\n\nRelevance (0-1):", query, snippet)
}

/// First decimal number in `reply`, sign included, e.g. `"Score: 0.8"` → `0.8`.
pub fn parse_score(reply: &str) -> Result<f64> {
    let bytes = reply.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let starts_number = bytes[i].is_ascii_digit()
            || (bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit));
        if starts_number {
            let end = reply[i..]
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .map(|n| i + n)
                .unwrap_or(reply.len());
            let start = if i > 0 && bytes[i - 1] == b'-' { i - 1 } else { i };
            let token = reply[start..end].trim_end_matches('.');
            return token
                .parse::<f64>()
                .map_err(|e| anyhow!("unparseable score '{}': {}", token, e));
        }
        i += 1;
    }
    bail!("no score in model reply: '{}'", reply.trim())
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Scorer using the OpenAI chat completions API.
pub struct OpenAIScorer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAIScorer {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("rerank.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or("https://api.openai.com/v1");
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl Scorer for OpenAIScorer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, snippet: &str) -> Result<f64> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": 8,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(query, snippet)},
            ],
        });
        let json =
            send_with_retry(&self.client, &self.url, Some(&self.api_key), &body, 0, "OpenAI")
                .await?;
        let reply = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?;
        parse_score(reply)
    }
}

/// Scorer using a local Ollama instance (`POST /api/generate`).
pub struct OllamaScorer {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaScorer {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("rerank.model required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or("http://localhost:11434");
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            model,
        })
    }
}

#[async_trait]
impl Scorer for OllamaScorer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, snippet: &str) -> Result<f64> {
        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": user_prompt(query, snippet),
            "stream": false,
            "options": {"temperature": 0},
        });
        let json = send_with_retry(&self.client, &self.url, None, &body, 0, "Ollama").await?;
        let reply = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response text"))?;
        parse_score(reply)
    }
}

/// Create the configured scorer, or `None` when reranking is disabled.
pub fn create_scorer(config: &RerankConfig) -> Result<Option<Arc<dyn Scorer>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIScorer::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaScorer::new(config)?))),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    #[test]
    fn test_parse_score_plain() {
        assert_eq!(parse_score("0.75").unwrap(), 0.75);
        assert_eq!(parse_score("1").unwrap(), 1.0);
        assert_eq!(parse_score(".5").unwrap(), 0.5);
    }

    #[test]
    fn test_parse_score_with_prose() {
        assert_eq!(parse_score("Relevance: 0.8.").unwrap(), 0.8);
        assert_eq!(parse_score("  I'd say 0.25 overall").unwrap(), 0.25);
    }

    #[test]
    fn test_parse_score_out_of_range_is_returned_raw() {
        // Clamping happens in the reranker.
        assert_eq!(parse_score("7").unwrap(), 7.0);
    }

    #[test]
    fn test_parse_score_keeps_sign() {
        assert_eq!(parse_score("-0.4").unwrap(), -0.4);
        assert_eq!(parse_score("Score: -.5").unwrap(), -0.5);
    }

    #[test]
    fn test_parse_score_rejects_no_number() {
        assert!(parse_score("highly relevant").is_err());
        assert!(parse_score("").is_err());
    }

    #[test]
    fn test_disabled_scorer_is_none() {
        assert!(create_scorer(&RerankConfig::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ollama_scorer_parses_reply() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async { Json(serde_json::json!({"response": "0.9", "done": true})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let scorer = OllamaScorer::new(&RerankConfig {
            provider: "ollama".to_string(),
            model: Some("llama3".to_string()),
            url: Some(format!("http://{}", addr)),
            ..Default::default()
        })
        .unwrap();
        let score = scorer.score("rust", "a snippet about rust").await.unwrap();
        assert!((score - 0.9).abs() < 1e-9);
    }
}
