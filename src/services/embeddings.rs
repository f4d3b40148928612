//! Embedding client: text in, fixed-dimension vector out.
//!
//! Wraps a Gemini-style embedContent endpoint. Ingestion embeds with the
//! SEMANTIC_SIMILARITY task type, search queries with RETRIEVAL_QUERY.
//! Oversized inputs are truncated client-side; a vector whose length does
//! not match the configured dimensions is an error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::retry::{retry_with_policy, RetryClass, RetryPolicy};

/// Inputs longer than this are truncated before embedding.
pub const MAX_EMBED_CHARS: usize = 60_000;

/// Minimum meaningful input length.
const MIN_EMBED_CHARS: usize = 10;

/// Task type selector for the embedding endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Used for every ingested document.
    SemanticSimilarity,
    /// Used for search queries.
    RetrievalQuery,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SemanticSimilarity => "SEMANTIC_SIMILARITY",
            TaskType::RetrievalQuery => "RETRIEVAL_QUERY",
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("text too short to embed ({0} chars)")]
    TextTooShort(usize),
    #[error("expected {expected} dimensions, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    fn retry_class(&self) -> RetryClass {
        match self {
            EmbeddingError::Connection(_) | EmbeddingError::Api(_) => RetryClass::Retryable,
            EmbeddingError::RateLimited(delay) => RetryClass::RetryAfter(*delay),
            _ => RetryClass::Fatal,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

/// Client for the embedding endpoint.
pub struct EmbeddingClient {
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(api_key: &str, model: &str, dimensions: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimensions,
            client,
            retry_policy: RetryPolicy::new(3, Duration::from_secs(4), Duration::from_secs(60)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a text with the given task type.
    pub async fn embed(&self, text: &str, task_type: TaskType) -> Result<Vec<f32>, EmbeddingError> {
        let trimmed = text.trim();
        if trimmed.len() < MIN_EMBED_CHARS {
            return Err(EmbeddingError::TextTooShort(trimmed.len()));
        }

        let input = if trimmed.len() > MAX_EMBED_CHARS {
            warn!(
                "Embedding input of {} chars exceeds {}, truncating",
                trimmed.len(),
                MAX_EMBED_CHARS
            );
            truncate_chars(trimmed, MAX_EMBED_CHARS)
        } else {
            trimmed
        };

        let vector = retry_with_policy(
            &self.retry_policy,
            EmbeddingError::retry_class,
            |_attempt| async move {
                let url = format!("{}/models/{}:embedContent", self.endpoint, self.model);
                let request = EmbedRequest {
                    model: format!("models/{}", self.model),
                    content: EmbedContent {
                        parts: vec![EmbedPart {
                            text: input.to_string(),
                        }],
                    },
                    task_type: task_type.as_str(),
                };

                let response = self
                    .client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| EmbeddingError::Connection(e.to_string()))?;

                let status = response.status();
                if status.as_u16() == 429 {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    return Err(EmbeddingError::RateLimited(Duration::from_secs(retry_after)));
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(EmbeddingError::Api(format!(
                        "HTTP {status}: {}",
                        body.chars().take(300).collect::<String>()
                    )));
                }

                let parsed: EmbedResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::Api(format!("invalid response: {e}")))?;
                Ok(parsed.embedding.values)
            },
        )
        .await?;

        if vector.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        debug!(
            "Generated {}-dimension embedding (input {} chars, task {})",
            vector.len(),
            input.len(),
            task_type.as_str()
        );
        Ok(vector)
    }

    /// Embed a search query with the RETRIEVAL_QUERY task type.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(query, TaskType::RetrievalQuery).await
    }
}

/// Combine metadata, summary and full text into one embedding input. The
/// summary is preferred; full text fills whatever budget remains.
pub fn prepare_text_for_embedding(
    summary: Option<&str>,
    full_text: Option<&str>,
    metadata: &[(&str, Option<&str>)],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    for (key, value) in metadata {
        if let Some(value) = value {
            if !value.trim().is_empty() {
                parts.push(format!("{key}: {value}"));
            }
        }
    }

    if let Some(summary) = summary {
        if !summary.trim().is_empty() {
            parts.push(format!("\nResumen: {summary}"));
        }
    }

    if let Some(full_text) = full_text {
        let used: usize = parts.iter().map(|p| p.len() + 2).sum();
        let remaining = MAX_EMBED_CHARS.saturating_sub(used);
        // Only append the body when a meaningful amount fits
        if remaining > 1000 && !full_text.trim().is_empty() {
            parts.push(format!(
                "\nContenido completo:\n{}",
                truncate_chars(full_text, remaining)
            ));
        }
    }

    let mut text = parts.join("\n\n");
    if text.len() > MAX_EMBED_CHARS {
        text.truncate(floor_char_boundary(&text, MAX_EMBED_CHARS));
    }
    text.trim().to_string()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    &text[..floor_char_boundary(text, max)]
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_wire_names() {
        assert_eq!(TaskType::SemanticSimilarity.as_str(), "SEMANTIC_SIMILARITY");
        assert_eq!(TaskType::RetrievalQuery.as_str(), "RETRIEVAL_QUERY");
    }

    #[tokio::test]
    async fn test_embed_rejects_short_text() {
        let client = EmbeddingClient::new("key", "text-embedding-004", 768);
        let err = client
            .embed("corto", TaskType::SemanticSimilarity)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::TextTooShort(_)));
    }

    #[test]
    fn test_prepare_text_orders_parts() {
        let text = prepare_text_for_embedding(
            Some("Resumen de la ayuda."),
            Some("Texto completo de la convocatoria."),
            &[
                ("titulo", Some("Ayudas culturales")),
                ("organismo", Some("Ayuntamiento de Jerez")),
                ("ambito", None),
            ],
        );
        let titulo_pos = text.find("titulo: Ayudas culturales").unwrap();
        let resumen_pos = text.find("Resumen: Resumen de la ayuda.").unwrap();
        let cuerpo_pos = text.find("Contenido completo:").unwrap();
        assert!(titulo_pos < resumen_pos);
        assert!(resumen_pos < cuerpo_pos);
    }

    #[test]
    fn test_prepare_text_truncates_body() {
        let body = "x".repeat(MAX_EMBED_CHARS * 2);
        let text = prepare_text_for_embedding(Some("Resumen."), Some(&body), &[]);
        assert!(text.len() <= MAX_EMBED_CHARS);
        assert!(text.contains("Contenido completo:"));
    }

    #[test]
    fn test_prepare_text_without_anything() {
        assert_eq!(prepare_text_for_embedding(None, None, &[]), "");
    }

    #[test]
    fn test_floor_char_boundary() {
        let text = "ñandú";
        let idx = floor_char_boundary(text, 3);
        assert!(text.is_char_boundary(idx));
        assert_eq!(floor_char_boundary("abc", 10), 3);
    }
}
