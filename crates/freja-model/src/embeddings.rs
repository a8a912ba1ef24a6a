// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Embeddings drivers — one HTTP call each, no orchestration.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::{EmbeddingKind, EmbeddingsModel};

/// `POST /embeddings` in the OpenAI wire format.  Shared by every provider
/// whose embeddings endpoint is OpenAI-compatible.
pub(crate) struct OpenAiCompatEmbeddings {
    provider_name: &'static str,
    model: String,
    api_key: Option<String>,
    url: String,
    client: reqwest::Client,
}

impl OpenAiCompatEmbeddings {
    pub(crate) fn new(
        provider_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_name,
            model,
            api_key,
            url: format!("{base}/embeddings"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingsModel for OpenAiCompatEmbeddings {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, _kind: EmbeddingKind) -> anyhow::Result<Vec<f32>> {
        debug!(provider = %self.provider_name, model = %self.model, "embedding request");
        let mut req = self
            .client
            .post(&self.url)
            .json(&json!({ "model": self.model, "input": text }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("{} embeddings request failed", self.provider_name))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} embeddings error {status}: {text}", self.provider_name);
        }
        let body: Value = resp.json().await.context("invalid embeddings response")?;
        parse_embedding_vector(&body["data"][0]["embedding"])
    }
}

/// Gemini `embedContent`.  The embedding kind maps onto the API's
/// `taskType` so retrieval documents and queries land in the right space.
pub(crate) struct GoogleEmbeddings {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleEmbeddings {
    pub(crate) fn new(model: String, api_key: String, base_url: &str) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingsModel for GoogleEmbeddings {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, kind: EmbeddingKind) -> anyhow::Result<Vec<f32>> {
        let task_type = match kind {
            EmbeddingKind::Document => "RETRIEVAL_DOCUMENT",
            EmbeddingKind::Query => "RETRIEVAL_QUERY",
        };
        let url = format!("{}/v1beta/models/{}:embedContent", self.base_url, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({
                "content": { "parts": [{ "text": text }] },
                "taskType": task_type,
            }))
            .send()
            .await
            .context("google embeddings request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("google embeddings error {status}: {text}");
        }
        let body: Value = resp.json().await.context("invalid embeddings response")?;
        parse_embedding_vector(&body["embedding"]["values"])
    }
}

fn parse_embedding_vector(v: &Value) -> anyhow::Result<Vec<f32>> {
    let arr = v
        .as_array()
        .context("embeddings response carries no vector")?;
    arr.iter()
        .map(|n| {
            n.as_f64()
                .map(|f| f as f32)
                .context("non-numeric entry in embedding vector")
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vector_parses_from_json_array() {
        let v = json!([0.1, -0.25, 3.0]);
        let out = parse_embedding_vector(&v).unwrap();
        assert_eq!(out.len(), 3);
        assert!((out[1] - (-0.25)).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_vector_is_an_error() {
        assert!(parse_embedding_vector(&json!(null)).is_err());
    }

    #[test]
    fn non_numeric_entry_is_an_error() {
        assert!(parse_embedding_vector(&json!([0.1, "x"])).is_err());
    }

    #[test]
    fn openai_compat_url_appends_path() {
        let m = OpenAiCompatEmbeddings::new(
            "openai",
            "text-embedding-3-small".into(),
            None,
            "https://api.openai.com/v1/",
        );
        assert_eq!(m.url, "https://api.openai.com/v1/embeddings");
    }
}
