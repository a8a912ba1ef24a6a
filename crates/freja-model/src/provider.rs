// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

use crate::{ChatMessage, ChatResult, ToolSchema};

/// Incremental results from one completion request.  Each item carries a
/// partial [`ChatMessage`] in its `output`; the final emission carries the
/// finish reason.  Streams are finite, push-based, and not restartable.
pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChatResult<ChatMessage>>> + Send>>;

/// The contract every provider mapper implements.
///
/// A `ChatModel` translates canonical messages into the provider's wire
/// format and streams provider responses back as partial canonical
/// messages: text deltas become text parts, partial tool-call arguments
/// become per-id fragments, and `usage` / `finish_reason` / opaque provider
/// metadata are preserved on the emitted results.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier as reported to callers.
    fn name(&self) -> &str;

    /// The tool set this model was constructed with.
    fn tools(&self) -> &[ToolSchema] {
        &[]
    }

    fn temperature(&self) -> Option<f32> {
        None
    }

    /// Issue a single completion request.
    ///
    /// `output_schema` requests structured output via the provider's native
    /// mechanism.  Mappers that cannot honor it for this request (with the
    /// tools they carry) reject synchronously with a clear error rather
    /// than emitting a first chunk.
    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> anyhow::Result<ChatStream>;

    /// Release any underlying HTTP session.  The default is a no-op; the
    /// bundled drivers hold only a `reqwest::Client`, which drops cleanly.
    async fn dispose(&self) {}
}

/// What a text is embedded for.  Some providers produce asymmetric
/// embeddings and need to know which side of the retrieval this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Document,
    Query,
}

/// A thin per-provider wrapper around a single embeddings HTTP call.
#[async_trait]
pub trait EmbeddingsModel: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str, kind: EmbeddingKind) -> anyhow::Result<Vec<f32>>;
}
