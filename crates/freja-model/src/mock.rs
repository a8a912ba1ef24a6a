// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic in-process models for tests.  No network.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::{ChatModel, ChatStream},
    ChatMessage, ChatResult, FinishReason, Part, Usage,
};

// ─── Chunk constructors ──────────────────────────────────────────────────────
//
// Free helpers for building scripted streams.  Tests across the workspace
// compose these instead of hand-writing ChatResult literals.

/// A chunk carrying one text delta.
pub fn text_chunk(text: impl Into<String>) -> ChatResult<ChatMessage> {
    ChatResult::chunk("mock", ChatMessage::model(vec![Part::text(text.into())]))
}

/// A chunk opening a tool call: id + name, no arguments yet.
pub fn call_chunk(id: impl Into<String>, name: impl Into<String>) -> ChatResult<ChatMessage> {
    ChatResult::chunk(
        "mock",
        ChatMessage::model(vec![Part::tool_call_fragment(id, name, "")]),
    )
}

/// A chunk carrying an argument-JSON fragment for the call with `id`.
pub fn args_chunk(id: impl Into<String>, fragment: impl Into<String>) -> ChatResult<ChatMessage> {
    ChatResult::chunk(
        "mock",
        ChatMessage::model(vec![Part::tool_call_fragment(id, "", fragment)]),
    )
}

/// A chunk carrying a complete tool call with parsed arguments.
pub fn complete_call_chunk(
    id: impl Into<String>,
    name: impl Into<String>,
    arguments: Value,
) -> ChatResult<ChatMessage> {
    ChatResult::chunk(
        "mock",
        ChatMessage::model(vec![Part::tool_call(id, name, arguments)]),
    )
}

/// The terminal chunk of a response: finish reason plus usage.
pub fn finish_chunk(reason: FinishReason) -> ChatResult<ChatMessage> {
    let mut c = ChatResult::chunk("mock", ChatMessage::model(vec![]));
    c.finish_reason = reason;
    c.usage = Usage::new(Some(10), Some(10));
    c
}

// ─── Models ──────────────────────────────────────────────────────────────────

/// Echoes the last user message back as the model response.
#[derive(Default)]
pub struct EchoChatModel;

#[async_trait]
impl ChatModel for EchoChatModel {
    fn name(&self) -> &str {
        "mock-model"
    }

    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        _output_schema: Option<&Value>,
    ) -> anyhow::Result<ChatStream> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let chunks = vec![
            Ok(text_chunk(format!("MOCK: {reply}"))),
            Ok(finish_chunk(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// The request a scripted model saw: messages plus the output schema.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub output_schema: Option<Value>,
}

/// A pre-scripted model.  Each `send_stream` call pops the next script
/// from the front of the queue, so tests specify exact chunk sequences
/// (including fragmented tool calls) without network access.
pub struct ScriptedChatModel {
    scripts: Mutex<Vec<Vec<ChatResult<ChatMessage>>>>,
    /// Every request this model has seen, in order.  Tests inspect this to
    /// assert on the wire history the orchestrator produced.
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedChatModel {
    /// The outer `Vec` is the ordered list of round trips; the inner `Vec`
    /// is the chunk sequence for that round trip.
    pub fn new(scripts: Vec<Vec<ChatResult<ChatMessage>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a model that always answers with a single text chunk.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            text_chunk(reply.into()),
            finish_chunk(FinishReason::Stop),
        ]])
    }

    /// Convenience: one tool call round followed by a text answer.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let tool_id = tool_id.into();
        Self::new(vec![
            vec![
                call_chunk(tool_id.clone(), tool_name),
                args_chunk(tool_id, args_json),
                finish_chunk(FinishReason::ToolCalls),
            ],
            vec![
                text_chunk(final_text.into()),
                finish_chunk(FinishReason::Stop),
            ],
        ])
    }

    /// The last request seen, if any.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> anyhow::Result<ChatStream> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            output_schema: output_schema.cloned(),
        });
        let chunks = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    text_chunk("[no more scripts]"),
                    finish_chunk(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<_>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
