// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared mapper for OpenAI-compatible chat completion APIs.
//!
//! Several of the supported providers (openai, mistral, together,
//! openrouter, lambda, cohere-compat) speak the same `/chat/completions`
//! SSE wire format.  This module provides a single `OpenAiCompatChat` that
//! each registry entry configures with its own endpoint, credentials, and
//! extra headers.
//!
//! Structured output uses the native `response_format: json_schema`
//! mechanism and composes with tools, so no combination error arises here.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::{
    data_url, json_to_text,
    provider::{ChatModel, ChatStream},
    ChatMessage, ChatResult, FinishReason, Part, Role, ToolSchema, Usage,
};

pub(crate) struct OpenAiCompatChat {
    /// Registry provider id, used in log lines and error prefixes.
    provider_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    temperature: Option<f32>,
    tools: Vec<ToolSchema>,
    /// Additional headers sent on every request (e.g. OpenRouter referer).
    extra_headers: Vec<(&'static str, &'static str)>,
    client: reqwest::Client,
}

impl OpenAiCompatChat {
    pub(crate) fn new(
        provider_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        temperature: Option<f32>,
        tools: Vec<ToolSchema>,
        extra_headers: Vec<(&'static str, &'static str)>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            temperature,
            tools,
            extra_headers,
            client: reqwest::Client::new(),
        }
    }

    /// Build the request body.  Extracted so the wire format can be tested
    /// without HTTP.
    pub(crate) fn request_body(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_openai_messages(messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if !self.tools.is_empty() {
            let tools: Vec<Value> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(schema) = output_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "output", "schema": schema },
            });
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatChat {
    fn name(&self) -> &str {
        &self.model
    }

    fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> anyhow::Result<ChatStream> {
        let body = self.request_body(messages, output_schema);

        debug!(
            provider = %self.provider_name,
            model = %self.model,
            tool_count = self.tools.len(),
            message_count = messages.len(),
            typed = output_schema.is_some(),
            "sending completion request"
        );

        let mut req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        for (name, val) in &self.extra_headers {
            req = req.header(*name, *val);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.provider_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.provider_name);
        }

        let provider_name = self.provider_name;
        // SSE events can be split across TCP packets.  Carry a line buffer
        // across chunks; only complete `\n`-terminated lines are parsed.
        let stream = resp
            .bytes_stream()
            .scan(SseScan::new(provider_name), |scan, chunk| {
                let results = match chunk {
                    Ok(b) => {
                        scan.buf.push_str(&String::from_utf8_lossy(&b));
                        scan.drain_complete_lines()
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(results))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }
}

/// Streaming scan state: the SSE line buffer plus the per-index tool-call
/// identity map.  OpenAI streams tool calls as *first chunk carries
/// id+name, later chunks carry only the index and an argument fragment*;
/// resolving the index here means every emitted fragment carries its id,
/// so the accumulator can group purely by id.
struct SseScan {
    provider_name: &'static str,
    buf: String,
    calls: HashMap<u64, (String, String)>,
}

impl SseScan {
    fn new(provider_name: &'static str) -> Self {
        Self { provider_name, buf: String::new(), calls: HashMap::new() }
    }

    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<ChatResult<ChatMessage>>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
            if let Some(chunk) = parse_stream_chunk(self.provider_name, &v, &mut self.calls) {
                out.push(Ok(chunk));
            }
        }
        out
    }
}

/// Map an OpenAI `finish_reason` string onto the canonical enum.
fn map_finish_reason(s: &str) -> FinishReason {
    match s {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" => FinishReason::ToolCalls,
        _ => FinishReason::Unspecified,
    }
}

/// Parse one SSE JSON chunk into a partial-message result.
///
/// Returns `None` for chunks that carry nothing the core cares about.
fn parse_stream_chunk(
    provider_name: &'static str,
    v: &Value,
    calls: &mut HashMap<u64, (String, String)>,
) -> Option<ChatResult<ChatMessage>> {
    let chunk_id = v["id"].as_str().unwrap_or(provider_name).to_string();
    let mut metadata = Map::new();
    if let Some(model) = v["model"].as_str() {
        metadata.insert("model".into(), json!(model));
    }

    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let mut result = ChatResult::chunk(chunk_id, ChatMessage::model(vec![]));
        result.usage = Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64(),
            response_tokens: usage["completion_tokens"].as_u64(),
            total_tokens: usage["total_tokens"].as_u64(),
        };
        result.metadata = metadata;
        return Some(result);
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];
    let mut parts: Vec<Part> = Vec::new();

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0);
            let entry = calls.entry(index).or_default();
            if let Some(id) = tc["id"].as_str().filter(|s| !s.is_empty()) {
                entry.0 = id.to_string();
            }
            if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                entry.1 = name.to_string();
            }
            let fragment = tc["function"]["arguments"].as_str().unwrap_or("");
            parts.push(Part::tool_call_fragment(
                entry.0.clone(),
                entry.1.clone(),
                fragment,
            ));
        }
    }

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
    }

    let finish_reason = choice["finish_reason"]
        .as_str()
        .map(map_finish_reason)
        .unwrap_or_default();

    if parts.is_empty() && finish_reason == FinishReason::Unspecified {
        return None;
    }

    let mut result = ChatResult::chunk(chunk_id, ChatMessage::model(parts));
    result.finish_reason = finish_reason;
    result.metadata = metadata;
    Some(result)
}

/// Convert canonical messages into the OpenAI wire-format array.
///
/// A model turn's tool calls all go into one assistant message's
/// `tool_calls` array; each tool-result part becomes its own `role: tool`
/// message bearing the call id.
pub(crate) fn build_openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());

    for m in messages {
        match m.role {
            Role::System => {
                out.push(json!({ "role": "system", "content": m.text() }));
            }
            Role::User => {
                let results: Vec<&Part> = m
                    .parts
                    .iter()
                    .filter(|p| matches!(p, Part::ToolResult { .. }))
                    .collect();
                if !results.is_empty() {
                    for p in results {
                        if let Part::ToolResult { id, result, .. } = p {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": id,
                                "content": json_to_text(result),
                            }));
                        }
                    }
                    continue;
                }
                out.push(json!({
                    "role": "user",
                    "content": user_content(&m.parts),
                }));
            }
            Role::Model => {
                let text = m.text();
                let calls: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolCall { id, name, arguments, .. } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant" });
                if !text.is_empty() || calls.is_empty() {
                    msg["content"] = json!(text);
                }
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
        }
    }

    out
}

/// User content: a plain string when the message is text-only, otherwise a
/// content-part array mixing text and image URLs.
fn user_content(parts: &[Part]) -> Value {
    let all_text = parts.iter().all(|p| matches!(p, Part::Text { .. }));
    if all_text {
        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        return json!(text);
    }
    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(json!({ "type": "text", "text": text })),
            Part::Data { bytes, mime_type, .. } => Some(json!({
                "type": "image_url",
                "image_url": { "url": data_url(mime_type, bytes) },
            })),
            Part::Link { url, .. } => Some(json!({
                "type": "image_url",
                "image_url": { "url": url },
            })),
            _ => None,
        })
        .collect();
    json!(blocks)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
