// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API mapper.
//!
//! Anthropic has no native structured-output mechanism, so a supplied
//! output schema is rejected here; the façade routes typed output for this
//! provider through the synthetic result tool instead.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{
    error::ModelError,
    json_to_text,
    provider::{ChatModel, ChatStream},
    ChatMessage, ChatResult, FinishReason, Part, Role, ToolSchema, Usage,
};

/// Anthropic requires `max_tokens` on every request.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) struct AnthropicChat {
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
    tools: Vec<ToolSchema>,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub(crate) fn new(
        model: String,
        api_key: String,
        base_url: &str,
        temperature: Option<f32>,
        tools: Vec<ToolSchema>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature,
            tools,
            client: reqwest::Client::new(),
        }
    }

    pub(crate) fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let (system_text, wire_messages) = build_anthropic_messages(messages);
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !self.tools.is_empty() {
            let tools: Vec<Value> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
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
        if output_schema.is_some() {
            return Err(ModelError::UnsupportedCombination {
                provider: "anthropic",
                detail: "no native structured-output mechanism; route the schema through a result tool",
            }
            .into());
        }

        let body = self.request_body(messages);

        debug!(
            model = %self.model,
            tool_count = self.tools.len(),
            message_count = messages.len(),
            "sending anthropic request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        let stream = resp
            .bytes_stream()
            .scan(EventScan::default(), |scan, chunk| {
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

/// Scan state for the Anthropic SSE stream: the line buffer, the block
/// index → (id, name) map for tool-use blocks, and the message id from
/// `message_start` (reused as the chunk id for every emission).
#[derive(Default)]
struct EventScan {
    buf: String,
    blocks: HashMap<u64, (String, String)>,
    message_id: String,
}

impl EventScan {
    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<ChatResult<ChatMessage>>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else { continue };
            if let Some(chunk) = self.parse_event(&v) {
                out.push(Ok(chunk));
            }
        }
        out
    }

    fn parse_event(&mut self, v: &Value) -> Option<ChatResult<ChatMessage>> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(id) = v["message"]["id"].as_str() {
                    self.message_id = id.to_string();
                }
                let usage = &v["message"]["usage"];
                usage["input_tokens"].as_u64().map(|input| {
                    let mut result = self.chunk(vec![]);
                    result.usage = Usage { prompt_tokens: Some(input), ..Usage::default() };
                    result
                })
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() != Some("tool_use") {
                    return None;
                }
                let index = v["index"].as_u64().unwrap_or(0);
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                self.blocks.insert(index, (id.clone(), name.clone()));
                Some(self.chunk(vec![Part::tool_call_fragment(id, name, "")]))
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if text.is_empty() {
                            return None;
                        }
                        Some(self.chunk(vec![Part::text(text)]))
                    }
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0);
                        let fragment = delta["partial_json"].as_str().unwrap_or("");
                        let (id, name) = self
                            .blocks
                            .get(&index)
                            .cloned()
                            .unwrap_or_default();
                        if id.is_empty() && name.is_empty() {
                            warn!(index, "input_json_delta without a preceding tool_use block");
                        }
                        Some(self.chunk(vec![Part::tool_call_fragment(id, name, fragment)]))
                    }
                    // signature_delta and friends carry nothing for the core.
                    _ => None,
                }
            }
            "message_delta" => {
                let finish = v["delta"]["stop_reason"]
                    .as_str()
                    .map(map_stop_reason)
                    .unwrap_or_default();
                let response_tokens = v["usage"]["output_tokens"].as_u64();
                if finish == FinishReason::Unspecified && response_tokens.is_none() {
                    return None;
                }
                let mut result = self.chunk(vec![]);
                result.finish_reason = finish;
                result.usage = Usage { response_tokens, ..Usage::default() };
                Some(result)
            }
            // message_stop, ping, content_block_stop: stream bookkeeping only.
            _ => None,
        }
    }

    fn chunk(&self, parts: Vec<Part>) -> ChatResult<ChatMessage> {
        let id = if self.message_id.is_empty() {
            "anthropic"
        } else {
            self.message_id.as_str()
        };
        ChatResult::chunk(id, ChatMessage::model(parts))
    }
}

fn map_stop_reason(s: &str) -> FinishReason {
    match s {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Unspecified,
    }
}

/// Convert canonical messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation)`.  Anthropic takes the system
/// prompt as a top-level field, not a conversation turn.
pub(crate) fn build_anthropic_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                system_text = m.text();
            }
            Role::User => {
                let results: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolResult { id, result, .. } => Some(json!({
                            "type": "tool_result",
                            "tool_use_id": id,
                            "content": json_to_text(result),
                        })),
                        _ => None,
                    })
                    .collect();
                if !results.is_empty() {
                    out.push(json!({ "role": "user", "content": results }));
                    continue;
                }
                let all_text = m.parts.iter().all(|p| matches!(p, Part::Text { .. }));
                if all_text {
                    out.push(json!({ "role": "user", "content": m.text() }));
                } else {
                    let blocks: Vec<Value> =
                        m.parts.iter().filter_map(user_block).collect();
                    out.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Model => {
                let mut blocks: Vec<Value> = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text } if !text.is_empty() => {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                        Part::ToolCall { id, name, arguments, .. } => {
                            // Anthropic requires tool_use.id to match
                            // `^[a-zA-Z0-9_-]+$`; an empty id would 400 the
                            // whole request.
                            let safe_id = if id.is_empty() {
                                warn!(
                                    tool_name = %name,
                                    "tool call with empty id in history; substituting fallback"
                                );
                                "tc_fallback".to_string()
                            } else {
                                id.clone()
                            };
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": safe_id,
                                "name": name,
                                "input": arguments,
                            }));
                        }
                        _ => {}
                    }
                }
                if !blocks.is_empty() {
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
        }
    }
    (system_text, out)
}

fn user_block(p: &Part) -> Option<Value> {
    match p {
        Part::Text { text } => Some(json!({ "type": "text", "text": text })),
        Part::Data { bytes, mime_type, .. } => {
            use base64::{engine::general_purpose::STANDARD, Engine};
            Some(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": mime_type,
                    "data": STANDARD.encode(bytes),
                }
            }))
        }
        Part::Link { url, .. } => Some(json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        })),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_model() -> AnthropicChat {
        AnthropicChat::new(
            "claude-sonnet-4-5".into(),
            "sk-test".into(),
            "https://api.anthropic.com",
            None,
            vec![],
        )
    }

    #[test]
    fn name_reports_model() {
        assert_eq!(make_model().name(), "claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn output_schema_is_rejected() {
        let m = make_model();
        let err = m
            .send_stream(&[ChatMessage::user("hi")], Some(&json!({"type": "object"})))
            .await
            .err()
            .expect("schema must be rejected");
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::UnsupportedCombination { provider: "anthropic", .. })
        ));
    }

    // ── Message building ──────────────────────────────────────────────────────

    #[test]
    fn system_message_extracted_to_top_level() {
        let (sys, msgs) = build_anthropic_messages(&[
            ChatMessage::system("be helpful"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(sys, "be helpful");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["content"], "hi");
    }

    #[test]
    fn tool_call_becomes_tool_use_block() {
        let msg = ChatMessage::model(vec![Part::tool_call(
            "toolu_01",
            "weather",
            json!({"zip": "97209"}),
        )]);
        let (_, msgs) = build_anthropic_messages(&[msg]);
        let block = &msgs[0]["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["id"], "toolu_01");
        assert_eq!(block["input"]["zip"], "97209");
    }

    #[test]
    fn empty_call_id_gets_fallback() {
        let msg = ChatMessage::model(vec![Part::tool_call("", "weather", json!({}))]);
        let (_, msgs) = build_anthropic_messages(&[msg]);
        assert_eq!(msgs[0]["content"][0]["id"], "tc_fallback");
    }

    #[test]
    fn tool_results_group_into_one_user_message() {
        let msg = ChatMessage::tool_results(vec![
            Part::tool_result("c1", "glob", json!("a.c")),
            Part::tool_result("c2", "grep", json!({"hits": 3})),
        ]);
        let (_, msgs) = build_anthropic_messages(&[msg]);
        assert_eq!(msgs.len(), 1);
        let content = msgs[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["tool_use_id"], "c1");
        assert_eq!(content[0]["content"], "a.c");
        assert_eq!(content[1]["content"], "{\"hits\":3}");
    }

    #[test]
    fn data_part_becomes_base64_image_source() {
        let msg = ChatMessage::user_with_parts(vec![
            Part::text("look"),
            Part::data(vec![0, 1, 2], "image/png"),
        ]);
        let (_, msgs) = build_anthropic_messages(&[msg]);
        let img = &msgs[0]["content"][1];
        assert_eq!(img["type"], "image");
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
        assert_eq!(img["source"]["data"], "AAEC");
    }

    #[test]
    fn link_part_becomes_url_image_source() {
        let msg = ChatMessage::user_with_parts(vec![Part::link("https://example.com/a.jpg")]);
        let (_, msgs) = build_anthropic_messages(&[msg]);
        assert_eq!(msgs[0]["content"][0]["source"]["type"], "url");
    }

    #[test]
    fn tools_serialize_with_input_schema() {
        let m = AnthropicChat::new(
            "claude-sonnet-4-5".into(),
            "k".into(),
            "https://api.anthropic.com",
            None,
            vec![ToolSchema {
                name: "weather".into(),
                description: "look up".into(),
                parameters: json!({"type": "object"}),
            }],
        );
        let body = m.request_body(&[ChatMessage::user("hi")]);
        assert_eq!(body["tools"][0]["name"], "weather");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    // ── Event parsing ─────────────────────────────────────────────────────────

    #[test]
    fn message_start_yields_prompt_usage_and_id() {
        let mut scan = EventScan::default();
        let chunk = scan
            .parse_event(&json!({
                "type": "message_start",
                "message": { "id": "msg_01", "usage": { "input_tokens": 42 } }
            }))
            .unwrap();
        assert_eq!(chunk.usage.prompt_tokens, Some(42));
        assert_eq!(chunk.id, "msg_01");
    }

    #[test]
    fn tool_use_block_start_emits_identity_fragment() {
        let mut scan = EventScan::default();
        let chunk = scan
            .parse_event(&json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "tool_use", "id": "toolu_01", "name": "weather" }
            }))
            .unwrap();
        match &chunk.output.parts[0] {
            Part::ToolCall { id, name, arguments_json, .. } => {
                assert_eq!(id, "toolu_01");
                assert_eq!(name, "weather");
                assert!(arguments_json.is_none());
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn text_block_start_is_skipped() {
        let mut scan = EventScan::default();
        assert!(scan
            .parse_event(&json!({
                "type": "content_block_start",
                "content_block": { "type": "text", "text": "" }
            }))
            .is_none());
    }

    #[test]
    fn input_json_delta_resolves_identity_from_index() {
        let mut scan = EventScan::default();
        scan.parse_event(&json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_02", "name": "grep" }
        }));
        let chunk = scan
            .parse_event(&json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": "{\"q\":" }
            }))
            .unwrap();
        match &chunk.output.parts[0] {
            Part::ToolCall { id, arguments_json, .. } => {
                assert_eq!(id, "toolu_02");
                assert_eq!(arguments_json.as_deref(), Some("{\"q\":"));
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn text_delta_becomes_text_part() {
        let mut scan = EventScan::default();
        let chunk = scan
            .parse_event(&json!({
                "type": "content_block_delta",
                "delta": { "type": "text_delta", "text": "world" }
            }))
            .unwrap();
        assert_eq!(chunk.output.text(), "world");
    }

    #[test]
    fn signature_delta_is_discarded() {
        let mut scan = EventScan::default();
        assert!(scan
            .parse_event(&json!({
                "type": "content_block_delta",
                "delta": { "type": "signature_delta", "signature": "EqRk..." }
            }))
            .is_none());
    }

    #[test]
    fn message_delta_maps_stop_reason_and_usage() {
        let mut scan = EventScan::default();
        let chunk = scan
            .parse_event(&json!({
                "type": "message_delta",
                "delta": { "stop_reason": "tool_use" },
                "usage": { "output_tokens": 88 }
            }))
            .unwrap();
        assert_eq!(chunk.finish_reason, FinishReason::ToolCalls);
        assert_eq!(chunk.usage.response_tokens, Some(88));
    }

    #[test]
    fn max_tokens_maps_to_length() {
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::Length);
    }

    #[test]
    fn ping_is_skipped() {
        let mut scan = EventScan::default();
        assert!(scan.parse_event(&json!({ "type": "ping" })).is_none());
    }
}
