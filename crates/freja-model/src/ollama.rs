// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ollama mapper — native `/api/chat` with NDJSON streaming.
//!
//! Structured output goes through the `format` request field, which the
//! server accepts **only** when no tools are declared; supplying both
//! raises `UnsupportedCombination`.  Ollama streams tool calls complete
//! (arguments arrive as a parsed object) and without ids, so ids are
//! synthesized here.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::ModelError,
    json_to_text,
    provider::{ChatModel, ChatStream},
    ChatMessage, ChatResult, FinishReason, Part, Role, ToolSchema, Usage,
};

pub(crate) struct OllamaChat {
    model: String,
    base_url: String,
    temperature: Option<f32>,
    tools: Vec<ToolSchema>,
    client: reqwest::Client,
}

impl OllamaChat {
    pub(crate) fn new(
        model: String,
        base_url: &str,
        temperature: Option<f32>,
        tools: Vec<ToolSchema>,
    ) -> Self {
        Self {
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature,
            tools,
            client: reqwest::Client::new(),
        }
    }

    pub(crate) fn request_body(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> anyhow::Result<Value> {
        if output_schema.is_some() && !self.tools.is_empty() {
            return Err(ModelError::UnsupportedCombination {
                provider: "ollama",
                detail: "tools and the format parameter are mutually exclusive on this API",
            }
            .into());
        }

        let mut body = json!({
            "model": self.model,
            "messages": build_ollama_messages(messages),
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["options"] = json!({ "temperature": t });
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
            body["format"] = schema.clone();
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
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
        let body = self.request_body(messages, output_schema)?;

        debug!(model = %self.model, typed = output_schema.is_some(), "sending ollama request");

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("ollama error {status}: {text}");
        }

        let stream = resp
            .bytes_stream()
            .scan(NdjsonScan::default(), |scan, chunk| {
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

/// NDJSON scan state: each complete line is one JSON response object.
#[derive(Default)]
struct NdjsonScan {
    buf: String,
    call_index: usize,
}

impl NdjsonScan {
    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<ChatResult<ChatMessage>>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            if line.trim().is_empty() {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(&line) else { continue };
            if let Some(err) = v["error"].as_str() {
                out.push(Err(anyhow::anyhow!("ollama error: {err}")));
                continue;
            }
            if let Some(chunk) = self.parse_line(&v) {
                out.push(Ok(chunk));
            }
        }
        out
    }

    fn parse_line(&mut self, v: &Value) -> Option<ChatResult<ChatMessage>> {
        let mut parts: Vec<Part> = Vec::new();

        if let Some(text) = v["message"]["content"].as_str() {
            if !text.is_empty() {
                parts.push(Part::text(text));
            }
        }
        let mut saw_calls = false;
        if let Some(calls) = v["message"]["tool_calls"].as_array() {
            for call in calls {
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                let args = call["function"]["arguments"].clone();
                let args = if args.is_object() { args } else { json!({}) };
                let id = format!(
                    "ollama-{name}-{}-{}",
                    self.call_index,
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                self.call_index += 1;
                parts.push(Part::tool_call(id, name, args));
                saw_calls = true;
            }
        }

        let done = v["done"].as_bool() == Some(true);
        let finish_reason = if !done {
            FinishReason::Unspecified
        } else if v["done_reason"].as_str() == Some("length") {
            FinishReason::Length
        } else if saw_calls || self.call_index > 0 {
            // A response that requested tools ends with done_reason=stop;
            // what matters to the loop is that calls are pending.
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };

        let usage = if done {
            Usage::new(v["prompt_eval_count"].as_u64(), v["eval_count"].as_u64())
        } else {
            Usage::default()
        };

        if parts.is_empty() && !done {
            return None;
        }

        let mut result = ChatResult::chunk("ollama", ChatMessage::model(parts));
        result.finish_reason = finish_reason;
        result.usage = usage;
        Some(result)
    }
}

/// Convert canonical messages into the `/api/chat` message array.
pub(crate) fn build_ollama_messages(messages: &[ChatMessage]) -> Vec<Value> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        match m.role {
            Role::System => out.push(json!({ "role": "system", "content": m.text() })),
            Role::User => {
                let results: Vec<&Part> = m
                    .parts
                    .iter()
                    .filter(|p| matches!(p, Part::ToolResult { .. }))
                    .collect();
                if !results.is_empty() {
                    for p in results {
                        if let Part::ToolResult { name, result, .. } = p {
                            out.push(json!({
                                "role": "tool",
                                "tool_name": name,
                                "content": json_to_text(result),
                            }));
                        }
                    }
                    continue;
                }
                let mut text = String::new();
                let mut images: Vec<String> = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text: t } => text.push_str(t),
                        Part::Data { bytes, .. } => images.push(STANDARD.encode(bytes)),
                        // Ollama does not fetch remote media; surface the URL
                        // in the text so the model at least sees it.
                        Part::Link { url, .. } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(url);
                        }
                        _ => {}
                    }
                }
                let mut msg = json!({ "role": "user", "content": text });
                if !images.is_empty() {
                    msg["images"] = json!(images);
                }
                out.push(msg);
            }
            Role::Model => {
                let calls: Vec<Value> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolCall { name, arguments, .. } => Some(json!({
                            "function": { "name": name, "arguments": arguments }
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "content": m.text() });
                if !calls.is_empty() {
                    msg["tool_calls"] = json!(calls);
                }
                out.push(msg);
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
