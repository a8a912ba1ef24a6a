// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini mapper — native Generative Language API.
//!
//! Uses `streamGenerateContent?alt=sse`.  Structured output goes through
//! `generationConfig.responseSchema`, which the API accepts **only** when
//! no tools are declared; supplying both raises `UnsupportedCombination`.
//!
//! Gemini omits tool-call ids and matches results to calls by function
//! name, so this mapper synthesizes stable ids on the way out and emits
//! `functionResponse` parts keyed by name on the way in.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    error::ModelError,
    provider::{ChatModel, ChatStream},
    ChatMessage, ChatResult, FinishReason, Part, Role, ToolSchema, Usage,
};

pub(crate) struct GoogleChat {
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
    tools: Vec<ToolSchema>,
    client: reqwest::Client,
}

impl GoogleChat {
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

    pub(crate) fn request_body(
        &self,
        messages: &[ChatMessage],
        output_schema: Option<&Value>,
    ) -> anyhow::Result<Value> {
        if output_schema.is_some() && !self.tools.is_empty() {
            return Err(ModelError::UnsupportedCombination {
                provider: "google",
                detail: "tools and responseSchema are mutually exclusive on this API",
            }
            .into());
        }

        let (system_parts, contents) = build_gemini_contents(messages);

        let mut generation_config = json!({});
        if let Some(t) = self.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(schema) = output_schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = map_schema("google", schema)?;
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if !self.tools.is_empty() {
            let declarations: Vec<Value> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatModel for GoogleChat {
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

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );

        debug!(model = %self.model, typed = output_schema.is_some(), "sending gemini request");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("google request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("google error {status}: {text}");
        }

        let stream = resp
            .bytes_stream()
            .scan(GeminiScan::default(), |scan, chunk| {
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

#[derive(Default)]
struct GeminiScan {
    buf: String,
    /// Running count of function calls seen, used in synthesized ids.
    call_index: usize,
}

impl GeminiScan {
    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<ChatResult<ChatMessage>>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            let Some(data) = line.strip_prefix("data: ") else { continue };
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else { continue };
            if let Some(chunk) = self.parse_chunk(&v) {
                out.push(Ok(chunk));
            }
        }
        out
    }

    fn parse_chunk(&mut self, v: &Value) -> Option<ChatResult<ChatMessage>> {
        let chunk_id = v["responseId"].as_str().unwrap_or("google").to_string();
        let candidate = &v["candidates"][0];

        let mut parts: Vec<Part> = Vec::new();
        if let Some(wire_parts) = candidate["content"]["parts"].as_array() {
            for p in wire_parts {
                // Thought summaries are not answer text.
                if p["thought"].as_bool() == Some(true) {
                    continue;
                }
                if let Some(text) = p["text"].as_str() {
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                } else if let Some(call) = p.get("functionCall") {
                    let name = call["name"].as_str().unwrap_or("").to_string();
                    let args = call.get("args").cloned().unwrap_or(json!({}));
                    let id = format!(
                        "google-{name}-{}-{}",
                        self.call_index,
                        &uuid::Uuid::new_v4().simple().to_string()[..8]
                    );
                    self.call_index += 1;
                    parts.push(Part::tool_call(id, name, args));
                }
            }
        }

        let finish_reason = candidate["finishReason"]
            .as_str()
            .map(map_finish_reason)
            .unwrap_or_default();

        let usage = match v.get("usageMetadata") {
            Some(u) if finish_reason != FinishReason::Unspecified => Usage {
                prompt_tokens: u["promptTokenCount"].as_u64(),
                response_tokens: u["candidatesTokenCount"].as_u64(),
                total_tokens: u["totalTokenCount"].as_u64(),
            },
            _ => Usage::default(),
        };

        if parts.is_empty()
            && finish_reason == FinishReason::Unspecified
            && usage == Usage::default()
        {
            return None;
        }

        let mut result = ChatResult::chunk(chunk_id, ChatMessage::model(parts));
        result.finish_reason = finish_reason;
        result.usage = usage;
        Some(result)
    }
}

fn map_finish_reason(s: &str) -> FinishReason {
    match s {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        "RECITATION" => FinishReason::Recitation,
        _ => FinishReason::Unspecified,
    }
}

/// Convert canonical messages into Gemini `contents`.
///
/// Returns `(system_instruction_parts, contents)`.
pub(crate) fn build_gemini_contents(messages: &[ChatMessage]) -> (Vec<Value>, Vec<Value>) {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {
                system_parts.push(json!({ "text": m.text() }));
            }
            Role::User => {
                let parts: Vec<Value> = m.parts.iter().filter_map(gemini_part).collect();
                if !parts.is_empty() {
                    contents.push(json!({ "role": "user", "parts": parts }));
                }
            }
            Role::Model => {
                let parts: Vec<Value> = m.parts.iter().filter_map(gemini_part).collect();
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
        }
    }
    (system_parts, contents)
}

fn gemini_part(p: &Part) -> Option<Value> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    match p {
        Part::Text { text } => Some(json!({ "text": text })),
        Part::Data { bytes, mime_type, .. } => Some(json!({
            "inlineData": { "mimeType": mime_type, "data": STANDARD.encode(bytes) }
        })),
        Part::Link { url, mime_type, .. } => Some(json!({
            "fileData": {
                "fileUri": url,
                "mimeType": mime_type.as_deref().unwrap_or("application/octet-stream"),
            }
        })),
        Part::ToolCall { name, arguments, .. } => Some(json!({
            "functionCall": { "name": name, "args": arguments }
        })),
        Part::ToolResult { name, result, .. } => {
            // Gemini matches responses to calls by function name, and the
            // response payload must be an object.
            let response = if result.is_object() {
                result.clone()
            } else {
                json!({ "result": result })
            };
            Some(json!({
                "functionResponse": { "name": name, "response": response }
            }))
        }
    }
}

/// Translate a JSON Schema into Gemini's schema dialect.
///
/// Union keywords have no representation there; rejecting them with an
/// actionable message beats silently sending a schema the API will 400 on.
/// `$schema` and `additionalProperties` are stripped.
pub(crate) fn map_schema(provider: &'static str, schema: &Value) -> anyhow::Result<Value> {
    fn walk(provider: &'static str, v: &Value) -> anyhow::Result<Value> {
        match v {
            Value::Object(obj) => {
                for union_kw in ["anyOf", "oneOf", "allOf"] {
                    if obj.contains_key(union_kw) {
                        return Err(ModelError::SchemaMapping {
                            provider,
                            reason: format!(
                                "{union_kw} is not representable; flatten the union into a single object schema"
                            ),
                        }
                        .into());
                    }
                }
                let mut out = Map::new();
                for (k, val) in obj {
                    if k == "$schema" || k == "additionalProperties" {
                        continue;
                    }
                    out.insert(k.clone(), walk(provider, val)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => Ok(Value::Array(
                items.iter().map(|i| walk(provider, i)).collect::<anyhow::Result<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
    walk(provider, schema)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
