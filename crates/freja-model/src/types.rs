// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Message types ────────────────────────────────────────────────────────────

/// Who produced a message.
///
/// Tool results are carried on `User` messages placed between two `Model`
/// turns; there is no separate tool role in the canonical representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Model,
}

/// A single message in the conversation history.
///
/// Messages are immutable values; "updating" a history means appending new
/// messages.  Equality is structural, and the serde form round-trips through
/// JSON without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<Part>,
    /// Opaque provider metadata.  Never interpreted by the core.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::text(text)],
            metadata: Map::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
            metadata: Map::new(),
        }
    }

    /// A user message from arbitrary parts (text, attachments, tool results).
    pub fn user_with_parts(parts: Vec<Part>) -> Self {
        Self { role: Role::User, parts, metadata: Map::new() }
    }

    /// A model turn from arbitrary parts (text and/or tool calls).
    pub fn model(parts: Vec<Part>) -> Self {
        Self { role: Role::Model, parts, metadata: Map::new() }
    }

    /// A user message carrying only tool results, placed between two model
    /// turns.
    pub fn tool_results(parts: Vec<Part>) -> Self {
        Self { role: Role::User, parts, metadata: Map::new() }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Concatenation of all text parts, in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for p in &self.parts {
            if let Part::Text { text } = p {
                out.push_str(text);
            }
        }
        out
    }

    /// The tool-call parts of this message, in order.
    pub fn tool_call_parts(&self) -> Vec<&Part> {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::ToolCall { .. }))
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall { .. }))
    }
}

/// One piece of message content.
///
/// `ToolCall.arguments` holds the parsed argument object on consolidated
/// messages.  While a response is being streamed, partial argument JSON
/// travels in `arguments_json` instead and `arguments` is null; the
/// accumulator buffers the fragments and parses them once the stream ends.
/// `arguments_json` is never serialized on consolidated parts, so the JSON
/// form of a finished message round-trips structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Data {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Link {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolCall {
        /// Correlates the call with its result.  Unique per interaction.
        id: String,
        name: String,
        #[serde(default = "empty_object")]
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments_json: Option<String>,
    },
    ToolResult {
        /// The id of the call this result answers.
        id: String,
        name: String,
        result: Value,
    },
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn data(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Data { bytes, mime_type: mime_type.into(), name: None }
    }

    pub fn link(url: impl Into<String>) -> Self {
        Self::Link { url: url.into(), mime_type: None, name: None }
    }

    /// A consolidated tool call with parsed arguments.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            arguments_json: None,
        }
    }

    /// A streamed tool-call fragment.  `fragment` is a piece of the
    /// argument JSON; `id` and `name` may be empty on continuation chunks.
    pub fn tool_call_fragment(
        id: impl Into<String>,
        name: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        let fragment = fragment.into();
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: Value::Null,
            arguments_json: if fragment.is_empty() { None } else { Some(fragment) },
        }
    }

    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self::ToolResult { id: id.into(), name: name.into(), result }
    }
}

/// Render a data part as a `data:<mime>;base64,<b64>` URL for providers that
/// take inline media by URL.
pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Tool-result serialization rule: strings pass through verbatim, anything
/// else is JSON-encoded.
pub fn json_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ─── Results and usage ────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    #[default]
    Unspecified,
    Stop,
    Length,
    ContentFilter,
    Recitation,
    ToolCalls,
}

/// Token accounting as reported by the provider.  Passed through, never
/// reconciled across providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt_tokens: Option<u64>, response_tokens: Option<u64>) -> Self {
        let total_tokens = match (prompt_tokens, response_tokens) {
            (None, None) => None,
            (p, r) => Some(p.unwrap_or(0).saturating_add(r.unwrap_or(0))),
        };
        Self { prompt_tokens, response_tokens, total_tokens }
    }

    /// Fold another report into this one.  `None` is the identity so that
    /// partial per-chunk reports combine without inventing zeros.
    pub fn merge(&mut self, other: &Usage) {
        fn add(a: &mut Option<u64>, b: Option<u64>) {
            *a = match (*a, b) {
                (None, None) => None,
                (x, y) => Some(x.unwrap_or(0).saturating_add(y.unwrap_or(0))),
            };
        }
        add(&mut self.prompt_tokens, other.prompt_tokens);
        add(&mut self.response_tokens, other.response_tokens);
        add(&mut self.total_tokens, other.total_tokens);
    }
}

/// One emission from a chat stream.
///
/// `output` is the newly produced value for this chunk; `messages` is the
/// (possibly empty) set of *new* messages to commit to the transcript for
/// this chunk.  For provider streams `T = ChatMessage` (a partial message);
/// for the agent façade `T = String` (streamed text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult<T> {
    pub id: String,
    pub output: T,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub usage: Usage,
}

impl<T> ChatResult<T> {
    /// A bare chunk carrying only `output`.
    pub fn chunk(id: impl Into<String>, output: T) -> Self {
        Self {
            id: id.into(),
            output,
            messages: Vec::new(),
            finish_reason: FinishReason::Unspecified,
            metadata: Map::new(),
            usage: Usage::default(),
        }
    }
}

// ─── Tool and model descriptors ───────────────────────────────────────────────

/// Wire-level tool descriptor handed to providers.
///
/// `parameters` is a JSON Schema object; an empty-properties schema means
/// the tool takes no arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What a model is for.  Used to key per-provider default model names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Embeddings,
}

/// An entry returned by provider model listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub description: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_message_sets_role_and_text() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn system_message_sets_role() {
        let m = ChatMessage::system("be terse");
        assert_eq!(m.role, Role::System);
    }

    #[test]
    fn model_message_mixes_text_and_calls() {
        let m = ChatMessage::model(vec![
            Part::text("checking"),
            Part::tool_call("c1", "weather", json!({"zip": "97209"})),
        ]);
        assert_eq!(m.text(), "checking");
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_call_parts().len(), 1);
    }

    #[test]
    fn text_concatenates_multiple_text_parts() {
        let m = ChatMessage::model(vec![Part::text("a"), Part::text("b")]);
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn tool_results_message_has_user_role() {
        let m = ChatMessage::tool_results(vec![Part::tool_result("c1", "weather", json!("70"))]);
        assert_eq!(m.role, Role::User);
        assert!(!m.has_tool_calls());
    }

    // ── Serde round-trip ──────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_structurally() {
        let original = ChatMessage::model(vec![
            Part::text("look:"),
            Part::data(vec![1, 2, 3], "image/png"),
            Part::link("https://example.com/chart.png"),
            Part::tool_call("c1", "weather", json!({"zip": "97209"})),
        ]);
        let json = serde_json::to_string(&original).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn tool_result_round_trips() {
        let original = ChatMessage::tool_results(vec![Part::tool_result(
            "c1",
            "weather",
            json!({"tempF": 70}),
        )]);
        let json = serde_json::to_value(&original).unwrap();
        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn empty_arguments_round_trip_as_empty_object() {
        let p = Part::tool_call("c1", "current_date", json!({}));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["arguments"], json!({}));
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn consolidated_call_omits_fragment_field() {
        let p = Part::tool_call("c1", "weather", json!({"zip": "97209"}));
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("arguments_json").is_none());
    }

    #[test]
    fn data_part_serialises_as_base64() {
        let p = Part::data(b"\x00\x01\x02".to_vec(), "application/octet-stream");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["bytes"], json!("AAEC"));
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn part_tag_is_snake_case() {
        let v = serde_json::to_value(Part::tool_call("c1", "f", json!({}))).unwrap();
        assert_eq!(v["type"], "tool_call");
        let v = serde_json::to_value(Part::text("x")).unwrap();
        assert_eq!(v["type"], "text");
    }

    #[test]
    fn metadata_absent_when_empty() {
        let v = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert!(v.get("metadata").is_none());
    }

    // ── Fragments ─────────────────────────────────────────────────────────────

    #[test]
    fn fragment_with_empty_args_has_no_fragment_field() {
        match Part::tool_call_fragment("c1", "weather", "") {
            Part::ToolCall { arguments_json, .. } => assert!(arguments_json.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn fragment_carries_partial_json() {
        match Part::tool_call_fragment("", "", "{\"zip\":") {
            Part::ToolCall { arguments_json, arguments, .. } => {
                assert_eq!(arguments_json.as_deref(), Some("{\"zip\":"));
                assert!(arguments.is_null());
            }
            _ => panic!("wrong variant"),
        }
    }

    // ── Usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn usage_new_computes_total() {
        let u = Usage::new(Some(10), Some(5));
        assert_eq!(u.total_tokens, Some(15));
    }

    #[test]
    fn usage_new_all_none_has_no_total() {
        assert_eq!(Usage::new(None, None).total_tokens, None);
    }

    #[test]
    fn usage_merge_treats_none_as_identity() {
        let mut a = Usage::new(Some(10), None);
        a.merge(&Usage::new(None, Some(7)));
        assert_eq!(a.prompt_tokens, Some(10));
        assert_eq!(a.response_tokens, Some(7));
        assert_eq!(a.total_tokens, Some(17));
    }

    #[test]
    fn usage_merge_of_two_empties_stays_empty() {
        let mut a = Usage::default();
        a.merge(&Usage::default());
        assert_eq!(a, Usage::default());
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn json_to_text_passes_strings_through() {
        assert_eq!(json_to_text(&json!("plain")), "plain");
    }

    #[test]
    fn json_to_text_encodes_structures() {
        assert_eq!(json_to_text(&json!({"tempF": 70})), "{\"tempF\":70}");
    }

    #[test]
    fn data_url_formats_mime_and_payload() {
        assert_eq!(data_url("image/png", &[0, 1, 2]), "data:image/png;base64,AAEC");
    }

    #[test]
    fn finish_reason_defaults_to_unspecified() {
        assert_eq!(FinishReason::default(), FinishReason::Unspecified);
    }

    #[test]
    fn chat_result_round_trips() {
        let r = ChatResult {
            id: "run-1".into(),
            output: "hello".to_string(),
            messages: vec![ChatMessage::user("hi")],
            finish_reason: FinishReason::Stop,
            metadata: Map::new(),
            usage: Usage::new(Some(3), Some(2)),
        };
        let json = serde_json::to_string(&r).unwrap();
        let back: ChatResult<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
