// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Merges a sequence of partial `ChatMessage` deltas into one consolidated
//! model message.
//!
//! Most providers stream tool calls as *first chunk carries id + name and
//! empty arguments; later chunks carry partial argument JSON*.  Fragments
//! group by provider-supplied id when present; a fragment with a name but
//! no id opens a new call slot, and a nameless, id-less fragment appends to
//! the most recently opened slot.  Argument JSON is parsed only at
//! consolidation, once the stream is complete.

use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use freja_model::{ChatMessage, Part, Role};

use crate::error::ToolArgumentParseError;

/// Per-iteration accumulation workspace.
#[derive(Default)]
pub struct StreamAccumulator {
    slots: Vec<Slot>,
    /// Index of the text slot; text is flushed into a single part at the
    /// position of the first text fragment.
    text_slot: Option<usize>,
    metadata: Map<String, Value>,
}

enum Slot {
    Text(String),
    /// Data and link parts pass through unchanged.
    Passthrough(Part),
    Call(CallBuf),
}

struct CallBuf {
    id: String,
    name: String,
    fragments: String,
    /// Arguments that arrived already parsed (complete calls, or
    /// re-accumulation of a consolidated message).
    parsed: Option<Value>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.metadata.is_empty()
    }

    /// Merge one streamed delta into the accumulated state.
    pub fn accumulate(&mut self, delta: &ChatMessage) {
        for (k, v) in &delta.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        for part in &delta.parts {
            match part {
                Part::Text { text } => match self.text_slot {
                    Some(i) => {
                        if let Slot::Text(buf) = &mut self.slots[i] {
                            buf.push_str(text);
                        }
                    }
                    None => {
                        self.slots.push(Slot::Text(text.clone()));
                        self.text_slot = Some(self.slots.len() - 1);
                    }
                },
                Part::Data { .. } | Part::Link { .. } | Part::ToolResult { .. } => {
                    self.slots.push(Slot::Passthrough(part.clone()));
                }
                Part::ToolCall { id, name, arguments, arguments_json } => {
                    self.accumulate_call(id, name, arguments, arguments_json.as_deref());
                }
            }
        }
    }

    /// Merge chunk-level provider metadata (from the `ChatResult`, as
    /// opposed to the delta message itself).
    pub fn merge_metadata(&mut self, metadata: &Map<String, Value>) {
        for (k, v) in metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }

    fn accumulate_call(
        &mut self,
        id: &str,
        name: &str,
        arguments: &Value,
        fragment: Option<&str>,
    ) {
        let target = self.find_call_slot(id, name);
        let buf = match target {
            Some(i) => match &mut self.slots[i] {
                Slot::Call(buf) => buf,
                _ => unreachable!("find_call_slot returns call slots only"),
            },
            None => {
                self.slots.push(Slot::Call(CallBuf {
                    id: id.to_string(),
                    name: name.to_string(),
                    fragments: String::new(),
                    parsed: None,
                }));
                match self.slots.last_mut() {
                    Some(Slot::Call(buf)) => buf,
                    _ => unreachable!("just pushed a call slot"),
                }
            }
        };
        if buf.name.is_empty() && !name.is_empty() {
            buf.name = name.to_string();
        }
        if buf.id.is_empty() && !id.is_empty() {
            buf.id = id.to_string();
        }
        if let Some(f) = fragment {
            buf.fragments.push_str(f);
        } else if !arguments.is_null() {
            buf.parsed = Some(arguments.clone());
        }
    }

    /// Pick the call slot a fragment belongs to.
    ///
    /// By id when the provider supplies one; otherwise a named fragment
    /// opens a new slot and a nameless one continues the last opened call.
    fn find_call_slot(&self, id: &str, name: &str) -> Option<usize> {
        if !id.is_empty() {
            return self.slots.iter().position(
                |s| matches!(s, Slot::Call(buf) if !buf.id.is_empty() && buf.id == id),
            );
        }
        if !name.is_empty() {
            return None;
        }
        self.slots
            .iter()
            .rposition(|s| matches!(s, Slot::Call(_)))
    }

    /// Flush the accumulated state into one consolidated model message.
    ///
    /// Argument buffers parse as: empty → `{}`; `null` → `{}`; any other
    /// non-object or invalid JSON → [`ToolArgumentParseError`].  Calls that
    /// never received an id get a synthesized stable one.  Consolidating an
    /// already-consolidated message is a no-op.
    pub fn consolidate(self) -> Result<ChatMessage, ToolArgumentParseError> {
        let mut parts: Vec<Part> = Vec::with_capacity(self.slots.len());
        let mut call_index = 0usize;

        for slot in self.slots {
            match slot {
                Slot::Text(buf) => {
                    if !buf.is_empty() {
                        parts.push(Part::text(buf));
                    }
                }
                Slot::Passthrough(part) => parts.push(part),
                Slot::Call(buf) => {
                    let arguments = resolve_arguments(&buf)?;
                    let id = if buf.id.is_empty() {
                        let synthesized = format!(
                            "{}-{call_index}-{}",
                            if buf.name.is_empty() { "call" } else { buf.name.as_str() },
                            &Uuid::new_v4().simple().to_string()[..8]
                        );
                        warn!(
                            tool_name = %buf.name,
                            id = %synthesized,
                            "tool call arrived without an id; synthesized one"
                        );
                        synthesized
                    } else {
                        buf.id
                    };
                    call_index += 1;
                    parts.push(Part::tool_call(id, buf.name, arguments));
                }
            }
        }

        Ok(ChatMessage {
            role: Role::Model,
            parts,
            metadata: self.metadata,
        })
    }
}

fn resolve_arguments(buf: &CallBuf) -> Result<Value, ToolArgumentParseError> {
    if !buf.fragments.is_empty() {
        return match serde_json::from_str::<Value>(&buf.fragments) {
            Ok(Value::Null) => Ok(Value::Object(Map::new())),
            Ok(v @ Value::Object(_)) => Ok(v),
            Ok(_) => Err(ToolArgumentParseError {
                name: buf.name.clone(),
                buffer: buf.fragments.clone(),
                reason: "arguments must be a JSON object".into(),
            }),
            Err(e) => Err(ToolArgumentParseError {
                name: buf.name.clone(),
                buffer: buf.fragments.clone(),
                reason: e.to_string(),
            }),
        };
    }
    match &buf.parsed {
        Some(Value::Null) | None => Ok(Value::Object(Map::new())),
        Some(v) => Ok(v.clone()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
