// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde_json::{Map, Value};

use freja_model::ChatMessage;
use freja_tools::ToolMap;

use crate::accumulator::StreamAccumulator;

/// A tool call the model has made, kept for call↔result correlation.
#[derive(Debug, Clone)]
pub struct OpenToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Mutable workspace scoped to one `Agent::send_stream` call.
///
/// The orchestrator resets the accumulator at the start of every iteration
/// and appends to `history` as turns complete; nothing here is shared
/// between concurrent invocations.
pub struct StreamingState {
    /// The growing conversation, including messages appended this run.
    pub history: Vec<ChatMessage>,
    pub accumulator: StreamAccumulator,
    pub tools: ToolMap,
    /// Calls made so far this run, keyed by call id.
    pub open_calls: HashMap<String, OpenToolCall>,
    /// Set after a tool round so the next iteration's first text chunk is
    /// prefixed with a newline and the rendered conversation reads
    /// coherently.
    pub should_prefix_next_message: bool,
    /// Typed-output mode: text buffered from a suppressed result-tool turn.
    pub suppressed_text: String,
    /// Typed-output mode: metadata buffered from a suppressed turn.
    pub suppressed_metadata: Map<String, Value>,
}

impl StreamingState {
    pub fn new(history: Vec<ChatMessage>, tools: ToolMap) -> Self {
        Self {
            history,
            accumulator: StreamAccumulator::new(),
            tools,
            open_calls: HashMap::new(),
            should_prefix_next_message: false,
            suppressed_text: String::new(),
            suppressed_metadata: Map::new(),
        }
    }
}
