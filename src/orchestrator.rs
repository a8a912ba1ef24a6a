// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: stream → accumulate → dispatch tools → feed results
//! back → stream again, until the model stops calling tools.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use freja_model::{ChatMessage, ChatModel, FinishReason, Part, Usage};

use crate::{
    accumulator::StreamAccumulator,
    executor::{execute_batch, ToolCallRequest},
    state::{OpenToolCall, StreamingState},
};

/// What one step of the agent loop produced.
///
/// `output` is the text to surface to the caller; `messages` are new
/// messages added to both the emitted stream and the orchestrator's
/// internal history (no double-add).  `should_continue` tells the outer
/// loop whether to run another iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingIterationResult {
    pub output: String,
    pub messages: Vec<ChatMessage>,
    pub should_continue: bool,
    pub finish_reason: FinishReason,
    pub metadata: Map<String, Value>,
    pub usage: Usage,
}

impl StreamingIterationResult {
    /// An intermediate text chunk emitted while the provider streams.
    pub(crate) fn text_chunk(output: String) -> Self {
        Self {
            output,
            messages: Vec::new(),
            should_continue: true,
            finish_reason: FinishReason::Unspecified,
            metadata: Map::new(),
            usage: Usage::default(),
        }
    }
}

/// Drives one round trip to the provider per call.
///
/// Intermediate chunks (streamed text) go through `emit`; the returned
/// value is the iteration's final result, which the façade also forwards.
/// The façade invokes `process_iteration` until `should_continue` is
/// false.
#[async_trait]
pub trait Orchestrator: Send {
    async fn process_iteration(
        &mut self,
        model: &dyn ChatModel,
        state: &mut StreamingState,
        emit: &mpsc::Sender<StreamingIterationResult>,
    ) -> anyhow::Result<StreamingIterationResult>;
}

/// Everything a provider round trip produced once the stream ended.
pub(crate) struct RoundOutcome {
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Stream one completion from the model, accumulating deltas into a
/// consolidated message.
///
/// When `surface_text` is set, text parts are emitted to the caller as
/// they arrive, with the first chunk after a tool round prefixed by a
/// newline.  Typed-output emulation streams with `surface_text` off.
pub(crate) async fn stream_round(
    model: &dyn ChatModel,
    state: &mut StreamingState,
    output_schema: Option<&Value>,
    surface_text: bool,
    emit: &mpsc::Sender<StreamingIterationResult>,
) -> anyhow::Result<RoundOutcome> {
    state.accumulator = StreamAccumulator::new();
    let mut finish_reason = FinishReason::Unspecified;
    let mut usage = Usage::default();

    let mut stream = model.send_stream(&state.history, output_schema).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        usage.merge(&chunk.usage);
        if chunk.finish_reason != FinishReason::Unspecified {
            finish_reason = chunk.finish_reason;
        }
        if surface_text {
            let mut text = chunk.output.text();
            if !text.is_empty() {
                if state.should_prefix_next_message {
                    text.insert(0, '\n');
                    state.should_prefix_next_message = false;
                }
                if emit
                    .send(StreamingIterationResult::text_chunk(text))
                    .await
                    .is_err()
                {
                    anyhow::bail!("output stream closed by caller");
                }
            }
        }
        state.accumulator.merge_metadata(&chunk.metadata);
        state.accumulator.accumulate(&chunk.output);
    }

    let accumulator = std::mem::take(&mut state.accumulator);
    let message = accumulator.consolidate()?;
    Ok(RoundOutcome { message, finish_reason, usage })
}

/// Extract the dispatchable calls from a consolidated model turn.
pub(crate) fn call_requests(message: &ChatMessage) -> Vec<ToolCallRequest> {
    message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolCall { id, name, arguments, .. } => Some(ToolCallRequest {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Record the calls of a batch in the state's open-calls map.
pub(crate) fn register_calls(state: &mut StreamingState, calls: &[ToolCallRequest]) {
    for c in calls {
        state.open_calls.insert(
            c.id.clone(),
            OpenToolCall { name: c.name.clone(), arguments: c.arguments.clone() },
        );
    }
}

/// The plain agent loop, used when the caller requested no output schema.
#[derive(Debug, Default)]
pub struct DefaultOrchestrator;

#[async_trait]
impl Orchestrator for DefaultOrchestrator {
    async fn process_iteration(
        &mut self,
        model: &dyn ChatModel,
        state: &mut StreamingState,
        emit: &mpsc::Sender<StreamingIterationResult>,
    ) -> anyhow::Result<StreamingIterationResult> {
        let round = stream_round(model, state, None, true, emit).await?;
        let RoundOutcome { message, finish_reason, usage } = round;

        if message.parts.is_empty() {
            return Ok(StreamingIterationResult {
                output: String::new(),
                messages: Vec::new(),
                should_continue: false,
                finish_reason,
                metadata: Map::new(),
                usage,
            });
        }

        state.history.push(message.clone());

        let calls = call_requests(&message);
        if calls.is_empty() {
            return Ok(StreamingIterationResult {
                output: String::new(),
                messages: vec![message],
                should_continue: false,
                finish_reason,
                metadata: Map::new(),
                usage,
            });
        }

        debug!(count = calls.len(), "model requested tool calls");
        register_calls(state, &calls);
        let results = execute_batch(&calls, &state.tools).await;
        let tool_message = ChatMessage::tool_results(results);
        state.history.push(tool_message.clone());
        state.should_prefix_next_message = true;

        Ok(StreamingIterationResult {
            output: String::new(),
            messages: vec![message, tool_message],
            should_continue: true,
            finish_reason,
            metadata: Map::new(),
            usage,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use freja_model::mock::{
        args_chunk, call_chunk, finish_chunk, text_chunk, ScriptedChatModel,
    };
    use freja_model::Role;
    use freja_tools::{FunctionTool, ToolMap};
    use serde_json::json;
    use std::sync::Arc;

    fn weather_tools() -> ToolMap {
        ToolMap::new([Arc::new(FunctionTool::new(
            "weather",
            "look up the weather",
            json!({"type": "object", "properties": {"zip": {"type": "string"}}}),
            |_| async { Ok(json!({"tempF": 70})) },
        )) as Arc<dyn freja_tools::Tool>])
        .unwrap()
    }

    fn state_with(tools: ToolMap) -> StreamingState {
        StreamingState::new(vec![ChatMessage::user("Weather in 97209?")], tools)
    }

    async fn drain(
        rx: &mut mpsc::Receiver<StreamingIterationResult>,
    ) -> Vec<StreamingIterationResult> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn text_only_round_terminates() {
        let model = ScriptedChatModel::always_text("hi there");
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = state_with(ToolMap::empty());

        let result = DefaultOrchestrator
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap();

        assert!(!result.should_continue);
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].text(), "hi there");

        let streamed = drain(&mut rx).await;
        let text: String = streamed.iter().map(|c| c.output.as_str()).collect();
        assert_eq!(text, "hi there");

        // The consolidated turn landed in history.
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].role, Role::Model);
    }

    #[tokio::test]
    async fn tool_round_appends_call_and_result_turns() {
        let model = ScriptedChatModel::new(vec![vec![
            call_chunk("c1", "weather"),
            args_chunk("c1", r#"{"zip":"97209"}"#),
            finish_chunk(FinishReason::ToolCalls),
        ]]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = state_with(weather_tools());

        let result = DefaultOrchestrator
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap();

        assert!(result.should_continue);
        assert_eq!(result.messages.len(), 2, "model turn plus tool-result turn");
        assert_eq!(
            result.messages[1].parts,
            vec![Part::tool_result("c1", "weather", json!({"tempF": 70}))]
        );
        assert_eq!(state.history.len(), 3);
        assert!(state.should_prefix_next_message);
        assert_eq!(state.open_calls["c1"].name, "weather");
    }

    #[tokio::test]
    async fn next_iteration_prefixes_text_with_newline() {
        let model = ScriptedChatModel::new(vec![
            vec![
                call_chunk("c1", "weather"),
                args_chunk("c1", "{}"),
                finish_chunk(FinishReason::ToolCalls),
            ],
            vec![text_chunk("It is 70F."), finish_chunk(FinishReason::Stop)],
        ]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = state_with(weather_tools());
        let mut orch = DefaultOrchestrator;

        let first = orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        assert!(first.should_continue);
        let second = orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        assert!(!second.should_continue);

        let streamed = drain(&mut rx).await;
        let text: String = streamed.iter().map(|c| c.output.as_str()).collect();
        assert_eq!(text, "\nIt is 70F.", "first text after a tool round gets a newline");
        // History text stays unprefixed.
        assert_eq!(state.history.last().unwrap().text(), "It is 70F.");
    }

    #[tokio::test]
    async fn empty_final_round_emits_no_message() {
        let model = ScriptedChatModel::new(vec![vec![finish_chunk(FinishReason::Stop)]]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = state_with(ToolMap::empty());

        let result = DefaultOrchestrator
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap();

        assert!(!result.should_continue);
        assert!(result.messages.is_empty());
        assert_eq!(state.history.len(), 1, "empty turns never enter history");
    }

    #[tokio::test]
    async fn malformed_call_arguments_are_fatal() {
        let model = ScriptedChatModel::new(vec![vec![
            call_chunk("c1", "weather"),
            args_chunk("c1", "{\"zip\": nope"),
            finish_chunk(FinishReason::ToolCalls),
        ]]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = state_with(weather_tools());

        let err = DefaultOrchestrator
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap_err();
        assert!(err
            .downcast_ref::<crate::error::ToolArgumentParseError>()
            .is_some());
    }

    #[tokio::test]
    async fn usage_accumulates_across_chunks() {
        let model = ScriptedChatModel::always_text("ok");
        let (tx, _rx) = mpsc::channel(32);
        let mut state = state_with(ToolMap::empty());

        let result = DefaultOrchestrator
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap();
        assert_eq!(result.usage.prompt_tokens, Some(10));
        assert_eq!(result.usage.response_tokens, Some(10));
    }

    #[tokio::test]
    async fn request_carries_growing_history() {
        let model = ScriptedChatModel::new(vec![
            vec![
                call_chunk("c1", "weather"),
                args_chunk("c1", "{}"),
                finish_chunk(FinishReason::ToolCalls),
            ],
            vec![text_chunk("done"), finish_chunk(FinishReason::Stop)],
        ]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = state_with(weather_tools());
        let mut orch = DefaultOrchestrator;

        orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        orch.process_iteration(&model, &mut state, &tx).await.unwrap();

        let second_request = model.last_request().unwrap();
        // user + model call turn + tool results = 3 messages on round two.
        assert_eq!(second_request.messages.len(), 3);
        assert!(second_request.messages[1].has_tool_calls());
    }
}
