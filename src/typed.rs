// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Structured-output orchestration.
//!
//! Providers that combine tools with native structured output stream the
//! JSON answer as ordinary text.  For every other provider the façade
//! injects a synthetic `return_result` tool whose schema is the caller's
//! output schema; this orchestrator then suppresses raw text, intercepts
//! the `return_result` call, and emits one synthetic model message whose
//! single text part is the serialized result.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use freja_model::{json_to_text, ChatMessage, ChatModel, FinishReason, Part};

use crate::{
    executor::execute_batch,
    orchestrator::{
        call_requests, register_calls, stream_round, Orchestrator, RoundOutcome,
        StreamingIterationResult,
    },
    state::StreamingState,
};

/// Name of the synthetic tool used to extract a structured answer from
/// providers without native schema support.
pub const RETURN_RESULT_TOOL: &str = "return_result";

/// Metadata key on the synthetic final message that carries any free-form
/// text the model emitted alongside its `return_result` call.
pub const SUPPRESSED_TEXT_KEY: &str = "suppressed_text";

/// The agent loop variant for calls that carry an output schema.
#[derive(Debug)]
pub struct TypedOrchestrator {
    schema: Value,
    uses_return_result: bool,
}

impl TypedOrchestrator {
    /// Native mode: the provider applies the schema itself and the JSON
    /// answer streams through as text.
    pub fn native(schema: Value) -> Self {
        Self { schema, uses_return_result: false }
    }

    /// Emulated mode: `return_result` is in the tool set and raw text is
    /// suppressed until it fires.
    pub fn with_return_result(schema: Value) -> Self {
        Self { schema, uses_return_result: true }
    }
}

#[async_trait]
impl Orchestrator for TypedOrchestrator {
    async fn process_iteration(
        &mut self,
        model: &dyn ChatModel,
        state: &mut StreamingState,
        emit: &mpsc::Sender<StreamingIterationResult>,
    ) -> anyhow::Result<StreamingIterationResult> {
        let schema = if self.uses_return_result { None } else { Some(&self.schema) };
        let surface_text = !self.uses_return_result;

        let round = stream_round(model, state, schema, surface_text, emit).await?;
        let RoundOutcome { message, finish_reason, usage } = round;

        // Trailing empties (some providers send an empty final message
        // after the result call) are discarded, never emitted.
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

        let calls = call_requests(&message);

        if calls.is_empty() {
            // The model answered in text.  In emulated mode that text was
            // never streamed, so surface it here as best-effort output.
            state.history.push(message.clone());
            let output = if self.uses_return_result { message.text() } else { String::new() };
            return Ok(StreamingIterationResult {
                output,
                messages: vec![message],
                should_continue: false,
                finish_reason,
                metadata: Map::new(),
                usage,
            });
        }

        let has_result_call = calls.iter().any(|c| c.name == RETURN_RESULT_TOOL);
        if !has_result_call {
            // An ordinary tool round; behave exactly like the default loop.
            state.history.push(message.clone());
            register_calls(state, &calls);
            let results = execute_batch(&calls, &state.tools).await;
            let tool_message = ChatMessage::tool_results(results);
            state.history.push(tool_message.clone());
            state.should_prefix_next_message = true;
            return Ok(StreamingIterationResult {
                output: String::new(),
                messages: vec![message, tool_message],
                should_continue: true,
                finish_reason,
                metadata: Map::new(),
                usage,
            });
        }

        debug!("model called the result tool; emitting synthetic final message");

        // Suppress the call turn: buffer its text and metadata instead of
        // emitting it as a model turn.
        state.suppressed_text.push_str(&message.text());
        for (k, v) in &message.metadata {
            state.suppressed_metadata.insert(k.clone(), v.clone());
        }

        register_calls(state, &calls);
        let results = execute_batch(&calls, &state.tools).await;

        // The result tool's payload is the JSON document; other tools in
        // the same batch feed back into history normally.
        let mut result_text = String::new();
        let mut other_results: Vec<Part> = Vec::new();
        for part in results {
            match &part {
                Part::ToolResult { name, result, .. } if name == RETURN_RESULT_TOOL => {
                    result_text = json_to_text(result);
                }
                _ => other_results.push(part),
            }
        }

        let mut messages = Vec::new();
        if !other_results.is_empty() {
            let tool_message = ChatMessage::tool_results(other_results);
            state.history.push(tool_message.clone());
            messages.push(tool_message);
        }

        let mut metadata = state.suppressed_metadata.clone();
        if !state.suppressed_text.is_empty() {
            metadata.insert(SUPPRESSED_TEXT_KEY.into(), json!(state.suppressed_text));
        }
        let synthetic =
            ChatMessage::model(vec![Part::text(result_text.clone())]).with_metadata(metadata.clone());
        state.history.push(synthetic.clone());
        messages.push(synthetic);

        Ok(StreamingIterationResult {
            output: result_text,
            messages,
            should_continue: false,
            finish_reason: FinishReason::Stop,
            metadata,
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
    use freja_tools::{FunctionTool, Tool, ToolMap};
    use serde_json::json;
    use std::sync::Arc;

    fn town_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "town": { "type": "string" },
                "country": { "type": "string" }
            }
        })
    }

    fn return_result_tool(schema: Value) -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            RETURN_RESULT_TOOL,
            "Report the final result",
            schema,
            |args| async move { Ok(args) },
        ))
    }

    fn rr_state() -> StreamingState {
        let tools = ToolMap::new([return_result_tool(town_schema())]).unwrap();
        StreamingState::new(vec![ChatMessage::user("The windy city")], tools)
    }

    #[tokio::test]
    async fn return_result_call_produces_synthetic_message() {
        let model = ScriptedChatModel::new(vec![vec![
            call_chunk("c1", RETURN_RESULT_TOOL),
            args_chunk("c1", r#"{"town":"Chicago","country":"USA"}"#),
            finish_chunk(FinishReason::ToolCalls),
        ]]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = rr_state();
        let mut orch = TypedOrchestrator::with_return_result(town_schema());

        let result = orch.process_iteration(&model, &mut state, &tx).await.unwrap();

        assert!(!result.should_continue);
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(parsed["town"], "Chicago");

        // Exactly one synthetic model message with a single text part.
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].parts.len(), 1);
        assert_eq!(result.messages[0].text(), result.output);

        // No raw streaming happened.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn text_is_suppressed_during_streaming_and_kept_in_metadata() {
        let model = ScriptedChatModel::new(vec![vec![
            text_chunk("Let me report that. "),
            call_chunk("c1", RETURN_RESULT_TOOL),
            args_chunk("c1", r#"{"town":"Chicago"}"#),
            finish_chunk(FinishReason::ToolCalls),
        ]]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = rr_state();
        let mut orch = TypedOrchestrator::with_return_result(town_schema());

        let result = orch.process_iteration(&model, &mut state, &tx).await.unwrap();

        assert!(rx.try_recv().is_err(), "no text may stream in emulated mode");
        assert_eq!(
            result.messages[0].metadata[SUPPRESSED_TEXT_KEY],
            json!("Let me report that. ")
        );
        assert!(!result.output.contains("Let me report"));
    }

    #[tokio::test]
    async fn emulated_mode_passes_no_schema_to_the_model() {
        let model = ScriptedChatModel::new(vec![vec![
            call_chunk("c1", RETURN_RESULT_TOOL),
            args_chunk("c1", "{}"),
            finish_chunk(FinishReason::ToolCalls),
        ]]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = rr_state();
        TypedOrchestrator::with_return_result(town_schema())
            .process_iteration(&model, &mut state, &tx)
            .await
            .unwrap();
        assert!(model.last_request().unwrap().output_schema.is_none());
    }

    #[tokio::test]
    async fn native_mode_streams_schema_and_text_through() {
        let model = ScriptedChatModel::new(vec![vec![
            text_chunk(r#"{"town":"Chicago","#),
            text_chunk(r#""country":"USA"}"#),
            finish_chunk(FinishReason::Stop),
        ]]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = StreamingState::new(vec![ChatMessage::user("The windy city")], ToolMap::empty());
        let mut orch = TypedOrchestrator::native(town_schema());

        let result = orch.process_iteration(&model, &mut state, &tx).await.unwrap();

        assert!(!result.should_continue);
        assert_eq!(model.last_request().unwrap().output_schema, Some(town_schema()));

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk.output);
        }
        let parsed: Value = serde_json::from_str(&streamed).unwrap();
        assert_eq!(parsed["country"], "USA");
    }

    #[tokio::test]
    async fn user_tools_run_before_the_result_call() {
        let weather: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "weather",
            "look up",
            json!({"type": "object"}),
            |_| async { Ok(json!({"tempF": 70})) },
        ));
        let tools = ToolMap::new([weather, return_result_tool(town_schema())]).unwrap();
        let model = ScriptedChatModel::new(vec![
            vec![
                call_chunk("c1", "weather"),
                args_chunk("c1", "{}"),
                finish_chunk(FinishReason::ToolCalls),
            ],
            vec![
                call_chunk("c2", RETURN_RESULT_TOOL),
                args_chunk("c2", r#"{"town":"Portland"}"#),
                finish_chunk(FinishReason::ToolCalls),
            ],
        ]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = StreamingState::new(vec![ChatMessage::user("q")], tools);
        let mut orch = TypedOrchestrator::with_return_result(town_schema());

        let first = orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        assert!(first.should_continue, "ordinary tool round keeps looping");
        assert_eq!(first.messages.len(), 2);

        let second = orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        assert!(!second.should_continue);
        let parsed: Value = serde_json::from_str(&second.output).unwrap();
        assert_eq!(parsed["town"], "Portland");
    }

    #[tokio::test]
    async fn missing_result_call_falls_back_to_model_text() {
        let model = ScriptedChatModel::new(vec![vec![
            text_chunk("I cannot produce structured output."),
            finish_chunk(FinishReason::Stop),
        ]]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut state = rr_state();
        let mut orch = TypedOrchestrator::with_return_result(town_schema());

        let result = orch.process_iteration(&model, &mut state, &tx).await.unwrap();

        assert!(!result.should_continue);
        assert_eq!(result.output, "I cannot produce structured output.");
        assert!(rx.try_recv().is_err(), "fallback text arrives in the final result only");
    }

    #[tokio::test]
    async fn trailing_empty_message_is_discarded() {
        let model = ScriptedChatModel::new(vec![vec![finish_chunk(FinishReason::Stop)]]);
        let (tx, _rx) = mpsc::channel(32);
        let mut state = rr_state();
        let mut orch = TypedOrchestrator::with_return_result(town_schema());

        let result = orch.process_iteration(&model, &mut state, &tx).await.unwrap();
        assert!(!result.should_continue);
        assert!(result.messages.is_empty());
        assert!(result.output.is_empty());
    }

}
