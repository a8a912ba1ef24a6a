// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Dispatches tool calls and turns every outcome (success, unknown tool,
//! handler failure) into a result part the model can react to.

use serde_json::{json, Value};
use tracing::{debug, warn};

use freja_model::Part;
use freja_tools::ToolMap;

/// One call to dispatch, extracted from a consolidated model turn.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Run `calls` sequentially, in input order.
///
/// Sequential dispatch is deliberate: providers do not reliably correlate
/// parallel results, and ordering here is what keeps result parts aligned
/// with their calls in the history.  Always returns exactly one result
/// part per input call; failures become `{"error": ...}` payloads and are
/// never rethrown.
pub async fn execute_batch(calls: &[ToolCallRequest], tools: &ToolMap) -> Vec<Part> {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let result = match tools.get(&call.name) {
            None => {
                warn!(tool_name = %call.name, call_id = %call.id, "model called an unknown tool");
                json!({ "error": format!("Tool {} not found", call.name) })
            }
            Some(tool) => {
                debug!(tool_name = %call.name, call_id = %call.id, "executing tool");
                match tool.call(call.arguments.clone()).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(tool_name = %call.name, error = %e, "tool handler failed");
                        json!({ "error": e.to_string() })
                    }
                }
            }
        };
        results.push(Part::tool_result(&call.id, &call.name, result));
    }
    results
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use freja_tools::FunctionTool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn map_with(tools: Vec<FunctionTool>) -> ToolMap {
        ToolMap::new(
            tools
                .into_iter()
                .map(|t| Arc::new(t) as Arc<dyn freja_tools::Tool>),
        )
        .unwrap()
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest { id: id.into(), name: name.into(), arguments: args }
    }

    #[tokio::test]
    async fn success_stores_handler_value() {
        let tools = map_with(vec![FunctionTool::new(
            "weather",
            "look up",
            json!({"type": "object"}),
            |_| async { Ok(json!({"tempF": 70})) },
        )]);
        let out = execute_batch(&[call("c1", "weather", json!({"zip": "97209"}))], &tools).await;
        assert_eq!(
            out,
            vec![Part::tool_result("c1", "weather", json!({"tempF": 70}))]
        );
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let out = execute_batch(&[call("c1", "nope", json!({}))], &ToolMap::empty()).await;
        match &out[0] {
            Part::ToolResult { id, result, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(result["error"], "Tool nope not found");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let tools = map_with(vec![FunctionTool::new(
            "boom",
            "always fails",
            json!({"type": "object"}),
            |_| async { anyhow::bail!("service unavailable") },
        )]);
        let out = execute_batch(&[call("c1", "boom", json!({}))], &tools).await;
        match &out[0] {
            Part::ToolResult { result, .. } => {
                assert_eq!(result["error"], "service unavailable");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_result_per_call_in_input_order() {
        let tools = map_with(vec![FunctionTool::new(
            "echo",
            "echoes",
            json!({"type": "object"}),
            |args| async move { Ok(args) },
        )]);
        let calls = vec![
            call("a", "echo", json!({"n": 1})),
            call("b", "missing", json!({})),
            call("c", "echo", json!({"n": 3})),
        ];
        let out = execute_batch(&calls, &tools).await;
        assert_eq!(out.len(), 3);
        let ids: Vec<&str> = out
            .iter()
            .map(|p| match p {
                Part::ToolResult { id, .. } => id.as_str(),
                _ => panic!("non-result part"),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn calls_run_sequentially() {
        // Each handler observes the counter before incrementing it; with
        // sequential dispatch the observed values are strictly increasing.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let tools = map_with(vec![FunctionTool::new(
            "tick",
            "counts invocations",
            json!({"type": "object"}),
            move |_| {
                let c = Arc::clone(&c);
                async move {
                    let seen = c.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "seen": seen }))
                }
            },
        )]);
        let calls: Vec<ToolCallRequest> =
            (0..4).map(|i| call(&format!("c{i}"), "tick", json!({}))).collect();
        let out = execute_batch(&calls, &tools).await;
        for (i, p) in out.iter().enumerate() {
            match p {
                Part::ToolResult { result, .. } => assert_eq!(result["seen"], i),
                _ => panic!("non-result part"),
            }
        }
    }

    #[tokio::test]
    async fn string_results_stay_strings() {
        let tools = map_with(vec![FunctionTool::new(
            "date",
            "current date",
            json!({"type": "object"}),
            |_| async { Ok(json!("2025-01-02")) },
        )]);
        let out = execute_batch(&[call("c1", "date", json!({}))], &tools).await;
        match &out[0] {
            Part::ToolResult { result, .. } => assert_eq!(result, &json!("2025-01-02")),
            other => panic!("unexpected part: {other:?}"),
        }
    }
}
