// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

/// A named callable the model can invoke.
///
/// `input_schema` is a JSON Schema object describing the argument shape;
/// an empty-properties schema means the tool takes no arguments.  Handlers
/// return arbitrary JSON or a string; errors are converted into structured
/// result payloads by the executor, never rethrown to the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the argument object.
    fn input_schema(&self) -> Value;
    /// Execute the tool with decoded arguments.
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A [`Tool`] built from an async closure.
///
/// ```ignore
/// let weather = FunctionTool::new(
///     "weather",
///     "Look up the weather for a zip code",
///     json!({ "type": "object", "properties": { "zip": { "type": "string" } } }),
///     |args| async move { Ok(json!({ "tempF": 70 })) },
/// );
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    handler: Handler,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.handler)(args).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
