// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The public entry point: an [`Agent`] binds a provider, a chat model
//! name, and a tool set to a conversation and drives the orchestrator to
//! exhaustion.

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use freja_config::Environment;
use freja_model::{
    parse_model_string, resolve_provider, Capability, ChatMessage, ChatModel, ChatModelOptions,
    ChatResult, EmbeddingKind, FinishReason, Part, Provider, Role, ToolSchema, Usage,
};
use freja_tools::{FunctionTool, Tool, ToolMap};

use crate::{
    orchestrator::{DefaultOrchestrator, Orchestrator, StreamingIterationResult},
    state::StreamingState,
    typed::{TypedOrchestrator, RETURN_RESULT_TOOL},
};

/// Where an agent's chat model comes from.
#[derive(Clone)]
enum ModelSource {
    /// Resolved through the provider registry; the agent owns the model's
    /// lifecycle and disposes it when each stream ends.
    Registry {
        provider: &'static Provider,
        chat_model: Option<String>,
        embeddings_model: Option<String>,
    },
    /// A caller-supplied model.  The caller owns its lifecycle.
    Custom {
        model: Arc<dyn ChatModel>,
        caps: &'static [Capability],
    },
}

/// Per-call options for [`Agent::send`] / [`Agent::send_stream`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Prior conversation; may start with a system message.
    pub history: Vec<ChatMessage>,
    /// Attachments appended to the prompt's user message.
    pub attachments: Vec<Part>,
    /// JSON Schema the final answer must conform to.
    pub output_schema: Option<Value>,
}

/// Façade binding a provider, a chat model, and a tool set.
///
/// ```ignore
/// let agent = Agent::new("openai:gpt-4o")?.with_tools(vec![weather]);
/// let result = agent.send("Weather in 97209?", SendOptions::default()).await?;
/// ```
#[derive(Clone)]
pub struct Agent {
    source: ModelSource,
    tools: Vec<Arc<dyn Tool>>,
    temperature: Option<f32>,
    instructions: Option<String>,
    env: Environment,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("tools", &self.tools.len())
            .field("temperature", &self.temperature)
            .field("instructions", &self.instructions)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build an agent from a model string (`provider`, `provider:model`,
    /// `provider/model`, or `provider?chat=X&embeddings=Y`).
    pub fn new(model: &str) -> anyhow::Result<Self> {
        let parts = parse_model_string(model)?;
        let provider = resolve_provider(&parts.provider)?;
        Ok(Self {
            source: ModelSource::Registry {
                provider,
                chat_model: parts.chat_model,
                embeddings_model: parts.embeddings_model,
            },
            tools: Vec::new(),
            temperature: None,
            instructions: None,
            env: Environment::new(),
        })
    }

    /// Build an agent around a caller-owned [`ChatModel`].
    ///
    /// `caps` drives the typed-output strategy exactly as a registry
    /// entry's capability set would.  The model is not disposed by the
    /// agent.
    pub fn for_chat_model(model: Arc<dyn ChatModel>, caps: &'static [Capability]) -> Self {
        Self {
            source: ModelSource::Custom { model, caps },
            tools: Vec::new(),
            temperature: None,
            instructions: None,
            env: Environment::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// A system message prepended when the supplied history does not
    /// already start with one.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// The provider this agent resolves through, when registry-bound.
    pub fn provider(&self) -> Option<&'static Provider> {
        match &self.source {
            ModelSource::Registry { provider, .. } => Some(provider),
            ModelSource::Custom { .. } => None,
        }
    }

    /// Stream the agent loop.
    ///
    /// Concatenating `output` across the emitted chunks yields the text
    /// the user sees; concatenating `messages` yields the new-message
    /// transcript with no duplicates.  Dropping the stream abandons the
    /// in-flight provider stream and disposes the model.
    pub fn send_stream(
        &self,
        prompt: &str,
        opts: SendOptions,
    ) -> ReceiverStream<anyhow::Result<ChatResult<String>>> {
        let (tx, rx) = mpsc::channel(32);
        let agent = self.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            agent.run_stream(prompt, opts, tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Drain [`send_stream`](Self::send_stream) and concatenate the text.
    pub async fn send(&self, prompt: &str, opts: SendOptions) -> anyhow::Result<ChatResult<String>> {
        let mut stream = self.send_stream(prompt, opts);
        let mut id = String::new();
        let mut output = String::new();
        let mut messages = Vec::new();
        let mut finish_reason = FinishReason::Unspecified;
        let mut metadata = Map::new();
        let mut usage = Usage::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            id = chunk.id;
            output.push_str(&chunk.output);
            messages.extend(chunk.messages);
            if chunk.finish_reason != FinishReason::Unspecified {
                finish_reason = chunk.finish_reason;
            }
            for (k, v) in chunk.metadata {
                metadata.insert(k, v);
            }
            usage.merge(&chunk.usage);
        }

        Ok(ChatResult { id, output, messages, finish_reason, metadata, usage })
    }

    /// Request `output_schema`-shaped output and decode the final text.
    pub async fn send_for<T: DeserializeOwned>(
        &self,
        prompt: &str,
        output_schema: Value,
        mut opts: SendOptions,
    ) -> anyhow::Result<ChatResult<T>> {
        opts.output_schema = Some(output_schema);
        let result = self.send(prompt, opts).await?;
        let decoded: T = serde_json::from_str(&result.output)
            .with_context(|| format!("typed output did not decode: {:?}", result.output))?;
        Ok(ChatResult {
            id: result.id,
            output: decoded,
            messages: result.messages,
            finish_reason: result.finish_reason,
            metadata: result.metadata,
            usage: result.usage,
        })
    }

    /// Embed `text` with the provider's embeddings model.
    pub async fn create_embedding(
        &self,
        text: &str,
        kind: EmbeddingKind,
    ) -> anyhow::Result<Vec<f32>> {
        match &self.source {
            ModelSource::Registry { provider, embeddings_model, .. } => {
                let model =
                    provider.create_embeddings_model(embeddings_model.as_deref(), &self.env)?;
                model.embed(text, kind).await
            }
            ModelSource::Custom { .. } => {
                anyhow::bail!("agent was built from a chat model directly; no embeddings provider bound")
            }
        }
    }

    fn caps(&self) -> &'static [Capability] {
        match &self.source {
            ModelSource::Registry { provider, .. } => provider.caps,
            ModelSource::Custom { caps, .. } => caps,
        }
    }

    /// The spawned driver: sets up tools, history, model, and orchestrator,
    /// then loops until an iteration says stop.
    async fn run_stream(
        self,
        prompt: String,
        opts: SendOptions,
        tx: mpsc::Sender<anyhow::Result<ChatResult<String>>>,
    ) {
        let run_id = Uuid::new_v4().to_string();

        let uses_return_result = opts.output_schema.is_some()
            && !self.caps().contains(&Capability::TypedOutputWithTools);

        // Effective tool set: the caller's tools, plus the synthetic
        // result tool when this provider cannot combine tools with native
        // structured output.
        let mut tools = self.tools.clone();
        if uses_return_result {
            if let Some(schema) = &opts.output_schema {
                tools.push(make_return_result_tool(schema.clone()));
            }
        }
        let tool_map = match ToolMap::new(tools) {
            Ok(map) => map,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let schemas: Vec<ToolSchema> = tool_map
            .iter_sorted()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect();

        let (model, owned): (Arc<dyn ChatModel>, bool) = match &self.source {
            ModelSource::Registry { provider, chat_model, .. } => {
                let created = provider.create_chat_model(
                    ChatModelOptions {
                        model: chat_model.clone(),
                        tools: schemas,
                        temperature: self.temperature,
                    },
                    &self.env,
                );
                match created {
                    Ok(m) => (Arc::from(m), true),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            ModelSource::Custom { model, .. } => (Arc::clone(model), false),
        };

        // Initial history: instructions, prior turns, then the prompt.
        let mut history: Vec<ChatMessage> = Vec::with_capacity(opts.history.len() + 2);
        if let Some(instructions) = &self.instructions {
            let starts_with_system =
                opts.history.first().map(|m| m.role == Role::System).unwrap_or(false);
            if !starts_with_system {
                history.push(ChatMessage::system(instructions.clone()));
            }
        }
        history.extend(opts.history);
        let mut user_parts = vec![Part::text(prompt)];
        user_parts.extend(opts.attachments);
        history.push(ChatMessage::user_with_parts(user_parts));

        let mut orchestrator: Box<dyn Orchestrator> = match opts.output_schema {
            None => Box::new(DefaultOrchestrator),
            Some(schema) if uses_return_result => {
                Box::new(TypedOrchestrator::with_return_result(schema))
            }
            Some(schema) => Box::new(TypedOrchestrator::native(schema)),
        };

        let mut state = StreamingState::new(history, tool_map);

        debug!(run_id = %run_id, typed = uses_return_result, "starting agent stream");

        // Forward iteration results to the caller as ChatResult<String>.
        let (itx, mut irx) = mpsc::channel::<StreamingIterationResult>(32);
        let forward_tx = tx.clone();
        let forward_id = run_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(sir) = irx.recv().await {
                let chunk = ChatResult {
                    id: forward_id.clone(),
                    output: sir.output,
                    messages: sir.messages,
                    finish_reason: sir.finish_reason,
                    metadata: sir.metadata,
                    usage: sir.usage,
                };
                if forward_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });

        let mut error: Option<anyhow::Error> = None;
        loop {
            match orchestrator
                .process_iteration(model.as_ref(), &mut state, &itx)
                .await
            {
                Ok(result) => {
                    let done = !result.should_continue;
                    if itx.send(result).await.is_err() {
                        break;
                    }
                    if done {
                        break;
                    }
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        drop(itx);
        let _ = forwarder.await;
        if owned {
            model.dispose().await;
        }
        if let Some(e) = error {
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// The synthetic tool injected for providers that cannot combine tools
/// with native structured output.  Its schema is the caller's output
/// schema and its handler returns the arguments verbatim.
fn make_return_result_tool(schema: Value) -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        RETURN_RESULT_TOOL,
        "Call this with the final result of the task. \
         The arguments must match the requested output format exactly.",
        schema,
        |args| async move { Ok(args) },
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use freja_model::ModelError;

    #[test]
    fn new_resolves_provider_and_model() {
        let agent = Agent::new("openai:gpt-4o-mini").unwrap();
        assert_eq!(agent.provider().unwrap().name, "openai");
        match &agent.source {
            ModelSource::Registry { chat_model, .. } => {
                assert_eq!(chat_model.as_deref(), Some("gpt-4o-mini"));
            }
            _ => panic!("expected registry source"),
        }
    }

    #[test]
    fn new_accepts_alias() {
        let agent = Agent::new("claude").unwrap();
        assert_eq!(agent.provider().unwrap().name, "anthropic");
    }

    #[test]
    fn new_rejects_unknown_provider() {
        let err = Agent::new("carrier-pigeon").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::UnknownProvider(_))
        ));
    }

    #[test]
    fn new_rejects_malformed_string() {
        let err = Agent::new("openai:").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::MalformedModelString { .. })
        ));
    }

    #[test]
    fn query_form_carries_embeddings_model() {
        let agent = Agent::new("openai?chat=gpt-4o&embeddings=text-embedding-3-large").unwrap();
        match &agent.source {
            ModelSource::Registry { embeddings_model, .. } => {
                assert_eq!(embeddings_model.as_deref(), Some("text-embedding-3-large"));
            }
            _ => panic!("expected registry source"),
        }
    }

    #[tokio::test]
    async fn custom_source_has_no_embeddings() {
        let model: Arc<dyn ChatModel> = Arc::new(freja_model::mock::EchoChatModel);
        let agent = Agent::for_chat_model(model, &[Capability::Chat]);
        assert!(agent
            .create_embedding("x", EmbeddingKind::Query)
            .await
            .is_err());
    }
}
