// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! freja — a provider-agnostic LLM agent runtime.
//!
//! Give an [`Agent`] a prompt, a message history, an optional set of
//! callable tools, and an optional structured-output schema; it drives
//! the chosen provider's chat API to completion, invoking tools when the
//! model asks for them, normalizing provider quirks, and surfacing one
//! coherent stream of text chunks plus a canonical transcript.
//!
//! ```ignore
//! use freja::{Agent, SendOptions};
//!
//! let agent = Agent::new("anthropic")?.with_tools(vec![weather_tool]);
//! let mut stream = agent.send_stream("Weather in 97209?", SendOptions::default());
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?.output);
//! }
//! ```

pub mod accumulator;
pub mod agent;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod state;
pub mod typed;

pub use accumulator::StreamAccumulator;
pub use agent::{Agent, SendOptions};
pub use error::ToolArgumentParseError;
pub use executor::{execute_batch, ToolCallRequest};
pub use orchestrator::{DefaultOrchestrator, Orchestrator, StreamingIterationResult};
pub use state::{OpenToolCall, StreamingState};
pub use typed::{TypedOrchestrator, RETURN_RESULT_TOOL, SUPPRESSED_TEXT_KEY};

pub use freja_config::Environment;
pub use freja_model::{
    data_url, json_to_text, get_provider, list_providers, parse_model_string, Capability,
    ChatMessage, ChatModel, ChatResult, ChatStream, EmbeddingKind, EmbeddingsModel, FinishReason,
    ModelError, ModelInfo, ModelKind, ModelStringParts, Part, Provider, Role, ToolSchema, Usage,
};
pub use freja_tools::{FunctionTool, Tool, ToolMap};
