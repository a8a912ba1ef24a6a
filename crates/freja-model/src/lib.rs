// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical message model, the `ChatModel` contract, and the provider
//! normalization layer.
//!
//! Every provider mapper translates between [`ChatMessage`] values and its
//! own wire format: text deltas become text parts, fragmented tool-call
//! arguments become per-id fragments, and usage / finish reasons / opaque
//! metadata are preserved on the emitted [`ChatResult`]s.

pub mod error;
pub mod mock;
pub mod model_string;
pub mod registry;

mod anthropic;
mod embeddings;
mod google;
mod ollama;
mod openai_compat;
mod provider;
mod types;

pub use error::ModelError;
pub use model_string::{parse_model_string, ModelStringParts};
pub use provider::{ChatModel, ChatStream, EmbeddingKind, EmbeddingsModel};
pub use registry::{
    get_provider, list_providers, resolve_provider, Capability, ChatModelOptions, Provider,
};
pub use types::*;
