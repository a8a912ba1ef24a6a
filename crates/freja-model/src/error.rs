// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed error kinds raised before or outside the streaming path.
//!
//! Transport failures and provider rejections travel as plain
//! `anyhow::Error` values out of the stream; the kinds below are raised
//! synchronously (registry lookup, model construction, request building)
//! and stay downcastable when wrapped in `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown provider: {0:?}; run `list_providers()` for the supported set")]
    UnknownProvider(String),

    #[error("malformed model string {input:?}: {reason}")]
    MalformedModelString { input: String, reason: &'static str },

    #[error("missing API key for provider {provider:?}: set {env_key} or add it to the agent environment")]
    MissingApiKey {
        provider: &'static str,
        env_key: &'static str,
    },

    #[error("provider {provider:?} cannot satisfy the requested tools + structured output combination: {detail}")]
    UnsupportedCombination {
        provider: &'static str,
        detail: &'static str,
    },

    #[error("schema cannot be mapped to {provider:?}'s schema model: {reason}")]
    SchemaMapping {
        provider: &'static str,
        reason: String,
    },

    #[error("provider {provider:?} has no embeddings model")]
    NoEmbeddings { provider: &'static str },
}
