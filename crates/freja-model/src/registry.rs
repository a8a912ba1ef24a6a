// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: static metadata and constructors for every supported
//! provider.
//!
//! This module is the single source of truth for which provider ids exist,
//! their aliases, capability tags, default model names, and credential
//! environment keys.

use serde_json::Value;
use tracing::debug;

use freja_config::Environment;

use crate::{
    anthropic::AnthropicChat,
    embeddings::{GoogleEmbeddings, OpenAiCompatEmbeddings},
    error::ModelError,
    google::GoogleChat,
    mock::EchoChatModel,
    ollama::OllamaChat,
    openai_compat::OpenAiCompatChat,
    provider::{ChatModel, EmbeddingsModel},
    ModelInfo, ModelKind, ToolSchema,
};

/// Coarse feature tags used to pick the orchestration strategy.
///
/// A closed set: tags drive normalization decisions in the agent, they do
/// not gate feature access at the API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Supports chat completion (universal).
    Chat,
    /// Can emit tool calls.
    MultiToolCalls,
    /// Supports structured output in some form.
    TypedOutput,
    /// Can combine tools and structured output in one call.
    TypedOutputWithTools,
    /// Provides embeddings.
    Embeddings,
    /// Accepts image parts.
    Vision,
}

/// Which wire mapper a provider entry routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Driver {
    OpenAiCompat,
    Anthropic,
    Google,
    Ollama,
    Mock,
}

/// Options for constructing a chat model from a registry entry.
#[derive(Debug, Clone, Default)]
pub struct ChatModelOptions {
    /// Model name; the provider default is used when absent.
    pub model: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
}

/// Metadata and constructors for one registered provider.
pub struct Provider {
    /// Canonical provider id (e.g. `"openai"`).
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// One-line description for listings.
    pub description: &'static str,
    pub caps: &'static [Capability],
    /// Environment key holding the API key; `None` for keyless providers.
    pub api_key_env: Option<&'static str>,
    pub default_base_url: &'static str,
    default_chat_model: &'static str,
    default_embeddings_model: Option<&'static str>,
    requires_api_key: bool,
    driver: Driver,
    extra_headers: &'static [(&'static str, &'static str)],
}

impl Provider {
    pub fn capable_of(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    /// The default model name for `kind`, if this provider has one.
    pub fn default_model_name(&self, kind: ModelKind) -> Option<&'static str> {
        match kind {
            ModelKind::Chat => Some(self.default_chat_model),
            ModelKind::Embeddings => self.default_embeddings_model,
        }
    }

    fn resolve_api_key(&self, env: &Environment) -> Result<Option<String>, ModelError> {
        match self.api_key_env {
            Some(env_key) => {
                let key = env.get(env_key);
                if key.is_none() && self.requires_api_key {
                    return Err(ModelError::MissingApiKey { provider: self.name, env_key });
                }
                Ok(key)
            }
            None => Ok(None),
        }
    }

    /// Construct a chat model.  Credentials are resolved (and validated)
    /// here, so a missing API key fails at creation, not on first request.
    pub fn create_chat_model(
        &self,
        opts: ChatModelOptions,
        env: &Environment,
    ) -> anyhow::Result<Box<dyn ChatModel>> {
        let api_key = self.resolve_api_key(env)?;
        let model = opts
            .model
            .unwrap_or_else(|| self.default_chat_model.to_string());
        debug!(provider = %self.name, model = %model, "creating chat model");

        Ok(match self.driver {
            Driver::OpenAiCompat => Box::new(OpenAiCompatChat::new(
                self.name,
                model,
                api_key,
                self.default_base_url,
                opts.temperature,
                opts.tools,
                self.extra_headers.to_vec(),
            )),
            // requires_api_key holds for these two, so resolve_api_key has
            // already produced Some.
            Driver::Anthropic => Box::new(AnthropicChat::new(
                model,
                api_key.unwrap_or_default(),
                self.default_base_url,
                opts.temperature,
                opts.tools,
            )),
            Driver::Google => Box::new(GoogleChat::new(
                model,
                api_key.unwrap_or_default(),
                self.default_base_url,
                opts.temperature,
                opts.tools,
            )),
            Driver::Ollama => Box::new(OllamaChat::new(
                model,
                self.default_base_url,
                opts.temperature,
                opts.tools,
            )),
            Driver::Mock => Box::new(EchoChatModel),
        })
    }

    /// Construct an embeddings model, or fail when the provider has none.
    pub fn create_embeddings_model(
        &self,
        model: Option<&str>,
        env: &Environment,
    ) -> anyhow::Result<Box<dyn EmbeddingsModel>> {
        if !self.capable_of(Capability::Embeddings) {
            return Err(ModelError::NoEmbeddings { provider: self.name }.into());
        }
        let api_key = self.resolve_api_key(env)?;
        let model = model
            .map(str::to_string)
            .or_else(|| self.default_embeddings_model.map(str::to_string))
            .ok_or(ModelError::NoEmbeddings { provider: self.name })?;

        Ok(match self.driver {
            Driver::Google => Box::new(GoogleEmbeddings::new(
                model,
                api_key.unwrap_or_default(),
                self.default_base_url,
            )),
            // Ollama serves OpenAI-compatible embeddings under /v1.
            Driver::Ollama => Box::new(OpenAiCompatEmbeddings::new(
                self.name,
                model,
                None,
                &format!("{}/v1", self.default_base_url.trim_end_matches('/')),
            )),
            _ => Box::new(OpenAiCompatEmbeddings::new(
                self.name,
                model,
                api_key,
                self.default_base_url,
            )),
        })
    }

    /// List models this provider offers.
    ///
    /// OpenAI-compatible providers are queried live via `GET /models` and
    /// Ollama via `GET /api/tags`; any failure (or a keyless setup) falls
    /// back to the static defaults, so listing never hard-fails on a
    /// missing credential.
    pub async fn list_models(&self, env: &Environment) -> anyhow::Result<Vec<ModelInfo>> {
        match self.driver {
            Driver::OpenAiCompat => Ok(self.list_openai_compat(env).await),
            Driver::Ollama => Ok(self.list_ollama().await),
            _ => Ok(self.default_models()),
        }
    }

    async fn list_openai_compat(&self, env: &Environment) -> Vec<ModelInfo> {
        let Ok(Some(key)) = self.resolve_api_key(env) else {
            return self.default_models();
        };
        let url = format!("{}/models", self.default_base_url.trim_end_matches('/'));
        let resp = match reqwest::Client::new().get(&url).bearer_auth(&key).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return self.default_models(),
        };
        let Ok(body) = resp.json::<Value>().await else {
            return self.default_models();
        };
        let mut out: Vec<ModelInfo> = body["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|item| item["id"].as_str())
                    .map(|id| ModelInfo {
                        id: id.to_string(),
                        provider: self.name.to_string(),
                        kind: ModelKind::Chat,
                        description: String::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if out.is_empty() {
            return self.default_models();
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    async fn list_ollama(&self) -> Vec<ModelInfo> {
        let url = format!("{}/api/tags", self.default_base_url.trim_end_matches('/'));
        let body = match reqwest::Client::new().get(&url).send().await {
            Ok(r) if r.status().is_success() => r.json::<Value>().await.ok(),
            _ => None,
        };
        let Some(body) = body else {
            return self.default_models();
        };
        let mut out: Vec<ModelInfo> = body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|name| ModelInfo {
                        id: name.to_string(),
                        provider: self.name.to_string(),
                        kind: ModelKind::Chat,
                        description: String::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if out.is_empty() {
            return self.default_models();
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn default_models(&self) -> Vec<ModelInfo> {
        let mut out = vec![ModelInfo {
            id: self.default_chat_model.to_string(),
            provider: self.name.to_string(),
            kind: ModelKind::Chat,
            description: format!("{} default chat model", self.description),
        }];
        if let Some(emb) = self.default_embeddings_model {
            out.push(ModelInfo {
                id: emb.to_string(),
                provider: self.name.to_string(),
                kind: ModelKind::Embeddings,
                description: format!("{} default embeddings model", self.description),
            });
        }
        out
    }
}

use Capability::*;

/// Complete registry of supported providers.
pub static PROVIDERS: &[Provider] = &[
    Provider {
        name: "openai",
        aliases: &["gpt"],
        description: "OpenAI GPT models",
        caps: &[Chat, MultiToolCalls, TypedOutput, TypedOutputWithTools, Embeddings, Vision],
        api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: "https://api.openai.com/v1",
        default_chat_model: "gpt-4o",
        default_embeddings_model: Some("text-embedding-3-small"),
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[],
    },
    Provider {
        name: "anthropic",
        aliases: &["claude"],
        description: "Anthropic Claude models",
        caps: &[Chat, MultiToolCalls, Vision],
        api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: "https://api.anthropic.com",
        default_chat_model: "claude-sonnet-4-5",
        default_embeddings_model: None,
        requires_api_key: true,
        driver: Driver::Anthropic,
        extra_headers: &[],
    },
    Provider {
        name: "google",
        aliases: &["gemini"],
        description: "Google Gemini models via the Generative Language API",
        caps: &[Chat, MultiToolCalls, TypedOutput, Embeddings, Vision],
        api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: "https://generativelanguage.googleapis.com",
        default_chat_model: "gemini-2.0-flash",
        default_embeddings_model: Some("text-embedding-004"),
        requires_api_key: true,
        driver: Driver::Google,
        extra_headers: &[],
    },
    Provider {
        name: "mistral",
        aliases: &[],
        description: "Mistral AI models",
        caps: &[Chat, MultiToolCalls, TypedOutput, TypedOutputWithTools, Embeddings],
        api_key_env: Some("MISTRAL_API_KEY"),
        default_base_url: "https://api.mistral.ai/v1",
        default_chat_model: "mistral-large-latest",
        default_embeddings_model: Some("mistral-embed"),
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[],
    },
    Provider {
        name: "ollama",
        aliases: &[],
        description: "Ollama local model runner",
        caps: &[Chat, MultiToolCalls, TypedOutput, Embeddings],
        api_key_env: None,
        default_base_url: "http://localhost:11434",
        default_chat_model: "llama3.2",
        default_embeddings_model: Some("nomic-embed-text"),
        requires_api_key: false,
        driver: Driver::Ollama,
        extra_headers: &[],
    },
    Provider {
        name: "cohere",
        aliases: &[],
        description: "Cohere Command models (compatibility endpoint)",
        caps: &[Chat, MultiToolCalls, Embeddings],
        api_key_env: Some("COHERE_API_KEY"),
        default_base_url: "https://api.cohere.ai/compatibility/v1",
        default_chat_model: "command-r-plus",
        default_embeddings_model: Some("embed-english-v3.0"),
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[],
    },
    Provider {
        name: "together",
        aliases: &[],
        description: "Together AI open model hosting",
        caps: &[Chat, MultiToolCalls, TypedOutput, TypedOutputWithTools, Embeddings],
        api_key_env: Some("TOGETHER_API_KEY"),
        default_base_url: "https://api.together.xyz/v1",
        default_chat_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        default_embeddings_model: Some("togethercomputer/m2-bert-80M-8k-retrieval"),
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[],
    },
    Provider {
        name: "openrouter",
        aliases: &[],
        description: "OpenRouter gateway",
        caps: &[Chat, MultiToolCalls, TypedOutput, TypedOutputWithTools, Vision],
        api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: "https://openrouter.ai/api/v1",
        default_chat_model: "openai/gpt-4o",
        default_embeddings_model: None,
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[
            ("HTTP-Referer", "https://github.com/freja-rs/freja"),
            ("X-Title", "freja"),
        ],
    },
    Provider {
        name: "lambda",
        aliases: &[],
        description: "Lambda inference API",
        caps: &[Chat, MultiToolCalls],
        api_key_env: Some("LAMBDA_API_KEY"),
        default_base_url: "https://api.lambda.ai/v1",
        default_chat_model: "llama3.3-70b-instruct-fp8",
        default_embeddings_model: None,
        requires_api_key: true,
        driver: Driver::OpenAiCompat,
        extra_headers: &[],
    },
    // ── Testing ───────────────────────────────────────────────────────────────
    Provider {
        name: "mock",
        aliases: &[],
        description: "Mock provider for tests (no network, echoes input)",
        caps: &[Chat, MultiToolCalls],
        api_key_env: None,
        default_base_url: "",
        default_chat_model: "mock-model",
        default_embeddings_model: None,
        requires_api_key: false,
        driver: Driver::Mock,
        extra_headers: &[],
    },
];

/// Returns all registered providers in declaration order.
pub fn list_providers() -> &'static [Provider] {
    PROVIDERS
}

/// Look up a provider by canonical name or alias (case-insensitive).
pub fn get_provider(name: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|p| {
        p.name.eq_ignore_ascii_case(name)
            || p.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    })
}

/// Like [`get_provider`], failing with [`ModelError::UnknownProvider`].
pub fn resolve_provider(name: &str) -> Result<&'static Provider, ModelError> {
    get_provider(name).ok_or_else(|| ModelError::UnknownProvider(name.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
