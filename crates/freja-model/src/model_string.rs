// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The model-string grammar callers use to pick a provider and models.
//!
//! Accepted forms:
//! - `provider` — default chat + embeddings model for that provider
//! - `provider:model` / `provider/model` — explicit chat model
//! - `provider?chat=X&embeddings=Y` — query form naming both
//!
//! Parsing is purely syntactic; whether the provider exists is decided by
//! the registry lookup that follows.

use crate::error::ModelError;

/// The parsed pieces of a model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStringParts {
    pub provider: String,
    pub chat_model: Option<String>,
    pub embeddings_model: Option<String>,
}

/// Parse a model string into its parts.
///
/// The model portion may itself contain separators (`ollama:llama3:8b`),
/// so only the *first* `:` or `/` splits provider from model.
pub fn parse_model_string(input: &str) -> Result<ModelStringParts, ModelError> {
    let malformed = |reason: &'static str| ModelError::MalformedModelString {
        input: input.to_string(),
        reason,
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(malformed("empty string"));
    }

    // Query form: provider?chat=X&embeddings=Y
    if let Some((provider, query)) = s.split_once('?') {
        if provider.is_empty() {
            return Err(malformed("empty provider before '?'"));
        }
        if provider.contains(':') || provider.contains('/') {
            return Err(malformed("query form takes a bare provider name"));
        }
        let mut chat_model = None;
        let mut embeddings_model = None;
        for pair in query.split('&') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| malformed("query pairs must be key=value"))?;
            if value.is_empty() {
                return Err(malformed("empty value in query pair"));
            }
            match key {
                "chat" => chat_model = Some(value.to_string()),
                "embeddings" => embeddings_model = Some(value.to_string()),
                _ => return Err(malformed("unknown query key (expected chat or embeddings)")),
            }
        }
        return Ok(ModelStringParts {
            provider: provider.to_string(),
            chat_model,
            embeddings_model,
        });
    }

    // Separator form: provider:model or provider/model, first separator wins.
    if let Some(sep) = s.find([':', '/']) {
        let (provider, model) = (&s[..sep], &s[sep + 1..]);
        if provider.is_empty() {
            return Err(malformed("empty provider before separator"));
        }
        if model.is_empty() {
            return Err(malformed("empty model name after separator"));
        }
        return Ok(ModelStringParts {
            provider: provider.to_string(),
            chat_model: Some(model.to_string()),
            embeddings_model: None,
        });
    }

    Ok(ModelStringParts {
        provider: s.to_string(),
        chat_model: None,
        embeddings_model: None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_provider_has_no_model_names() {
        let p = parse_model_string("openai").unwrap();
        assert_eq!(p.provider, "openai");
        assert!(p.chat_model.is_none());
        assert!(p.embeddings_model.is_none());
    }

    #[test]
    fn colon_form_sets_chat_model() {
        let p = parse_model_string("openai:gpt-4o").unwrap();
        assert_eq!(p.provider, "openai");
        assert_eq!(p.chat_model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn slash_form_sets_chat_model() {
        let p = parse_model_string("anthropic/claude-sonnet-4-5").unwrap();
        assert_eq!(p.provider, "anthropic");
        assert_eq!(p.chat_model.as_deref(), Some("claude-sonnet-4-5"));
    }

    #[test]
    fn model_may_contain_further_separators() {
        let p = parse_model_string("ollama:llama3:8b").unwrap();
        assert_eq!(p.provider, "ollama");
        assert_eq!(p.chat_model.as_deref(), Some("llama3:8b"));
    }

    #[test]
    fn slash_inside_model_name_is_preserved() {
        let p = parse_model_string("openrouter:meta-llama/llama-3.3-70b").unwrap();
        assert_eq!(p.chat_model.as_deref(), Some("meta-llama/llama-3.3-70b"));
    }

    #[test]
    fn query_form_sets_both_models() {
        let p = parse_model_string("google?chat=gemini-2.0-flash&embeddings=text-embedding-004")
            .unwrap();
        assert_eq!(p.provider, "google");
        assert_eq!(p.chat_model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(p.embeddings_model.as_deref(), Some("text-embedding-004"));
    }

    #[test]
    fn query_form_accepts_a_single_key() {
        let p = parse_model_string("openai?embeddings=text-embedding-3-large").unwrap();
        assert!(p.chat_model.is_none());
        assert_eq!(p.embeddings_model.as_deref(), Some("text-embedding-3-large"));
    }

    #[test]
    fn empty_string_is_malformed() {
        assert!(matches!(
            parse_model_string(""),
            Err(ModelError::MalformedModelString { .. })
        ));
    }

    #[test]
    fn trailing_separator_is_malformed() {
        assert!(parse_model_string("openai:").is_err());
        assert!(parse_model_string("openai/").is_err());
    }

    #[test]
    fn leading_separator_is_malformed() {
        assert!(parse_model_string(":gpt-4o").is_err());
    }

    #[test]
    fn unknown_query_key_is_malformed() {
        assert!(parse_model_string("openai?speech=tts-1").is_err());
    }

    #[test]
    fn query_pair_without_value_is_malformed() {
        assert!(parse_model_string("openai?chat=").is_err());
        assert!(parse_model_string("openai?chat").is_err());
    }

    #[test]
    fn query_form_rejects_provider_with_separator() {
        assert!(parse_model_string("openai:gpt-4o?chat=x").is_err());
    }
}
