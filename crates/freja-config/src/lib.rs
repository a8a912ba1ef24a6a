// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-agent configuration: the environment lookup map.
//!
//! Providers resolve credentials and endpoint overrides through an
//! [`Environment`] value threaded in at model construction.  Explicit
//! entries take precedence over OS environment variables, so tests and
//! embedders can scope credentials to a single agent without touching
//! process-global state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Key→value lookup consulted before the OS environment.
///
/// Cloning is cheap enough for the per-agent scoping this type exists for;
/// an `Environment` is a plain map, never shared mutable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    #[serde(default)]
    overrides: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit value for `key`, shadowing the OS variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.overrides.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Look up `key`: explicit entries first, then the OS environment.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.overrides.get(key) {
            return Some(v.clone());
        }
        std::env::var(key).ok()
    }

    /// Look up `key` without falling back to the OS environment.
    pub fn get_override(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Remove an explicit entry.  The OS variable (if any) becomes visible
    /// again.
    pub fn unset(&mut self, key: &str) {
        self.overrides.remove(key);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
