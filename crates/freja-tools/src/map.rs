// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;

use crate::Tool;

/// The tool set for one agent invocation, keyed by name.
///
/// Names must be unique within an invocation; duplicates are rejected at
/// construction rather than silently overwritten.
#[derive(Clone, Default)]
pub struct ToolMap {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolMap {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> anyhow::Result<Self> {
        let mut map = Self::default();
        for tool in tools {
            map.insert(tool)?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            bail!("duplicate tool name: {name:?}");
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Registered tool names, sorted for stable iteration.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tools in name order, for building provider requests.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Arc<dyn Tool>> + '_ {
        let mut entries: Vec<(&String, &Arc<dyn Tool>)> = self.tools.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, t)| t)
    }
}

impl std::fmt::Debug for ToolMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolMap").field("names", &self.names()).finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
