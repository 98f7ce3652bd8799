//! Tool catalog assembled during capability discovery.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::ToolEntry;

/// Metadata for one remote tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name (opaque string)
    pub name: String,
    /// Identifier of the server advertising the tool
    pub mcp_server_id: String,
    /// Parameter schema, `{}` when the server supplied none
    pub parameters: Value,
    /// Tool description
    #[serde(default)]
    pub description: String,
}

impl ToolInfo {
    /// Build from a wire entry, filling absent metadata with defaults.
    pub fn from_entry(entry: ToolEntry, server_id: Option<&str>) -> Self {
        Self {
            name: entry.name,
            mcp_server_id: server_id.unwrap_or("unknown").to_string(),
            parameters: entry
                .input_schema
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            description: entry.description.unwrap_or_default(),
        }
    }

    /// Build a bare entry for a tool known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mcp_server_id: "unknown".to_string(),
            parameters: Value::Object(serde_json::Map::new()),
            description: String::new(),
        }
    }
}

/// Set of discovered tools with name lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolInfo>,
}

impl ToolCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tool, replacing any existing entry with the same name.
    pub fn insert(&mut self, tool: ToolInfo) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.get(name)
    }

    /// Whether the catalog knows this tool.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Iterate over tools in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolInfo> {
        self.tools.values()
    }

    /// All tool names in order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Merge another catalog in; `other` wins on name collisions.
    pub fn merge(&mut self, other: ToolCatalog) {
        self.tools.extend(other.tools);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_metadata_gets_defaults() {
        let entry = ToolEntry {
            name: "get_tasks".into(),
            description: None,
            input_schema: None,
        };
        let info = ToolInfo::from_entry(entry, None);
        assert_eq!(info.mcp_server_id, "unknown");
        assert_eq!(info.parameters, serde_json::json!({}));
        assert!(info.description.is_empty());
    }

    #[test]
    fn catalog_lookup_and_merge() {
        let mut catalog = ToolCatalog::new();
        catalog.insert(ToolInfo::named("a"));
        catalog.insert(ToolInfo::named("b"));
        assert!(catalog.contains("a"));
        assert_eq!(catalog.names(), vec!["a", "b"]);

        let mut other = ToolCatalog::new();
        let mut replacement = ToolInfo::named("b");
        replacement.description = "replaced".into();
        other.insert(replacement);
        catalog.merge(other);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("b").unwrap().description, "replaced");
    }
}
