//! Prompt template registry.
//!
//! The engine consumes templates by id and hands the AI layer a rendered
//! string. Rendering substitutes `{variable}` placeholders from the
//! prompt-variable map built by the checking point. Loading templates from
//! files is the concern of an outer layer; this registry is in-memory.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use opswatch_core::{OpsError, OpsResult};

/// One prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template identifier, unique within a registry
    pub id: String,
    /// Display name
    pub name: String,
    /// Template body with `{variable}` placeholders
    pub content: String,
    /// Agent role the template targets
    pub agent_role: Option<String>,
    /// Search tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Template version
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl PromptTemplate {
    /// Create a template.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            content: content.into(),
            agent_role: None,
            tags: Vec::new(),
            version: default_version(),
        }
    }

    /// Placeholder names referenced by the body.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut variables = BTreeSet::new();
        let mut rest = self.content.as_str();
        while let Some(open) = rest.find('{') {
            rest = &rest[open + 1..];
            // `{{` escapes a literal brace.
            if rest.starts_with('{') {
                rest = &rest[1..];
                continue;
            }
            if let Some(close) = rest.find('}') {
                let name = &rest[..close];
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    variables.insert(name.to_string());
                }
                rest = &rest[close + 1..];
            } else {
                break;
            }
        }
        variables
    }
}

/// In-memory template registry with rendering.
#[derive(Default)]
pub struct PromptRegistry {
    templates: RwLock<BTreeMap<String, PromptTemplate>>,
}

impl PromptRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any existing one with the same id.
    pub fn register(&self, template: PromptTemplate) {
        self.templates
            .write()
            .insert(template.id.clone(), template);
    }

    /// Remove a template by id.
    pub fn unregister(&self, template_id: &str) -> bool {
        self.templates.write().remove(template_id).is_some()
    }

    /// Look up a template by id.
    pub fn get(&self, template_id: &str) -> Option<PromptTemplate> {
        self.templates.read().get(template_id).cloned()
    }

    /// Templates targeting the given agent role.
    pub fn by_agent_role(&self, agent_role: &str) -> Vec<PromptTemplate> {
        self.templates
            .read()
            .values()
            .filter(|t| t.agent_role.as_deref() == Some(agent_role))
            .cloned()
            .collect()
    }

    /// Render a template against a variable map.
    ///
    /// # Errors
    /// `Validation` when the template is unknown or any referenced variable
    /// is missing (the message names every missing variable).
    pub fn render(&self, template_id: &str, variables: &BTreeMap<String, Value>) -> OpsResult<String> {
        let template = self.get(template_id).ok_or_else(|| {
            OpsError::validation(format!("unknown prompt template '{template_id}'"))
        })?;

        let missing = self.missing_variables(&template, variables);
        if !missing.is_empty() {
            return Err(OpsError::validation(format!(
                "template '{template_id}' is missing variables: {}",
                missing.join(", ")
            )));
        }

        let mut rendered = template.content.clone();
        for (key, value) in variables {
            let needle = format!("{{{key}}}");
            if rendered.contains(&needle) {
                let replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&needle, &replacement);
            }
        }
        Ok(rendered.replace("{{", "{").replace("}}", "}"))
    }

    /// Names of referenced variables absent from the map.
    pub fn validate_variables(
        &self,
        template_id: &str,
        variables: &BTreeMap<String, Value>,
    ) -> OpsResult<Vec<String>> {
        let template = self.get(template_id).ok_or_else(|| {
            OpsError::validation(format!("unknown prompt template '{template_id}'"))
        })?;
        Ok(self.missing_variables(&template, variables))
    }

    fn missing_variables(
        &self,
        template: &PromptTemplate,
        variables: &BTreeMap<String, Value>,
    ) -> Vec<String> {
        template
            .variables()
            .into_iter()
            .filter(|name| !variables.contains_key(name))
            .collect()
    }

    /// Case-insensitive search over id, name, and tags.
    pub fn search(&self, query: &str) -> Vec<PromptTemplate> {
        let query = query.to_lowercase();
        self.templates
            .read()
            .values()
            .filter(|t| {
                t.id.to_lowercase().contains(&query)
                    || t.name.to_lowercase().contains(&query)
                    || t.tags.iter().any(|tag| tag.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }

    /// Registry snapshot.
    pub fn summary(&self) -> Value {
        let templates = self.templates.read();
        let entries: Vec<Value> = templates
            .values()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "name": t.name,
                    "agent_role": t.agent_role,
                    "tags": t.tags,
                    "version": t.version,
                    "variables": t.variables(),
                })
            })
            .collect();
        serde_json::json!({
            "total": entries.len(),
            "templates": entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variables(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn variables_are_extracted_from_the_body() {
        let template = PromptTemplate::new(
            "t",
            "Task {task_id} ({task_priority}) needs triage. Literal {{braces}} stay.",
        );
        let names = template.variables();
        assert!(names.contains("task_id"));
        assert!(names.contains("task_priority"));
        assert!(!names.contains("braces"));
    }

    #[test]
    fn render_substitutes_and_unescapes() {
        let registry = PromptRegistry::new();
        registry.register(PromptTemplate::new(
            "triage",
            "Triage {task_id} with priority {task_priority}. Use {{json}}.",
        ));
        let rendered = registry
            .render(
                "triage",
                &variables(&[("task_id", "task-1"), ("task_priority", "urgent")]),
            )
            .unwrap();
        assert_eq!(rendered, "Triage task-1 with priority urgent. Use {json}.");
    }

    #[test]
    fn render_names_missing_variables() {
        let registry = PromptRegistry::new();
        registry.register(PromptTemplate::new("t", "{a} {b} {c}"));
        let err = registry
            .render("t", &variables(&[("b", "present")]))
            .unwrap_err();
        assert!(err.message.contains('a'));
        assert!(err.message.contains('c'));
        assert!(!err.is_retryable());
    }

    #[test]
    fn render_unknown_template_fails() {
        let registry = PromptRegistry::new();
        assert!(registry.render("ghost", &BTreeMap::new()).is_err());
    }

    #[test]
    fn non_string_values_render_as_json() {
        let registry = PromptRegistry::new();
        registry.register(PromptTemplate::new("t", "score: {confidence}"));
        let mut vars = BTreeMap::new();
        vars.insert("confidence".to_string(), Value::from(0.85));
        assert_eq!(registry.render("t", &vars).unwrap(), "score: 0.85");
    }

    #[test]
    fn search_and_role_lookup() {
        let registry = PromptRegistry::new();
        let mut t = PromptTemplate::new("clickup_urgent_task_triage", "x");
        t.agent_role = Some("dev".into());
        t.tags = vec!["clickup".into(), "urgent".into()];
        registry.register(t);
        registry.register(PromptTemplate::new("slack_mention_reply", "y"));

        assert_eq!(registry.search("urgent").len(), 1);
        assert_eq!(registry.by_agent_role("dev").len(), 1);
        assert_eq!(registry.by_agent_role("ops").len(), 0);
        assert_eq!(registry.len(), 2);
    }
}
