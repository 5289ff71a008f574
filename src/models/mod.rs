//! In-memory registry of available model IDs with their default tool
//! configuration. Read-only during a scheduler tick; insertion order is the
//! fallback order, so the map is an `IndexMap`.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMeta {
    #[serde(default, rename = "toolIds")]
    pub tool_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub meta: ModelMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub info: ModelInfo,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models: IndexMap<String, ModelEntry>) -> Self {
        Self { models }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model registry: {}", path.display()))?;
        let models: IndexMap<String, ModelEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid model registry JSON: {}", path.display()))?;
        Ok(Self { models })
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn first_id(&self) -> Option<&str> {
        self.models.keys().next().map(String::as_str)
    }

    /// Default tool list configured on the model, empty when unknown.
    pub fn default_tool_ids(&self, model_id: &str) -> Vec<String> {
        self.models
            .get(model_id)
            .map(|entry| entry.info.meta.tool_ids.clone())
            .unwrap_or_default()
    }

    /// Resolve the model a run should use: the requested ID when registered,
    /// else the first of the user's default models that is, else any
    /// registered model.
    pub fn resolve(&self, requested: &str, user_defaults: &[String]) -> Option<String> {
        if self.contains(requested) {
            return Some(requested.to_string());
        }
        if let Some(fallback) = user_defaults.iter().find(|id| self.contains(id)) {
            return Some(fallback.clone());
        }
        self.first_id().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ids: &[(&str, &[&str])]) -> ModelRegistry {
        let mut models = IndexMap::new();
        for (id, tools) in ids {
            models.insert(
                (*id).to_string(),
                ModelEntry {
                    info: ModelInfo {
                        meta: ModelMeta {
                            tool_ids: tools.iter().map(|t| (*t).to_string()).collect(),
                        },
                    },
                },
            );
        }
        ModelRegistry::new(models)
    }

    #[test]
    fn test_resolve_prefers_requested_model() {
        let reg = registry(&[("a", &[]), ("b", &[])]);
        assert_eq!(reg.resolve("b", &[]).as_deref(), Some("b"));
    }

    #[test]
    fn test_resolve_falls_back_to_user_default() {
        let reg = registry(&[("a", &[]), ("b", &[])]);
        let defaults = vec!["missing".to_string(), "b".to_string()];
        assert_eq!(reg.resolve("ghost", &defaults).as_deref(), Some("b"));
    }

    #[test]
    fn test_resolve_falls_back_to_first_registered() {
        let reg = registry(&[("first", &[]), ("second", &[])]);
        assert_eq!(reg.resolve("ghost", &[]).as_deref(), Some("first"));
    }

    #[test]
    fn test_resolve_empty_registry_is_none() {
        let reg = ModelRegistry::default();
        assert_eq!(reg.resolve("anything", &[]), None);
    }

    #[test]
    fn test_default_tool_ids_inherited() {
        let reg = registry(&[("a", &["notes_manager", "web_search"])]);
        assert_eq!(reg.default_tool_ids("a"), vec!["notes_manager", "web_search"]);
        assert!(reg.default_tool_ids("ghost").is_empty());
    }

    #[test]
    fn test_registry_parses_wire_shape() {
        let raw = r#"{
            "gpt-x": {"info": {"meta": {"toolIds": ["notes_manager"]}}},
            "bare": {}
        }"#;
        let models: IndexMap<String, ModelEntry> = serde_json::from_str(raw).unwrap();
        let reg = ModelRegistry::new(models);
        assert_eq!(reg.default_tool_ids("gpt-x"), vec!["notes_manager"]);
        assert!(reg.default_tool_ids("bare").is_empty());
    }
}
