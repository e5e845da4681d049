//! Label schema: how workspace identity and state are stamped onto containers
//!
//! Containers carry all durable state as labels rather than local state files — this
//! module is the single place that knows the label namespace, the legacy prefix it
//! migrated from, and the mandatory/optional key set.

use crate::identity::HashSet;
use std::collections::HashMap;

/// Current label namespace.
pub const NAMESPACE: &str = "dcx";
/// Legacy namespace recognized on read only; never written.
const LEGACY_NAMESPACE: &str = "devcontainer";
/// Bumped whenever the label set's meaning changes incompatibly.
pub const SCHEMA_VERSION: &str = "1";

/// How the primary container's image was produced; mirrors [`crate::plan::ExecutionPlan::kind`].
pub fn build_method_label(kind: &str) -> &'static str {
    match kind {
        "image" => "image",
        "dockerfile" => "dockerfile",
        "compose" => "compose",
        _ => "image",
    }
}

fn key(ns: &str, suffix: &str) -> String {
    format!("{ns}.{suffix}")
}

/// Builds the full label map for a container being created or updated. Always writes the
/// current schema; never the legacy one.
#[derive(Debug, Clone, Default)]
pub struct LabelBuilder {
    labels: HashMap<String, String>,
}

impl LabelBuilder {
    pub fn new(workspace_id: &str, workspace_path: &str, created_by: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert(key(NAMESPACE, "schema.version"), SCHEMA_VERSION.to_string());
        labels.insert(key(NAMESPACE, "managed"), "true".to_string());
        labels.insert(key(NAMESPACE, "workspace.id"), workspace_id.to_string());
        labels.insert(key(NAMESPACE, "workspace.path"), workspace_path.to_string());
        labels.insert(key(NAMESPACE, "created.by"), created_by.to_string());
        labels.insert(
            key(NAMESPACE, "created.at"),
            chrono::Utc::now().to_rfc3339(),
        );
        Self { labels }
    }

    pub fn with_hashes(mut self, hashes: &HashSet) -> Self {
        self.labels
            .insert(key(NAMESPACE, "hash.overall"), hashes.overall.clone());
        self.labels
            .insert(key(NAMESPACE, "hash.config"), hashes.config.clone());
        self.labels
            .insert(key(NAMESPACE, "hash.dockerfile"), hashes.dockerfile.clone());
        self.labels
            .insert(key(NAMESPACE, "hash.compose"), hashes.compose.clone());
        self.labels
            .insert(key(NAMESPACE, "hash.features"), hashes.features.clone());
        self
    }

    pub fn with_lifecycle_state(mut self, state: &str) -> Self {
        self.labels
            .insert(key(NAMESPACE, "lifecycle.state"), state.to_string());
        self
    }

    pub fn with_workspace_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name {
            self.labels
                .insert(key(NAMESPACE, "workspace.name"), name.to_string());
        }
        self
    }

    pub fn with_config_path(mut self, path: &str) -> Self {
        self.labels
            .insert(key(NAMESPACE, "config.path"), path.to_string());
        self
    }

    pub fn with_features(mut self, ids: &[String], config: &serde_json::Value) -> Self {
        if !ids.is_empty() {
            if let Ok(json) = serde_json::to_string(ids) {
                self.labels.insert(key(NAMESPACE, "features.installed"), json);
            }
            if let Ok(json) = serde_json::to_string(config) {
                self.labels.insert(key(NAMESPACE, "features.config"), json);
            }
        }
        self
    }

    pub fn with_build_metadata(
        mut self,
        base_image: Option<&str>,
        derived_image: Option<&str>,
        method: &str,
    ) -> Self {
        if let Some(base) = base_image {
            self.labels
                .insert(key(NAMESPACE, "build.base.image"), base.to_string());
        }
        if let Some(derived) = derived_image {
            self.labels
                .insert(key(NAMESPACE, "build.derived.image"), derived.to_string());
        }
        self.labels
            .insert(key(NAMESPACE, "build.method"), method.to_string());
        self
    }

    pub fn with_compose(mut self, project: &str, service: &str) -> Self {
        self.labels
            .insert(key(NAMESPACE, "compose.project"), project.to_string());
        self.labels
            .insert(key(NAMESPACE, "compose.service"), service.to_string());
        self
    }

    pub fn with_primary(mut self, primary: bool) -> Self {
        self.labels
            .insert(key(NAMESPACE, "container.primary"), primary.to_string());
        self
    }

    pub fn with_env_probe_cache(mut self, probed_env: &str, probed_env_hash: &str) -> Self {
        self.labels
            .insert(key(NAMESPACE, "cache.probed.env"), probed_env.to_string());
        self.labels.insert(
            key(NAMESPACE, "cache.probed.env.hash"),
            probed_env_hash.to_string(),
        );
        self
    }

    pub fn build(self) -> HashMap<String, String> {
        self.labels
    }
}

/// Map of legacy `devcontainer.*` keys to the corresponding `dcx.*` keys read at query time.
/// Writing always uses the current schema; this only governs reads of pre-existing containers.
pub fn migrate_legacy(labels: &HashMap<String, String>) -> HashMap<String, String> {
    let mut migrated = labels.clone();
    let legacy_prefix = format!("{LEGACY_NAMESPACE}.");
    let current_prefix = format!("{NAMESPACE}.");
    for (k, v) in labels {
        if let Some(suffix) = k.strip_prefix(&legacy_prefix) {
            let current_key = format!("{current_prefix}{suffix}");
            migrated.entry(current_key).or_insert_with(|| v.clone());
        }
    }
    migrated
}

/// Whether a container's labels mark it as managed by this tool, consulting both schemas.
pub fn is_managed(labels: &HashMap<String, String>) -> bool {
    let migrated = migrate_legacy(labels);
    migrated
        .get(&key(NAMESPACE, "managed"))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Extract the workspace id a container belongs to, consulting both schemas.
pub fn get_workspace_id(labels: &HashMap<String, String>) -> Option<String> {
    let migrated = migrate_legacy(labels);
    migrated.get(&key(NAMESPACE, "workspace.id")).cloned()
}

/// Whether this container is the primary for its workspace, consulting both schemas.
pub fn is_primary(labels: &HashMap<String, String>) -> bool {
    let migrated = migrate_legacy(labels);
    migrated
        .get(&key(NAMESPACE, "container.primary"))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn get_hash_overall(labels: &HashMap<String, String>) -> Option<String> {
    let migrated = migrate_legacy(labels);
    migrated.get(&key(NAMESPACE, "hash.overall")).cloned()
}

pub fn get_lifecycle_state(labels: &HashMap<String, String>) -> Option<String> {
    let migrated = migrate_legacy(labels);
    migrated.get(&key(NAMESPACE, "lifecycle.state")).cloned()
}

/// A `label=<key>=<value>` filter selector for the runtime adapter's list operations.
pub fn workspace_id_filter(workspace_id: &str) -> String {
    format!("label={}={}", key(NAMESPACE, "workspace.id"), workspace_id)
}

pub fn managed_filter() -> String {
    format!("label={}=true", key(NAMESPACE, "managed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_writes_current_schema_only() {
        let labels = LabelBuilder::new("ws123", "/path", "dcx-cli").build();
        assert_eq!(labels.get("dcx.workspace.id").unwrap(), "ws123");
        assert_eq!(labels.get("dcx.managed").unwrap(), "true");
        assert!(!labels.contains_key("devcontainer.workspace.id"));
    }

    #[test]
    fn test_migrate_legacy_maps_prefix() {
        let mut legacy = HashMap::new();
        legacy.insert("devcontainer.workspace.id".to_string(), "ws1".to_string());
        legacy.insert("devcontainer.managed".to_string(), "true".to_string());
        let migrated = migrate_legacy(&legacy);
        assert_eq!(migrated.get("dcx.workspace.id").unwrap(), "ws1");
        assert!(is_managed(&legacy));
        assert_eq!(get_workspace_id(&legacy).unwrap(), "ws1");
    }

    #[test]
    fn test_current_schema_not_overridden_by_legacy() {
        let mut labels = HashMap::new();
        labels.insert("dcx.workspace.id".to_string(), "current".to_string());
        labels.insert("devcontainer.workspace.id".to_string(), "legacy".to_string());
        assert_eq!(get_workspace_id(&labels).unwrap(), "current");
    }

    #[test]
    fn test_is_primary_and_hash_overall() {
        let mut labels = HashMap::new();
        labels.insert("dcx.container.primary".to_string(), "true".to_string());
        labels.insert("dcx.hash.overall".to_string(), "abcd".to_string());
        assert!(is_primary(&labels));
        assert_eq!(get_hash_overall(&labels).unwrap(), "abcd");
    }

    #[test]
    fn test_filter_selectors() {
        assert_eq!(workspace_id_filter("ws1"), "label=dcx.workspace.id=ws1");
        assert_eq!(managed_filter(), "label=dcx.managed=true");
    }
}
