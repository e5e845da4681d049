//! DevContainer features system
//!
//! This module handles feature discovery, installation, and lifecycle management.

use crate::errors::{DcxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Processed option value supporting different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Boolean(bool),
    String(String),
}

impl OptionValue {
    /// Get as boolean if it's a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as string if it's a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Feature option definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureOption {
    #[serde(rename = "boolean")]
    Boolean {
        #[serde(default)]
        default: Option<bool>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename = "string")]
    String {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        r#enum: Option<Vec<String>>,
        #[serde(default)]
        proposals: Option<Vec<String>>,
    },
}

impl FeatureOption {
    /// Get the default value for this option
    pub fn default_value(&self) -> Option<OptionValue> {
        match self {
            FeatureOption::Boolean { default, .. } => default.map(OptionValue::Boolean),
            FeatureOption::String { default, .. } => {
                default.as_ref().map(|s| OptionValue::String(s.clone()))
            }
        }
    }

    /// Validate a value against this option definition
    pub fn validate_value(&self, value: &OptionValue) -> std::result::Result<(), String> {
        match (self, value) {
            (FeatureOption::Boolean { .. }, OptionValue::Boolean(_)) => Ok(()),
            (FeatureOption::String { r#enum, .. }, OptionValue::String(s)) => {
                if let Some(allowed_values) = r#enum {
                    if allowed_values.contains(s) {
                        Ok(())
                    } else {
                        Err(format!(
                            "Value '{}' is not one of the allowed values: {:?}",
                            s, allowed_values
                        ))
                    }
                } else {
                    Ok(())
                }
            }
            _ => Err("Type mismatch between option definition and provided value".to_string()),
        }
    }
}

/// Feature metadata structure representing devcontainer-feature.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMetadata {
    /// Feature identifier (required)
    pub id: String,

    /// Feature version
    #[serde(default)]
    pub version: Option<String>,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Feature description
    #[serde(default)]
    pub description: Option<String>,

    /// Documentation URL
    #[serde(default)]
    pub documentation_url: Option<String>,

    /// License URL
    #[serde(default)]
    pub license_url: Option<String>,

    /// Feature options
    #[serde(default)]
    pub options: HashMap<String, FeatureOption>,

    /// Container environment variables
    #[serde(default)]
    pub container_env: HashMap<String, String>,

    /// Container mounts
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Whether to use init
    #[serde(default)]
    pub init: Option<bool>,

    /// Whether to run privileged
    #[serde(default)]
    pub privileged: Option<bool>,

    /// Capabilities to add
    #[serde(default)]
    pub cap_add: Vec<String>,

    /// Security options
    #[serde(default)]
    pub security_opt: Vec<String>,

    /// Features to install after
    #[serde(default)]
    pub installs_after: Vec<String>,

    /// Feature dependencies
    #[serde(default)]
    pub depends_on: HashMap<String, serde_json::Value>,

    /// onCreate lifecycle command
    #[serde(default)]
    pub on_create_command: Option<serde_json::Value>,

    /// updateContent lifecycle command
    #[serde(default)]
    pub update_content_command: Option<serde_json::Value>,

    /// postCreate lifecycle command
    #[serde(default)]
    pub post_create_command: Option<serde_json::Value>,

    /// postStart lifecycle command
    #[serde(default)]
    pub post_start_command: Option<serde_json::Value>,

    /// postAttach lifecycle command
    #[serde(default)]
    pub post_attach_command: Option<serde_json::Value>,
}

impl FeatureMetadata {
    /// Check if any lifecycle commands are present
    pub fn has_lifecycle_commands(&self) -> bool {
        self.on_create_command.is_some()
            || self.update_content_command.is_some()
            || self.post_create_command.is_some()
            || self.post_start_command.is_some()
            || self.post_attach_command.is_some()
    }

    /// Validate the feature metadata
    pub fn validate(&self) -> std::result::Result<(), DcxError> {
        // Required field validation
        if self.id.is_empty() {
            return Err(DcxError::configuration(
                "feature id is required and cannot be empty",
            ));
        }

        // Validate option defaults
        for (option_name, option_def) in &self.options {
            if let Some(default_value) = option_def.default_value() {
                if let Err(err) = option_def.validate_value(&default_value) {
                    return Err(DcxError::configuration(format!(
                        "default value for option '{}' is invalid: {}",
                        option_name, err
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parse feature metadata from a devcontainer-feature.json file
#[instrument(level = "debug")]
pub fn parse_feature_metadata(path: &Path) -> Result<FeatureMetadata> {
    debug!("Parsing feature metadata from: {}", path.display());

    // Check if file exists
    if !path.exists() {
        return Err(DcxError::configuration(format!(
            "feature metadata not found: {}",
            path.display()
        )));
    }

    // Read file content
    let content = std::fs::read_to_string(path).map_err(DcxError::from)?;

    // Parse JSON
    let metadata: FeatureMetadata = serde_json::from_str(&content)
        .map_err(|e| DcxError::configuration(format!("failed to parse feature metadata: {}", e)))?;

    debug!(
        "Parsed feature: id={}, name={:?}",
        metadata.id, metadata.name
    );

    // Log options
    for (option_name, option_def) in &metadata.options {
        debug!("Option '{}': {:?}", option_name, option_def);
    }

    // Log lifecycle presence
    if metadata.has_lifecycle_commands() {
        debug!("Feature has lifecycle commands");
    }

    // Validate metadata
    metadata.validate()?;

    Ok(metadata)
}

/// A feature resolved against a devcontainer config: its source reference,
/// user-supplied option overrides, and parsed metadata.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub id: String,
    pub source: String,
    pub options: HashMap<String, OptionValue>,
    pub metadata: FeatureMetadata,
}

/// Where a feature's metadata and install script actually come from. OCI
/// registries and HTTP tarballs are out of scope for this engine: all of the
/// fetching, caching, and digest verification a real implementation needs
/// lives behind this seam instead, so it can be dropped in without touching
/// the resolver or `order_features`.
pub trait FeatureSource: Send + Sync {
    /// Resolve a devcontainer.json feature reference plus its user-supplied
    /// option overrides into a fully-parsed [`ResolvedFeature`].
    fn resolve(&self, reference: &str, options: &HashMap<String, OptionValue>) -> Result<ResolvedFeature>;
}

/// Resolves feature references that are relative filesystem paths to an
/// already-unpacked feature directory containing a `devcontainer-feature.json`.
/// OCI (`ghcr.io/...`) and HTTP tarball references are rejected with a
/// configuration error rather than silently skipped.
pub struct LocalFeatureSource {
    base_dir: PathBuf,
}

impl LocalFeatureSource {
    /// `base_dir` is the directory local feature paths are resolved against —
    /// the devcontainer.json's own directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }
}

impl FeatureSource for LocalFeatureSource {
    fn resolve(&self, reference: &str, options: &HashMap<String, OptionValue>) -> Result<ResolvedFeature> {
        if !(reference.starts_with("./") || reference.starts_with("../")) {
            return Err(DcxError::configuration(format!(
                "feature '{reference}' is not a local path; OCI/HTTP feature fetching is not implemented"
            )));
        }
        let feature_dir = self.base_dir.join(reference);
        let metadata = parse_feature_metadata(&feature_dir.join("devcontainer-feature.json"))?;

        for (name, value) in options {
            if let Some(def) = metadata.options.get(name) {
                def.validate_value(value).map_err(|e| {
                    DcxError::configuration(format!("feature '{reference}' option '{name}': {e}"))
                })?;
            }
        }

        Ok(ResolvedFeature {
            id: metadata.id.clone(),
            source: reference.to_string(),
            options: options.clone(),
            metadata,
        })
    }
}

/// Parse devcontainer.json's `features` object (`{ "<ref>": <options> }`) into
/// resolved features via the given source. Declaration order is preserved
/// here; `order_features` applies dependency ordering afterward.
pub fn resolve_configured_features(
    features_json: &serde_json::Value,
    source: &dyn FeatureSource,
) -> Result<Vec<ResolvedFeature>> {
    let Some(map) = features_json.as_object() else {
        return Ok(Vec::new());
    };
    let mut resolved = Vec::with_capacity(map.len());
    for (reference, raw_options) in map {
        let options = parse_feature_options(raw_options);
        resolved.push(source.resolve(reference, &options)?);
    }
    Ok(resolved)
}

fn parse_feature_options(raw: &serde_json::Value) -> HashMap<String, OptionValue> {
    match raw {
        serde_json::Value::Object(obj) => obj
            .iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::Bool(b) => Some((k.clone(), OptionValue::Boolean(*b))),
                serde_json::Value::String(s) => Some((k.clone(), OptionValue::String(s.clone()))),
                serde_json::Value::Number(n) => Some((k.clone(), OptionValue::String(n.to_string()))),
                _ => None,
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// Normalize a feature option name into the environment variable form used
/// to pass it into install.sh: uppercase, non-alphanumeric runs become a
/// single underscore, and a leading digit gets an underscore prefix.
pub fn normalize_option_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    let mut last_was_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Order features for installation honoring hard `dependsOn` and soft
/// `installsAfter` edges (Kahn's algorithm). Unknown dependency ids are
/// ignored since they may reference features outside this resolved set.
/// A dependency cycle is a fatal, distinguishable configuration error.
pub fn order_features(features: Vec<ResolvedFeature>) -> Result<Vec<ResolvedFeature>> {
    let ids: HashSet<String> = features.iter().map(|f| f.id.clone()).collect();

    let mut indegree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for feature in &features {
        indegree.entry(feature.id.clone()).or_insert(0);

        let mut edges: Vec<&String> = feature.metadata.depends_on.keys().collect();
        edges.extend(feature.metadata.installs_after.iter());

        for dep in edges {
            if !ids.contains(dep) || dep == &feature.id {
                continue;
            }
            dependents.entry(dep.clone()).or_default().push(feature.id.clone());
            *indegree.entry(feature.id.clone()).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<String> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    ready.sort();

    let mut order: Vec<String> = Vec::with_capacity(features.len());
    let mut queue = std::collections::VecDeque::from(ready);
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(children) = dependents.get(&id) {
            let mut newly_ready = Vec::new();
            for child in children {
                let deg = indegree.get_mut(child).expect("child tracked in indegree");
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(child.clone());
                }
            }
            newly_ready.sort();
            for child in newly_ready {
                queue.push_back(child);
            }
        }
    }

    if order.len() != features.len() {
        let stuck: Vec<&String> = ids.iter().filter(|id| !order.contains(id)).collect();
        return Err(DcxError::configuration(format!(
            "feature dependency cycle detected among: {:?}",
            stuck
        )));
    }

    let mut by_id: HashMap<String, ResolvedFeature> =
        features.into_iter().map(|f| (f.id.clone(), f)).collect();
    Ok(order
        .into_iter()
        .map(|id| by_id.remove(&id).expect("id present in by_id"))
        .collect())
}
