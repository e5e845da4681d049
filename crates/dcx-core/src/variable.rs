//! Variable substitution for devcontainer.json
//!
//! Supports the subset of substitution tokens needed to resolve a config into
//! concrete paths and identifiers: `${localWorkspaceFolder}`, `${localEnv:VAR}`,
//! and `${devcontainerId}`.

use crate::errors::{DcxError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use tracing::{debug, instrument};

const VARIABLE_PATTERN: &str = r"\$\{([^}]+)\}";

/// Resolved values available to the substitution engine.
#[derive(Debug, Clone)]
pub struct SubstitutionContext {
    pub local_workspace_folder: String,
    pub local_env: HashMap<String, String>,
    pub devcontainer_id: String,
}

impl SubstitutionContext {
    #[instrument(skip_all, fields(workspace_path = %workspace_path.display()))]
    pub fn new(workspace_path: &Path) -> Result<Self> {
        let canonical_path = workspace_path.canonicalize().map_err(|e| {
            DcxError::configuration(format!(
                "invalid workspace path '{}': {}",
                workspace_path.display(),
                e
            ))
        })?;

        let local_workspace_folder = canonical_path.to_string_lossy().to_string();
        let local_env: HashMap<String, String> = env::vars().collect();
        let devcontainer_id = Self::generate_devcontainer_id(&local_workspace_folder);

        debug!(
            workspace = %local_workspace_folder,
            devcontainer_id = %devcontainer_id,
            "substitution context created"
        );

        Ok(Self {
            local_workspace_folder,
            local_env,
            devcontainer_id,
        })
    }

    /// First 12 hex characters of the SHA-256 of the canonical workspace path.
    fn generate_devcontainer_id(workspace_path: &str) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(workspace_path.as_bytes());
        format!("{:x}", hasher.finalize())[..12].to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubstitutionReport {
    pub replacements: HashMap<String, String>,
    pub unknown_variables: Vec<String>,
}

impl SubstitutionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replacement(&mut self, variable: String, value: String) {
        self.replacements.insert(variable, value);
    }

    pub fn add_unknown_variable(&mut self, variable: String) {
        self.unknown_variables.push(variable);
    }

    pub fn has_substitutions(&self) -> bool {
        !self.replacements.is_empty() || !self.unknown_variables.is_empty()
    }
}

pub struct VariableSubstitution;

impl VariableSubstitution {
    #[instrument(skip_all, fields(input_length = input.len()))]
    pub fn substitute_string(
        input: &str,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> String {
        let regex = regex::Regex::new(VARIABLE_PATTERN)
            .expect("variable substitution regex should be valid");

        regex
            .replace_all(input, |caps: &regex::Captures| {
                let variable_expr = &caps[1];
                match Self::resolve_variable(variable_expr, context) {
                    Some(value) => {
                        report.add_replacement(variable_expr.to_string(), value.clone());
                        value
                    }
                    None => {
                        report.add_unknown_variable(variable_expr.to_string());
                        format!("${{{}}}", variable_expr)
                    }
                }
            })
            .to_string()
    }

    fn resolve_variable(variable_expr: &str, context: &SubstitutionContext) -> Option<String> {
        match variable_expr {
            "localWorkspaceFolder" | "containerWorkspaceFolder" => {
                Some(context.local_workspace_folder.clone())
            }
            "devcontainerId" => Some(context.devcontainer_id.clone()),
            expr if expr.starts_with("localEnv:") => {
                let env_var = &expr[9..];
                Some(context.local_env.get(env_var).cloned().unwrap_or_default())
            }
            _ => None,
        }
    }

    pub fn substitute_json_value(
        value: &Value,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> Value {
        match value {
            Value::String(s) => Value::String(Self::substitute_string(s, context, report)),
            Value::Array(arr) => Value::Array(
                arr.iter()
                    .map(|v| Self::substitute_json_value(v, context, report))
                    .collect(),
            ),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Self::substitute_json_value(v, context, report)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn context_creation_resolves_canonical_path_and_id() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let context = SubstitutionContext::new(temp_dir.path())?;
        assert!(context
            .local_workspace_folder
            .contains(temp_dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(context.devcontainer_id.len(), 12);
        Ok(())
    }

    #[test]
    fn substitute_string_replaces_known_variables() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let context = SubstitutionContext::new(temp_dir.path())?;
        let mut report = SubstitutionReport::new();

        let result = VariableSubstitution::substitute_string(
            "${localWorkspaceFolder}/src",
            &context,
            &mut report,
        );
        assert!(result.ends_with("/src"));
        assert!(report.has_substitutions());
    }

    #[test]
    fn substitute_string_leaves_unknown_variables_unchanged() {
        let context = SubstitutionContext {
            local_workspace_folder: "/ws".into(),
            local_env: HashMap::new(),
            devcontainer_id: "abc123def456".into(),
        };
        let mut report = SubstitutionReport::new();

        let result =
            VariableSubstitution::substitute_string("${containerEnv:FOO}", &context, &mut report);
        assert_eq!(result, "${containerEnv:FOO}");
        assert_eq!(report.unknown_variables, vec!["containerEnv:FOO"]);
    }

    #[test]
    fn substitute_string_resolves_local_env_with_empty_default() {
        let mut env_map = HashMap::new();
        env_map.insert("FOO".to_string(), "bar".to_string());
        let context = SubstitutionContext {
            local_workspace_folder: "/ws".into(),
            local_env: env_map,
            devcontainer_id: "abc123def456".into(),
        };
        let mut report = SubstitutionReport::new();

        assert_eq!(
            VariableSubstitution::substitute_string("${localEnv:FOO}", &context, &mut report),
            "bar"
        );
        assert_eq!(
            VariableSubstitution::substitute_string("${localEnv:MISSING}", &context, &mut report),
            ""
        );
    }
}
