//! Execution plans and the plan resolver
//!
//! A [`ResolvedDevContainer`](crate::resolved::ResolvedDevContainer) carries exactly one
//! `ExecutionPlan`, chosen from the devcontainer.json fields present (`image`, `dockerFile`,
//! or `dockerComposeFile`). The resolver validates the plan's invariants and computes the
//! derived image tags the build pipeline will produce.

use crate::errors::{DcxError, Result};
use std::path::{Path, PathBuf};

/// How the primary container's image is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionPlan {
    /// Use a pre-built image as-is.
    Image(ImagePlan),
    /// Build from a Dockerfile.
    Dockerfile(DockerfilePlan),
    /// Run via Docker Compose.
    Compose(ComposePlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlan {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerfilePlan {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub build_args: std::collections::HashMap<String, String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposePlan {
    pub files: Vec<PathBuf>,
    pub service: String,
    pub run_services: Vec<String>,
}

impl ExecutionPlan {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionPlan::Image(_) => "image",
            ExecutionPlan::Dockerfile(_) => "dockerfile",
            ExecutionPlan::Compose(_) => "compose",
        }
    }
}

/// A registry reference is "valid" for our purposes if it's a non-empty string
/// without whitespace; the daemon is the real authority on full validity.
fn is_valid_registry_reference(image: &str) -> bool {
    !image.is_empty() && !image.chars().any(char::is_whitespace)
}

/// Validates a plan's invariants and resolves paths relative to `config_dir`.
///
/// Mirrors the devcontainer.json field that produced the plan: `dockerFile`, `build.context`,
/// and compose file paths are all specified relative to the config file's directory.
pub fn resolve_plan(plan: ExecutionPlan, config_dir: &Path) -> Result<ExecutionPlan> {
    match plan {
        ExecutionPlan::Image(ref img) => {
            if !is_valid_registry_reference(&img.image) {
                return Err(DcxError::configuration(format!(
                    "'{}' is not a valid image reference",
                    img.image
                )));
            }
            Ok(plan)
        }
        ExecutionPlan::Dockerfile(df) => {
            let dockerfile = if df.dockerfile.is_absolute() {
                df.dockerfile
            } else {
                config_dir.join(&df.dockerfile)
            };
            let context = if df.context.as_os_str().is_empty() {
                config_dir.to_path_buf()
            } else if df.context.is_absolute() {
                df.context
            } else {
                config_dir.join(&df.context)
            };
            Ok(ExecutionPlan::Dockerfile(DockerfilePlan {
                dockerfile,
                context,
                build_args: df.build_args,
                target: df.target,
            }))
        }
        ExecutionPlan::Compose(compose) => {
            if compose.files.is_empty() {
                return Err(DcxError::configuration(
                    "compose plan requires at least one compose file",
                ));
            }
            if compose.service.is_empty() {
                return Err(DcxError::configuration(
                    "compose plan requires a primary service name",
                ));
            }
            Ok(ExecutionPlan::Compose(compose))
        }
    }
}

/// Derived image tag for the features layer: `<ns>/<workspace_id>:<hash_config_prefix>-features`.
pub fn derived_features_tag(namespace: &str, workspace_id: &str, hash_config: &str) -> String {
    let prefix: String = hash_config.chars().take(12).collect();
    format!("{namespace}/{workspace_id}:{prefix}-features")
}

/// Derived image tag for the UID-remap layer: `<base>-uid<host_uid>`.
pub fn derived_uid_tag(base_tag: &str, host_uid: u32) -> String {
    format!("{base_tag}-uid{host_uid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_plan_rejects_empty() {
        let plan = ExecutionPlan::Image(ImagePlan {
            image: String::new(),
        });
        assert!(resolve_plan(plan, Path::new("/cfg")).is_err());
    }

    #[test]
    fn test_image_plan_rejects_whitespace() {
        let plan = ExecutionPlan::Image(ImagePlan {
            image: "not a ref".to_string(),
        });
        assert!(resolve_plan(plan, Path::new("/cfg")).is_err());
    }

    #[test]
    fn test_dockerfile_plan_defaults_context_to_config_dir() {
        let plan = ExecutionPlan::Dockerfile(DockerfilePlan {
            dockerfile: PathBuf::from("Dockerfile"),
            context: PathBuf::new(),
            build_args: Default::default(),
            target: None,
        });
        let resolved = resolve_plan(plan, Path::new("/workspace/.devcontainer")).unwrap();
        if let ExecutionPlan::Dockerfile(df) = resolved {
            assert_eq!(df.context, PathBuf::from("/workspace/.devcontainer"));
            assert_eq!(
                df.dockerfile,
                PathBuf::from("/workspace/.devcontainer/Dockerfile")
            );
        } else {
            panic!("expected dockerfile plan");
        }
    }

    #[test]
    fn test_compose_plan_requires_files_and_service() {
        let plan = ExecutionPlan::Compose(ComposePlan {
            files: vec![],
            service: "app".to_string(),
            run_services: vec![],
        });
        assert!(resolve_plan(plan, Path::new("/cfg")).is_err());

        let plan = ExecutionPlan::Compose(ComposePlan {
            files: vec![PathBuf::from("docker-compose.yml")],
            service: String::new(),
            run_services: vec![],
        });
        assert!(resolve_plan(plan, Path::new("/cfg")).is_err());
    }

    #[test]
    fn test_derived_tags() {
        assert_eq!(
            derived_features_tag("dcx", "abc123", "0123456789abcdefextra"),
            "dcx/abc123:0123456789ab-features"
        );
        assert_eq!(derived_uid_tag("dcx/abc:features", 1000), "dcx/abc:features-uid1000");
    }
}
