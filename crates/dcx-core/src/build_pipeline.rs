//! Build pipeline: three sequential, tag-cacheable stages producing the image the
//! lifecycle executor hands to `container_create`.
//!
//! Each stage is skipped when its output tag already exists and no force-rebuild flag was
//! passed, so a warm cache makes `up` on an unchanged workspace cheap.

use crate::errors::{DcxError, Result};
use crate::features::{normalize_option_name, ResolvedFeature};
use crate::plan::{derived_features_tag, derived_uid_tag, ExecutionPlan};
use crate::resolved::{ResolvedDevContainer, SecurityRequirements};
use crate::runtime_adapter::{BuildOptions, RuntimeAdapter};
use std::fmt::Write as _;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildFlags {
    pub force_rebuild: bool,
    pub pull: bool,
}

/// Outcome of running the pipeline: the final image tag the container should be created
/// from, plus the accumulated security posture from the features layer.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_tag: String,
    pub security: SecurityRequirements,
}

/// Namespace prefix used for derived image tags; matches the label namespace.
const NAMESPACE: &str = "dcx";

/// Stage 1: resolve (and if necessary produce) the base image.
#[instrument(skip(adapter, resolved))]
async fn stage_base(adapter: &dyn RuntimeAdapter, resolved: &ResolvedDevContainer, flags: BuildFlags) -> Result<String> {
    match &resolved.plan {
        ExecutionPlan::Image(img) => {
            if flags.pull || !adapter.image_exists(&img.image).await? {
                adapter.image_pull(&img.image).await?;
            }
            Ok(img.image.clone())
        }
        ExecutionPlan::Dockerfile(df) => {
            let tag = format!("{NAMESPACE}/{}:base", resolved.id);
            if !flags.force_rebuild && adapter.image_exists(&tag).await? {
                return Ok(tag);
            }
            let opts = BuildOptions {
                context: df.context.to_string_lossy().to_string(),
                dockerfile: df.dockerfile.to_string_lossy().to_string(),
                tag: tag.clone(),
                build_args: df.build_args.clone(),
                target: df.target.clone(),
                cache_from: vec![tag.clone()],
                ssh_forward: true,
            };
            adapter.image_build(&opts).await
        }
        ExecutionPlan::Compose(compose) => {
            // The primary service's own build stanza (if any) is handled by compose itself
            // when `compose up`/`compose build` runs; there is no single "base image" tag
            // to resolve here, so the service name stands in as a placeholder identity.
            Ok(compose.service.clone())
        }
    }
}

/// Synthesize the Dockerfile for the features layer: `FROM <base>` followed by one
/// `COPY`+`RUN install.sh` block per feature in topological order, each with its options
/// passed in as env-normalized `ENV` lines.
fn render_features_dockerfile(base_image: &str, features: &[ResolvedFeature]) -> String {
    let mut dockerfile = format!("FROM {base_image}\n");
    for feature in features {
        let _ = writeln!(dockerfile, "# feature: {}", feature.id);
        let _ = writeln!(dockerfile, "COPY features/{} /tmp/dcx-features/{}", feature.id, feature.id);
        for (name, value) in &feature.options {
            let env_name = normalize_option_name(name);
            let env_value = match value {
                crate::features::OptionValue::Boolean(b) => b.to_string(),
                crate::features::OptionValue::String(s) => s.clone(),
            };
            let _ = writeln!(dockerfile, "ENV {env_name}=\"{env_value}\"");
        }
        let _ = writeln!(
            dockerfile,
            "RUN chmod +x /tmp/dcx-features/{}/install.sh && /tmp/dcx-features/{}/install.sh",
            feature.id, feature.id
        );
        if feature.metadata.privileged.unwrap_or(false) {
            warn!("feature '{}' requires privileged mode", feature.id);
        }
    }
    dockerfile
}

/// Stage 2: synthesize and build the features layer on top of the base image.
#[instrument(skip(adapter, resolved))]
async fn stage_features(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    base_tag: &str,
    flags: BuildFlags,
) -> Result<String> {
    if resolved.features.is_empty() {
        return Ok(base_tag.to_string());
    }

    let tag = derived_features_tag(NAMESPACE, &resolved.id, &resolved.hashes.config);
    if !flags.force_rebuild && adapter.image_exists(&tag).await? {
        return Ok(tag);
    }

    let dockerfile_contents = render_features_dockerfile(base_tag, &resolved.features);
    let build_dir = std::env::temp_dir().join(format!("dcx-features-{}", resolved.id));
    std::fs::create_dir_all(&build_dir).map_err(DcxError::from)?;
    let dockerfile_path = build_dir.join("Dockerfile");
    std::fs::write(&dockerfile_path, dockerfile_contents).map_err(DcxError::from)?;

    let opts = BuildOptions {
        context: build_dir.to_string_lossy().to_string(),
        dockerfile: dockerfile_path.to_string_lossy().to_string(),
        tag: tag.clone(),
        build_args: Default::default(),
        target: None,
        cache_from: vec![tag.clone()],
        ssh_forward: false,
    };
    adapter.image_build(&opts).await
}

/// Stage 3: a thin layer remapping the effective user's UID/GID to the host invoker's, so
/// bind-mounted files keep sane ownership. Linux-only; a non-POSIX host skips this stage
/// (see DESIGN.md's open-question decision on non-POSIX UID remap).
#[instrument(skip(adapter, resolved))]
async fn stage_uid_remap(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    base_tag: &str,
    flags: BuildFlags,
) -> Result<String> {
    if !resolved.should_update_uid {
        return Ok(base_tag.to_string());
    }

    let tag = derived_uid_tag(base_tag, resolved.host_uid);
    if !flags.force_rebuild && adapter.image_exists(&tag).await? {
        return Ok(tag);
    }

    let dockerfile = format!(
        "FROM {base_tag}\nRUN groupmod -g {gid} $(id -gn {user} 2>/dev/null || echo {user}) 2>/dev/null || true\nRUN usermod -u {uid} {user} 2>/dev/null || true\n",
        gid = resolved.host_gid,
        uid = resolved.host_uid,
        user = resolved.container_user.as_deref().or(resolved.remote_user.as_deref()).unwrap_or("root"),
    );
    let build_dir = std::env::temp_dir().join(format!("dcx-uid-{}", resolved.id));
    std::fs::create_dir_all(&build_dir).map_err(DcxError::from)?;
    let dockerfile_path = build_dir.join("Dockerfile");
    std::fs::write(&dockerfile_path, dockerfile).map_err(DcxError::from)?;

    let opts = BuildOptions {
        context: build_dir.to_string_lossy().to_string(),
        dockerfile: dockerfile_path.to_string_lossy().to_string(),
        tag: tag.clone(),
        build_args: Default::default(),
        target: None,
        cache_from: vec![tag.clone()],
        ssh_forward: false,
    };
    adapter.image_build(&opts).await
}

/// Run all three stages in order, returning the final image tag and the accumulated
/// security requirements the executor should apply at container-create time.
pub async fn run(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    flags: BuildFlags,
) -> Result<BuildOutcome> {
    let base = stage_base(adapter, resolved, flags).await?;
    let with_features = stage_features(adapter, resolved, &base, flags).await?;
    let final_tag = stage_uid_remap(adapter, resolved, &with_features, flags).await?;

    let security = SecurityRequirements {
        cap_add: resolved.cap_add.clone(),
        security_opt: resolved.security_opt.clone(),
        privileged: resolved.privileged,
        init: resolved.init,
        container_env: resolved.container_env.clone(),
    };

    Ok(BuildOutcome {
        image_tag: final_tag,
        security,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureMetadata;
    use std::collections::HashMap;

    fn bare_feature(id: &str) -> ResolvedFeature {
        ResolvedFeature {
            id: id.to_string(),
            source: format!("ghcr.io/test/{id}"),
            options: HashMap::new(),
            metadata: FeatureMetadata {
                id: id.to_string(),
                version: None,
                name: None,
                description: None,
                documentation_url: None,
                license_url: None,
                options: HashMap::new(),
                container_env: HashMap::new(),
                mounts: Vec::new(),
                init: None,
                privileged: None,
                cap_add: Vec::new(),
                security_opt: Vec::new(),
                installs_after: Vec::new(),
                depends_on: HashMap::new(),
                on_create_command: None,
                update_content_command: None,
                post_create_command: None,
                post_start_command: None,
                post_attach_command: None,
            },
        }
    }

    #[test]
    fn test_render_features_dockerfile_includes_all_features_in_order() {
        let features = vec![bare_feature("a"), bare_feature("b")];
        let dockerfile = render_features_dockerfile("base:latest", &features);
        assert!(dockerfile.starts_with("FROM base:latest\n"));
        let a_pos = dockerfile.find("feature: a").unwrap();
        let b_pos = dockerfile.find("feature: b").unwrap();
        assert!(a_pos < b_pos);
    }
}
