//! Workspace identity and content hashing
//!
//! The engine never keeps local state files; instead it derives a stable `workspace_id`
//! from the workspace path (and optional project name override) and a set of content
//! hashes from the resolved configuration. Both are written onto the container as labels
//! (see `labels.rs`) and compared against on every invocation to detect drift.

use crate::errors::{DcxError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema tag mixed into every hash so that a future format change invalidates old hashes
/// rather than silently comparing incompatible digests.
const HASH_SCHEMA_TAG: &str = "dcx-hash-v1";

/// Lowercase RFC4648 base32 without padding; no crate in the dependency stack provides this.
fn base32_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buf: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        buf = (buf << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = (buf >> bits) & 0x1f;
            out.push(ALPHABET[idx as usize] as char);
        }
    }
    if bits > 0 {
        let idx = (buf << (5 - bits)) & 0x1f;
        out.push(ALPHABET[idx as usize] as char);
    }
    out
}

fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lowercase, replace spaces with `_`, drop any char outside `[a-z0-9_-]`, and prepend
/// `dcx_` if the result would otherwise start with a digit. Empty input (before or after
/// stripping) is a configuration error: there is nothing stable left to key a workspace on.
fn sanitize(project_name: &str) -> Result<String> {
    if project_name.is_empty() {
        return Err(DcxError::configuration("project name must not be empty"));
    }
    let mut out = String::with_capacity(project_name.len());
    for ch in project_name.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower == ' ' {
            out.push('_');
        } else if lower.is_ascii_lowercase() || lower.is_ascii_digit() || lower == '_' || lower == '-' {
            out.push(lower);
        }
    }
    if out.is_empty() {
        return Err(DcxError::configuration(format!(
            "project name '{project_name}' has no valid characters after sanitization"
        )));
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert_str(0, "dcx_");
    }
    Ok(out)
}

/// Derive a stable workspace id. With an explicit project name, it's `sanitize(projectName)`;
/// otherwise the first 12 chars of base32(sha256(realpath)) of the resolved workspace root
/// (symlinks resolved, trailing slash normalized).
pub fn compute_workspace_id(path: &Path, project_name: Option<&str>) -> Result<String> {
    if let Some(name) = project_name {
        return sanitize(name);
    }

    let canonical = path.canonicalize().map_err(DcxError::from)?;
    let normalized = canonical.to_string_lossy().trim_end_matches('/').to_string();
    let digest = Sha256::digest(normalized.as_bytes());
    Ok(base32_encode(&digest)[..12].to_string())
}

/// Content hashes over every input that determines whether a built/running container is
/// still valid for the current configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashSet {
    pub overall: String,
    pub config: String,
    pub dockerfile: String,
    pub compose: String,
    pub features: String,
}

/// Per-feature contribution to the features hash: its resolved digest and the options it
/// was installed with.
#[derive(Debug, Clone)]
pub struct FeatureHashInput {
    pub id: String,
    pub resolved_digest: String,
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Strip `//` and `/* */` comments and trailing commas from JSONC bytes, same liberties the
/// config loader takes when parsing devcontainer.json with json5.
fn strip_jsonc(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    match json5::from_str::<serde_json::Value>(&text) {
        Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec()),
        Err(_) => bytes.to_vec(),
    }
}

/// Inputs to [`compute_hashes`]. Kept as raw bytes/paths rather than borrowing
/// `ResolvedDevContainer` directly so callers can hash a config before full resolution
/// completes (the resolver needs `hash.config` to compute the features-layer tag).
pub struct HashInputs<'a> {
    pub devcontainer_json: &'a [u8],
    pub dockerfile: Option<&'a [u8]>,
    pub compose_files: &'a [Vec<u8>],
    pub features: &'a [FeatureHashInput],
}

fn hash_with_tag(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HASH_SCHEMA_TAG.as_bytes());
    for part in parts {
        hasher.update(b"\0");
        hasher.update(part);
    }
    sha256_hex(&hasher.finalize())
}

/// Compute the full [`HashSet`] for a resolved configuration. Empty inputs (no Dockerfile,
/// no compose files, no features) hash as the empty string per the identity contract.
pub fn compute_hashes(inputs: &HashInputs) -> Result<HashSet> {
    let stripped_config = strip_jsonc(inputs.devcontainer_json);
    let config_hash = hash_with_tag(&[&stripped_config]);

    let dockerfile_hash = match inputs.dockerfile {
        Some(bytes) => hash_with_tag(&[bytes]),
        None => String::new(),
    };

    let compose_hash = if inputs.compose_files.is_empty() {
        String::new()
    } else {
        let mut concatenated = Vec::new();
        for file in inputs.compose_files {
            concatenated.extend_from_slice(file);
        }
        hash_with_tag(&[&concatenated])
    };

    let features_hash = if inputs.features.is_empty() {
        String::new()
    } else {
        let mut sorted: Vec<&FeatureHashInput> = inputs.features.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let canonical: Vec<serde_json::Value> = sorted
            .iter()
            .map(|f| {
                serde_json::json!({
                    "id": f.id,
                    "digest": f.resolved_digest,
                    "options": f.options,
                })
            })
            .collect();
        let canonical_json = serde_json::to_vec(&canonical).map_err(|e| {
            DcxError::internal(format!("failed to serialize feature hash inputs: {e}"))
        })?;
        hash_with_tag(&[&canonical_json])
    };

    let overall = hash_with_tag(&[
        config_hash.as_bytes(),
        dockerfile_hash.as_bytes(),
        compose_hash.as_bytes(),
        features_hash.as_bytes(),
    ]);

    Ok(HashSet {
        overall,
        config: config_hash,
        dockerfile: dockerfile_hash,
        compose: compose_hash,
        features: features_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_id_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = compute_workspace_id(dir.path(), None).unwrap();
        let id2 = compute_workspace_id(dir.path(), None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 12);
    }

    #[test]
    fn test_workspace_id_differs_by_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = compute_workspace_id(dir.path(), None).unwrap();
        let id2 = compute_workspace_id(dir.path(), Some("custom")).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_workspace_id_trailing_slash_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = compute_workspace_id(dir.path(), None).unwrap();
        let with_slash = dir.path().join("");
        let id2 = compute_workspace_id(&with_slash, None).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_workspace_id_with_project_name_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let id = compute_workspace_id(dir.path(), Some("My Cool Project!")).unwrap();
        assert_eq!(id, "my_cool_project");
    }

    #[test]
    fn test_workspace_id_project_name_leading_digit_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let id = compute_workspace_id(dir.path(), Some("9lives")).unwrap();
        assert_eq!(id, "dcx_9lives");
    }

    #[test]
    fn test_workspace_id_project_name_empty_after_sanitize_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(compute_workspace_id(dir.path(), Some("!!!")).is_err());
    }

    #[test]
    fn test_workspace_id_empty_project_name_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(compute_workspace_id(dir.path(), Some("")).is_err());
    }

    #[test]
    fn test_hashes_empty_fields_are_empty_string() {
        let inputs = HashInputs {
            devcontainer_json: b"{}",
            dockerfile: None,
            compose_files: &[],
            features: &[],
        };
        let hashes = compute_hashes(&inputs).unwrap();
        assert!(hashes.dockerfile.is_empty());
        assert!(hashes.compose.is_empty());
        assert!(hashes.features.is_empty());
        assert!(!hashes.config.is_empty());
        assert!(!hashes.overall.is_empty());
    }

    #[test]
    fn test_hashes_deterministic_and_order_independent_for_features() {
        let features_a = vec![
            FeatureHashInput {
                id: "b".into(),
                resolved_digest: "digestb".into(),
                options: BTreeMap::new(),
            },
            FeatureHashInput {
                id: "a".into(),
                resolved_digest: "digesta".into(),
                options: BTreeMap::new(),
            },
        ];
        let features_b = vec![
            FeatureHashInput {
                id: "a".into(),
                resolved_digest: "digesta".into(),
                options: BTreeMap::new(),
            },
            FeatureHashInput {
                id: "b".into(),
                resolved_digest: "digestb".into(),
                options: BTreeMap::new(),
            },
        ];
        let h1 = compute_hashes(&HashInputs {
            devcontainer_json: b"{}",
            dockerfile: None,
            compose_files: &[],
            features: &features_a,
        })
        .unwrap();
        let h2 = compute_hashes(&HashInputs {
            devcontainer_json: b"{}",
            dockerfile: None,
            compose_files: &[],
            features: &features_b,
        })
        .unwrap();
        assert_eq!(h1.features, h2.features);
    }

    #[test]
    fn test_hashes_change_with_config_content() {
        let h1 = compute_hashes(&HashInputs {
            devcontainer_json: b"{\"name\": \"a\"}",
            dockerfile: None,
            compose_files: &[],
            features: &[],
        })
        .unwrap();
        let h2 = compute_hashes(&HashInputs {
            devcontainer_json: b"{\"name\": \"b\"}",
            dockerfile: None,
            compose_files: &[],
            features: &[],
        })
        .unwrap();
        assert_ne!(h1.config, h2.config);
        assert_ne!(h1.overall, h2.overall);
    }
}
