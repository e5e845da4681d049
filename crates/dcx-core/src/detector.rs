//! State detector: a pure function from a daemon snapshot to a `ContainerState`
//!
//! Deliberately holds no state of its own — every call re-derives the answer from the
//! label-filtered container listing the runtime adapter returns. This replaces local
//! state files entirely.

use crate::labels;
use crate::runtime_adapter::ContainerSummary;
use std::fmt;

/// Lifecycle state of a workspace's primary container, as observed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No containers exist for this workspace.
    Absent,
    /// A container exists but has never been started.
    Created,
    /// The primary container is running and its hash matches.
    Running,
    /// The primary container exists, is stopped, and its hash matches.
    Stopped,
    /// The primary container's `hash.overall` differs from the current configuration.
    Stale,
    /// Zero or more than one container claims to be primary for this workspace.
    Broken,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Absent => "absent",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Stale => "stale",
            ContainerState::Broken => "broken",
        };
        write!(f, "{s}")
    }
}

/// Diagnostic context returned alongside the detected state, useful for error messages
/// and `status` output.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub candidate_count: usize,
    pub primary_count: usize,
    pub note: Option<String>,
}

/// Detection result: the state, the primary container if unambiguous, and diagnostics.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub state: ContainerState,
    pub primary: Option<ContainerSummary>,
    pub diagnostics: Diagnostics,
}

/// Pure with respect to the `containers` snapshot passed in: the caller is responsible for
/// having already queried the runtime adapter with a `workspace.id` label filter that
/// includes the legacy label key (the adapter's `list_by_labels` call is made with just the
/// current-schema key; legacy-labeled containers are still matched here via
/// [`labels::get_workspace_id`], which consults both schemas).
pub fn detect_state(
    workspace_id: &str,
    current_hash_overall: &str,
    containers: &[ContainerSummary],
) -> DetectionResult {
    let candidates: Vec<&ContainerSummary> = containers
        .iter()
        .filter(|c| labels::get_workspace_id(&c.labels).as_deref() == Some(workspace_id))
        .collect();

    if candidates.is_empty() {
        return DetectionResult {
            state: ContainerState::Absent,
            primary: None,
            diagnostics: Diagnostics {
                candidate_count: 0,
                primary_count: 0,
                note: None,
            },
        };
    }

    let primaries: Vec<&&ContainerSummary> = candidates
        .iter()
        .filter(|c| labels::is_primary(&c.labels))
        .collect();

    if primaries.len() != 1 {
        return DetectionResult {
            state: ContainerState::Broken,
            primary: None,
            diagnostics: Diagnostics {
                candidate_count: candidates.len(),
                primary_count: primaries.len(),
                note: Some(if primaries.is_empty() {
                    "no container is marked primary for this workspace".to_string()
                } else {
                    format!("{} containers are marked primary for this workspace", primaries.len())
                }),
            },
        };
    }

    let primary = (*primaries[0]).clone();
    let diagnostics = Diagnostics {
        candidate_count: candidates.len(),
        primary_count: 1,
        note: None,
    };

    let primary_hash = labels::get_hash_overall(&primary.labels);
    if primary_hash.as_deref() != Some(current_hash_overall) {
        return DetectionResult {
            state: ContainerState::Stale,
            primary: Some(primary),
            diagnostics,
        };
    }

    let state = if primary.running {
        ContainerState::Running
    } else if labels::get_lifecycle_state(&primary.labels).as_deref() == Some("stopped") {
        ContainerState::Stopped
    } else {
        ContainerState::Created
    };

    DetectionResult {
        state,
        primary: Some(primary),
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn container(labels: Vec<(&str, &str)>, running: bool) -> ContainerSummary {
        ContainerSummary {
            id: "c1".into(),
            name: "c1".into(),
            state: if running { "running".into() } else { "exited".into() },
            running,
            labels: labels.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_absent_when_no_containers() {
        let result = detect_state("ws1", "hash1", &[]);
        assert_eq!(result.state, ContainerState::Absent);
    }

    #[test]
    fn test_broken_when_no_primary() {
        let containers = vec![container(vec![("dcx.workspace.id", "ws1")], true)];
        let result = detect_state("ws1", "hash1", &containers);
        assert_eq!(result.state, ContainerState::Broken);
        assert_eq!(result.diagnostics.primary_count, 0);
    }

    #[test]
    fn test_broken_when_multiple_primaries() {
        let containers = vec![
            container(vec![("dcx.workspace.id", "ws1"), ("dcx.container.primary", "true")], true),
            container(vec![("dcx.workspace.id", "ws1"), ("dcx.container.primary", "true")], true),
        ];
        let result = detect_state("ws1", "hash1", &containers);
        assert_eq!(result.state, ContainerState::Broken);
        assert_eq!(result.diagnostics.primary_count, 2);
    }

    #[test]
    fn test_stale_on_hash_mismatch() {
        let containers = vec![container(
            vec![
                ("dcx.workspace.id", "ws1"),
                ("dcx.container.primary", "true"),
                ("dcx.hash.overall", "old-hash"),
            ],
            false,
        )];
        let result = detect_state("ws1", "new-hash", &containers);
        assert_eq!(result.state, ContainerState::Stale);
    }

    #[test]
    fn test_running_when_hash_matches_and_running() {
        let containers = vec![container(
            vec![
                ("dcx.workspace.id", "ws1"),
                ("dcx.container.primary", "true"),
                ("dcx.hash.overall", "hash1"),
            ],
            true,
        )];
        let result = detect_state("ws1", "hash1", &containers);
        assert_eq!(result.state, ContainerState::Running);
    }

    #[test]
    fn test_stopped_vs_created() {
        let stopped_containers = vec![container(
            vec![
                ("dcx.workspace.id", "ws1"),
                ("dcx.container.primary", "true"),
                ("dcx.hash.overall", "hash1"),
                ("dcx.lifecycle.state", "stopped"),
            ],
            false,
        )];
        assert_eq!(
            detect_state("ws1", "hash1", &stopped_containers).state,
            ContainerState::Stopped
        );

        let created_containers = vec![container(
            vec![
                ("dcx.workspace.id", "ws1"),
                ("dcx.container.primary", "true"),
                ("dcx.hash.overall", "hash1"),
            ],
            false,
        )];
        assert_eq!(
            detect_state("ws1", "hash1", &created_containers).state,
            ContainerState::Created
        );
    }

    #[test]
    fn test_legacy_labels_recognized() {
        let containers = vec![container(
            vec![
                ("devcontainer.workspace.id", "ws1"),
                ("devcontainer.container.primary", "true"),
                ("devcontainer.hash.overall", "hash1"),
            ],
            true,
        )];
        let result = detect_state("ws1", "hash1", &containers);
        assert_eq!(result.state, ContainerState::Running);
    }
}
