//! Workspace resolution utilities including Git worktree and repository root support
//!
//! This module provides functionality to correctly identify workspace roots,
//! including detection of Git worktrees for proper isolation and container naming,
//! and git repository root detection for `--mount-workspace-git-root` support.

use crate::errors::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Result of git repository root detection
#[derive(Debug, Clone, PartialEq)]
pub struct GitRootResult {
    /// The detected git repository root
    pub git_root: PathBuf,
    /// Whether this is a git worktree (vs. a regular repository)
    pub is_worktree: bool,
}

/// Resolve the canonical workspace root path
///
/// This function handles both regular directories and Git worktrees:
/// - For regular directories: returns the canonicalized path
/// - For Git worktrees: detects the worktree and returns its root path
///
/// Git worktrees are detected by checking if `.git` is a file (not a directory)
/// that contains a `gitdir:` reference pointing to the worktrees directory.
///
/// **Note**: When invoked from a subdirectory of a git repository, this function
/// will walk up the directory tree to find and return the git repository root.
/// For direct access to git root detection logic, see [`find_git_repository_root`].
///
/// # Arguments
///
/// * `path` - The starting path to resolve (can be a subdirectory)
///
/// # Returns
///
/// Returns the canonical workspace root path. For Git worktrees, this is the
/// worktree root directory, not the main repository root.
///
/// # Example
///
/// ```rust
/// use dcx_core::workspace::resolve_workspace_root;
/// use std::path::Path;
///
/// # fn example() -> anyhow::Result<()> {
/// let workspace = resolve_workspace_root(Path::new("."))?;
/// println!("Workspace root: {}", workspace.display());
/// # Ok(())
/// # }
/// ```
#[instrument]
pub fn resolve_workspace_root(path: &Path) -> Result<PathBuf> {
    debug!("Resolving workspace root for path: {}", path.display());

    // First canonicalize the path to resolve any symlinks and relative paths
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    // Check if this is within a Git worktree
    if let Some(worktree_root) = detect_git_worktree(&canonical)? {
        debug!("Detected Git worktree root: {}", worktree_root.display());
        return Ok(worktree_root);
    }

    // Try to find the git repository root (directory containing .git)
    if let Some(result) = find_git_repository_root(&canonical)? {
        debug!("Found git repository root: {}", result.git_root.display());
        return Ok(result.git_root);
    }

    // Return the canonical path as the workspace root
    debug!("Using canonical path as workspace root");
    Ok(canonical)
}

/// Find the git repository root by walking up the directory tree
///
/// This function searches for the directory containing `.git` (whether it's
/// a directory for regular repos or a file for worktrees/submodules).
///
/// # Arguments
///
/// * `path` - The starting path to search from
///
/// # Returns
///
/// Returns `Some(GitRootResult)` with the repository root path if found,
/// or `None` if not within a git repository.
///
/// # Example
///
/// ```rust
/// use dcx_core::workspace::find_git_repository_root;
/// use std::path::Path;
///
/// # fn example() -> anyhow::Result<()> {
/// if let Some(result) = find_git_repository_root(Path::new("."))? {
///     println!("Git root: {}", result.git_root.display());
/// }
/// # Ok(())
/// # }
/// ```
#[instrument]
pub fn find_git_repository_root(path: &Path) -> Result<Option<GitRootResult>> {
    debug!("Finding git repository root for path: {}", path.display());

    // First canonicalize the path
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    // Walk up the directory tree looking for .git
    let mut current = canonical.as_path();
    loop {
        let git_path = current.join(".git");

        if git_path.exists() {
            let is_worktree = if git_path.is_file() {
                // Check if this is a worktree by examining the gitdir content
                match parse_git_file(&git_path)? {
                    Some(gitdir) => {
                        let components: Vec<_> = gitdir.components().collect();
                        components.windows(2).any(|window| {
                            if let (
                                std::path::Component::Normal(a),
                                std::path::Component::Normal(b),
                            ) = (window[0], window[1])
                            {
                                a == ".git" && b == "worktrees"
                            } else {
                                false
                            }
                        })
                    }
                    None => false,
                }
            } else {
                false
            };

            debug!(
                "Found git root at: {} (worktree: {})",
                current.display(),
                is_worktree
            );
            return Ok(Some(GitRootResult {
                git_root: current.to_path_buf(),
                is_worktree,
            }));
        }

        // Move up to parent directory
        match current.parent() {
            Some(parent) => current = parent,
            None => {
                debug!("Reached filesystem root without finding .git");
                return Ok(None);
            }
        }
    }
}

/// Detect if the given path is within a Git worktree
///
/// A Git worktree is identified by:
/// 1. A `.git` file (not directory) containing `gitdir: <path>` reference
/// 2. The referenced path contains `worktrees/<name>` in the path
///
/// # Arguments
///
/// * `path` - Path to check for Git worktree
///
/// # Returns
///
/// Returns `Some(PathBuf)` with the worktree root if detected, or `None` if not a worktree.
/// Returns an error if the worktree metadata is inconsistent or unreadable.
#[instrument]
pub fn detect_git_worktree(path: &Path) -> Result<Option<PathBuf>> {
    debug!("Checking for Git worktree at: {}", path.display());

    // Walk up the directory tree looking for .git
    let mut current = path;
    loop {
        let git_path = current.join(".git");

        if git_path.exists() {
            if git_path.is_file() {
                // This might be a worktree - read the .git file
                debug!("Found .git file at: {}", git_path.display());
                match parse_git_file(&git_path)? {
                    Some(gitdir) => {
                        // Check if this is a worktree by examining path components
                        // A worktree has the canonical pattern: .../path/.git/worktrees/<name>
                        let components: Vec<_> = gitdir.components().collect();
                        let is_worktree = components.windows(2).any(|window| {
                            if let (
                                std::path::Component::Normal(a),
                                std::path::Component::Normal(b),
                            ) = (window[0], window[1])
                            {
                                a == ".git" && b == "worktrees"
                            } else {
                                false
                            }
                        });

                        if is_worktree {
                            debug!("Detected worktree pointing to gitdir: {}", gitdir.display());
                            // The current directory is the worktree root
                            return Ok(Some(current.to_path_buf()));
                        } else {
                            debug!("Git file found but not a worktree");
                            return Ok(None);
                        }
                    }
                    None => {
                        debug!("Could not parse gitdir from .git file");
                        return Ok(None);
                    }
                }
            } else if git_path.is_dir() {
                // This is a regular git repository, not a worktree
                debug!("Found regular .git directory at: {}", git_path.display());
                return Ok(None);
            }
        }

        // Move up to parent directory
        match current.parent() {
            Some(parent) => current = parent,
            None => {
                debug!("Reached root without finding .git");
                return Ok(None);
            }
        }
    }
}

/// Parse a Git file that contains a gitdir reference
///
/// Git worktrees use a `.git` file (not directory) that contains:
/// ```text
/// gitdir: /path/to/main/repo/.git/worktrees/<name>
/// ```
///
/// # Arguments
///
/// * `git_file_path` - Path to the .git file
///
/// # Returns
///
/// Returns the gitdir path if successfully parsed, or None if the file format is invalid.
#[instrument]
fn parse_git_file(git_file_path: &Path) -> Result<Option<PathBuf>> {
    debug!("Parsing git file: {}", git_file_path.display());

    let content = fs::read_to_string(git_file_path).map_err(crate::errors::DcxError::from)?;

    // Parse the gitdir line: "gitdir: <path>"
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(stripped) = trimmed.strip_prefix("gitdir:") {
            let gitdir_path = stripped.trim();
            debug!("Extracted gitdir path: {}", gitdir_path);
            return Ok(Some(PathBuf::from(gitdir_path)));
        }
    }

    debug!("No gitdir line found in .git file");
    Ok(None)
}
