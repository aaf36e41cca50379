//! Workspace path guard: filesystem sandboxing to one root directory.
//!
//! File tools resolve every model-supplied path through [`Workspace::resolve`].
//! Relative paths are taken from the workspace root; `..` components are
//! rejected outright and symlinks are resolved before the containment check.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// The directory tools are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a workspace rooted at an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathValidationError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|e| PathValidationError::CanonicalizeFailed {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { root: canonical })
    }

    /// Workspace rooted at the process working directory.
    pub fn current() -> Result<Self, PathValidationError> {
        let cwd = std::env::current_dir().map_err(|e| PathValidationError::CanonicalizeFailed {
            path: ".".into(),
            reason: e.to_string(),
        })?;
        Self::new(cwd)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a path and return its resolved absolute form.
    ///
    /// The target does not need to exist; the nearest existing ancestor is
    /// canonicalized and the remaining components appended.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let input = Path::new(path);

        if input.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathValidationError::PathTraversal { path: path.into() });
        }

        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };

        let canonical = canonicalize_lenient(&joined).map_err(|e| {
            PathValidationError::CanonicalizeFailed {
                path: path.into(),
                reason: e.to_string(),
            }
        })?;

        if !canonical.starts_with(&self.root) {
            return Err(PathValidationError::OutsideWorkspace { path: path.into() });
        }

        Ok(canonical)
    }

    /// Render a resolved path relative to the root ("." for the root itself).
    pub fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".into(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();

    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn relative_path_resolves_under_root() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let resolved = ws.resolve("a.txt").unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert_eq!(ws.relative(&resolved), "a.txt");
    }

    #[test]
    fn dot_is_the_root() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve(".").unwrap();
        assert_eq!(resolved, ws.root());
        assert_eq!(ws.relative(&resolved), ".");
    }

    #[test]
    fn path_traversal_blocked() {
        let (_dir, ws) = workspace();
        match ws.resolve("../../../etc/passwd").unwrap_err() {
            PathValidationError::PathTraversal { .. } => {}
            other => panic!("Expected PathTraversal, got: {other}"),
        }
    }

    #[test]
    fn absolute_path_outside_blocked() {
        let (_dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        let err = ws.resolve(outside.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, PathValidationError::OutsideWorkspace { .. }));
    }

    #[test]
    fn missing_nested_target_allowed() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("new/deeper/file.txt").unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert!(resolved.ends_with("new/deeper/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_blocked() {
        let (dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = ws.resolve("link/secret.txt").unwrap_err();
        assert!(matches!(err, PathValidationError::OutsideWorkspace { .. }));
    }
}
