use crate::config::SafetyConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Path checks that keep patches away from places they must never write:
/// the backup store itself, VCS metadata, and (optionally) anything outside
/// the working directory.
#[derive(Debug, Clone)]
pub struct WorkspaceGuard {
    /// Canonical working directory
    workspace_root: PathBuf,
    /// Canonical paths to forbidden directories
    forbidden_paths: Vec<PathBuf>,
    restrict_to_workspace: bool,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Path is outside workspace: {path} (workspace: {workspace})")]
    OutsideWorkspace { path: PathBuf, workspace: PathBuf },

    #[error("Path is in forbidden directory: {path} (forbidden: {forbidden})")]
    ForbiddenPath { path: PathBuf, forbidden: PathBuf },

    #[error("Failed to canonicalize path: {0}")]
    Canonicalize(#[from] std::io::Error),
}

impl WorkspaceGuard {
    /// Create a guard for `workspace_root`.
    ///
    /// `backup_root` is always forbidden; directories that do not exist yet
    /// cannot contain targets and are ignored.
    pub fn new(
        workspace_root: impl AsRef<Path>,
        safety: &SafetyConfig,
        backup_root: &Path,
    ) -> Result<Self, SafetyError> {
        let workspace_root = workspace_root.as_ref().canonicalize()?;

        let mut forbidden_paths = Vec::new();
        for name in &safety.forbidden_dirs {
            if let Ok(dir) = workspace_root.join(name).canonicalize() {
                forbidden_paths.push(dir);
            }
        }

        let backup_root = if backup_root.is_absolute() {
            backup_root.to_path_buf()
        } else {
            workspace_root.join(backup_root)
        };
        if let Ok(dir) = backup_root.canonicalize() {
            forbidden_paths.push(dir);
        }

        Ok(Self {
            workspace_root,
            forbidden_paths,
            restrict_to_workspace: safety.restrict_to_workspace,
        })
    }

    /// Check if a path is safe to patch.
    ///
    /// Returns the canonicalized absolute path if safe.
    pub fn validate_path(&self, path: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
        let path = path.as_ref();

        // Resolve relative paths against workspace root
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        };

        // Canonicalize to resolve symlinks and .. components
        let canonical = absolute.canonicalize()?;

        self.check_canonical(&canonical)?;

        Ok(canonical)
    }

    fn check_canonical(&self, canonical: &Path) -> Result<(), SafetyError> {
        if self.restrict_to_workspace && !canonical.starts_with(&self.workspace_root) {
            return Err(SafetyError::OutsideWorkspace {
                path: canonical.to_path_buf(),
                workspace: self.workspace_root.clone(),
            });
        }

        for forbidden in &self.forbidden_paths {
            if canonical.starts_with(forbidden) {
                return Err(SafetyError::ForbiddenPath {
                    path: canonical.to_path_buf(),
                    forbidden: forbidden.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get the workspace root.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn guard(workspace: &Path, restrict: bool) -> WorkspaceGuard {
        let safety = SafetyConfig {
            restrict_to_workspace: restrict,
            ..SafetyConfig::default()
        };
        WorkspaceGuard::new(workspace, &safety, Path::new(".defect-patcher/backups")).unwrap()
    }

    #[test]
    fn test_validate_path_inside_workspace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = temp_dir.path();
        let file = workspace.join("src/main.c");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"").unwrap();

        assert!(guard(workspace, true).validate_path(&file).is_ok());
    }

    #[test]
    fn test_outside_workspace_only_rejected_when_restricted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = temp_dir.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();
        let outside = temp_dir.path().join("outside.c");
        fs::write(&outside, b"").unwrap();

        assert!(guard(&workspace, false).validate_path(&outside).is_ok());
        assert!(matches!(
            guard(&workspace, true).validate_path(&outside),
            Err(SafetyError::OutsideWorkspace { .. })
        ));
    }

    #[test]
    fn test_vcs_metadata_is_forbidden() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = temp_dir.path();
        let file = workspace.join(".git/config");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            guard(workspace, false).validate_path(&file),
            Err(SafetyError::ForbiddenPath { .. })
        ));
    }

    #[test]
    fn test_backup_root_is_forbidden() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = temp_dir.path();
        let file = workspace.join(".defect-patcher/backups/p1/files/a.c");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            guard(workspace, false).validate_path("./.defect-patcher/backups/p1/files/a.c"),
            Err(SafetyError::ForbiddenPath { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_symlink_escape() {
        use std::os::unix::fs::symlink;

        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = temp_dir.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();

        let outside = temp_dir.path().join("outside.c");
        fs::write(&outside, b"").unwrap();

        let link = workspace.join("escape.c");
        symlink(&outside, &link).unwrap();

        // Should reject because canonical path is outside workspace
        assert!(matches!(
            guard(&workspace, true).validate_path(&link),
            Err(SafetyError::OutsideWorkspace { .. })
        ));
    }
}
