//! Version-control coordination.
//!
//! The engine only talks to [`VersionControl`]. Production code uses
//! [`PerforceClient`], which shells out to the `p4` command-line client;
//! tests use [`InMemoryVcs`]. When integration is disabled, [`NoVcs`] turns
//! every operation into a neutral no-op.

pub mod memory;
pub mod perforce;
pub mod process;
pub mod workspace;

pub use memory::{FailureInjection, InMemoryVcs, VcsCall};
pub use perforce::PerforceClient;
pub use workspace::{parse_settings, WorkspaceConfigCache, WorkspaceSettings};

use crate::config::VcsConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {message}")]
    Parse { command: String, message: String },

    #[error("failed to read VCS settings {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a file is open in the client workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Edit,
    Add,
    Delete,
    Branch,
    Integrate,
    Other(String),
}

impl FileAction {
    pub fn parse(value: &str) -> Self {
        match value {
            "edit" => FileAction::Edit,
            "add" => FileAction::Add,
            "delete" => FileAction::Delete,
            "branch" => FileAction::Branch,
            "integrate" => FileAction::Integrate,
            other => FileAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAction::Edit => write!(f, "edit"),
            FileAction::Add => write!(f, "add"),
            FileAction::Delete => write!(f, "delete"),
            FileAction::Branch => write!(f, "branch"),
            FileAction::Integrate => write!(f, "integrate"),
            FileAction::Other(other) => write!(f, "{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depot_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FileAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelist: Option<String>,
}

impl FileInfo {
    /// A file the VCS knows nothing about (or that integration is off for).
    pub fn untracked(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            depot_path: None,
            revision: None,
            action: None,
            changelist: None,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.action.is_some()
    }
}

/// Snapshot of the client workspace a target belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub enabled: bool,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Directory whose settings file configured this workspace, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_dir: Option<PathBuf>,
    #[serde(default)]
    pub pending_files: Vec<PathBuf>,
}

impl WorkspaceState {
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Operations the engine needs from a version-control system.
pub trait VersionControl {
    /// Whether operations actually do anything.
    fn is_enabled(&self) -> bool;

    /// Describe the workspace that owns `target`.
    fn validate_workspace(&self, target: &Path) -> Result<WorkspaceState, VcsError>;

    /// Open files for edit.
    fn checkout(&self, files: &[PathBuf]) -> Result<Vec<FileInfo>, VcsError>;

    /// Discard pending edits. Returns the files that were reverted.
    fn revert(&self, files: &[PathBuf]) -> Result<Vec<PathBuf>, VcsError>;

    /// Group opened files into a new changelist. `None` when no changelist was created.
    fn create_changelist(
        &self,
        description: &str,
        files: &[PathBuf],
    ) -> Result<Option<u64>, VcsError>;

    fn file_status(&self, file: &Path) -> Result<FileInfo, VcsError>;
}

/// Shared adapters forward to the inner one.
impl<T: VersionControl + ?Sized> VersionControl for Rc<T> {
    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn validate_workspace(&self, target: &Path) -> Result<WorkspaceState, VcsError> {
        (**self).validate_workspace(target)
    }

    fn checkout(&self, files: &[PathBuf]) -> Result<Vec<FileInfo>, VcsError> {
        (**self).checkout(files)
    }

    fn revert(&self, files: &[PathBuf]) -> Result<Vec<PathBuf>, VcsError> {
        (**self).revert(files)
    }

    fn create_changelist(
        &self,
        description: &str,
        files: &[PathBuf],
    ) -> Result<Option<u64>, VcsError> {
        (**self).create_changelist(description, files)
    }

    fn file_status(&self, file: &Path) -> Result<FileInfo, VcsError> {
        (**self).file_status(file)
    }
}

/// Integration turned off: every call succeeds and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVcs;

impl VersionControl for NoVcs {
    fn is_enabled(&self) -> bool {
        false
    }

    fn validate_workspace(&self, _target: &Path) -> Result<WorkspaceState, VcsError> {
        Ok(WorkspaceState::disabled())
    }

    fn checkout(&self, _files: &[PathBuf]) -> Result<Vec<FileInfo>, VcsError> {
        Ok(Vec::new())
    }

    fn revert(&self, _files: &[PathBuf]) -> Result<Vec<PathBuf>, VcsError> {
        Ok(Vec::new())
    }

    fn create_changelist(
        &self,
        _description: &str,
        _files: &[PathBuf],
    ) -> Result<Option<u64>, VcsError> {
        Ok(None)
    }

    fn file_status(&self, file: &Path) -> Result<FileInfo, VcsError> {
        Ok(FileInfo::untracked(file))
    }
}

/// Build the adapter the configuration asks for.
pub fn from_config(config: &VcsConfig) -> Box<dyn VersionControl> {
    if config.enabled {
        Box::new(PerforceClient::new(config.clone()))
    } else {
        Box::new(NoVcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_vcs_is_neutral() {
        let vcs = NoVcs;
        let files = vec![PathBuf::from("a.c")];
        assert!(!vcs.is_enabled());
        assert!(vcs.checkout(&files).unwrap().is_empty());
        assert!(vcs.revert(&files).unwrap().is_empty());
        assert_eq!(vcs.create_changelist("x", &files).unwrap(), None);
        assert!(!vcs.file_status(Path::new("a.c")).unwrap().is_opened());
        assert!(!vcs.validate_workspace(Path::new("a.c")).unwrap().enabled);
    }

    #[test]
    fn test_from_config_respects_enabled_flag() {
        let mut config = VcsConfig::default();
        assert!(!from_config(&config).is_enabled());
        config.enabled = true;
        assert!(from_config(&config).is_enabled());
    }

    #[test]
    fn test_file_action_parse() {
        assert_eq!(FileAction::parse("edit"), FileAction::Edit);
        assert_eq!(
            FileAction::parse("move/add"),
            FileAction::Other("move/add".to_string())
        );
        assert_eq!(FileAction::parse("move/add").to_string(), "move/add");
    }
}
