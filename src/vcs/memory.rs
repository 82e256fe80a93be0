//! In-process VCS double that records every call.

use super::{FileAction, FileInfo, VcsError, VersionControl, WorkspaceState};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    ValidateWorkspace(PathBuf),
    Checkout(Vec<PathBuf>),
    Revert(Vec<PathBuf>),
    CreateChangelist(String, Vec<PathBuf>),
    FileStatus(PathBuf),
}

#[derive(Debug, Default)]
struct State {
    opened: BTreeSet<PathBuf>,
    changelists: BTreeMap<u64, Vec<PathBuf>>,
    calls: Vec<VcsCall>,
}

/// Failure switches.
#[derive(Debug, Clone, Default)]
pub struct FailureInjection {
    pub workspace: bool,
    pub checkout: bool,
    /// Files opened before an injected checkout failure.
    pub checkout_opens: usize,
    pub revert: bool,
    pub changelist: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryVcs {
    client_name: String,
    failures: FailureInjection,
    state: RefCell<State>,
}

impl InMemoryVcs {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    pub fn with_failures(mut self, failures: FailureInjection) -> Self {
        self.failures = failures;
        self
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.state.borrow().calls.clone()
    }

    pub fn opened_files(&self) -> Vec<PathBuf> {
        self.state.borrow().opened.iter().cloned().collect()
    }

    pub fn changelists(&self) -> BTreeMap<u64, Vec<PathBuf>> {
        self.state.borrow().changelists.clone()
    }

    fn record(&self, call: VcsCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

fn injected(operation: &str) -> VcsError {
    VcsError::CommandFailed {
        command: format!("memory {operation}"),
        code: Some(1),
        stderr: format!("injected {operation} failure"),
    }
}

impl VersionControl for InMemoryVcs {
    fn is_enabled(&self) -> bool {
        true
    }

    fn validate_workspace(&self, target: &Path) -> Result<WorkspaceState, VcsError> {
        self.record(VcsCall::ValidateWorkspace(target.to_path_buf()));
        if self.failures.workspace {
            return Err(injected("info"));
        }
        Ok(WorkspaceState {
            enabled: true,
            connected: true,
            client_name: Some(self.client_name.clone()),
            pending_files: self.opened_files(),
            ..WorkspaceState::default()
        })
    }

    fn checkout(&self, files: &[PathBuf]) -> Result<Vec<FileInfo>, VcsError> {
        self.record(VcsCall::Checkout(files.to_vec()));
        let mut state = self.state.borrow_mut();
        if self.failures.checkout {
            let partial = files.iter().take(self.failures.checkout_opens).cloned();
            state.opened.extend(partial);
            return Err(injected("edit"));
        }
        Ok(files
            .iter()
            .map(|file| {
                state.opened.insert(file.clone());
                FileInfo {
                    action: Some(FileAction::Edit),
                    changelist: Some("default".to_string()),
                    ..FileInfo::untracked(file)
                }
            })
            .collect())
    }

    fn revert(&self, files: &[PathBuf]) -> Result<Vec<PathBuf>, VcsError> {
        self.record(VcsCall::Revert(files.to_vec()));
        if self.failures.revert {
            return Err(injected("revert"));
        }
        let mut state = self.state.borrow_mut();
        Ok(files
            .iter()
            .filter(|file| state.opened.remove(*file))
            .cloned()
            .collect())
    }

    fn create_changelist(
        &self,
        description: &str,
        files: &[PathBuf],
    ) -> Result<Option<u64>, VcsError> {
        self.record(VcsCall::CreateChangelist(
            description.to_string(),
            files.to_vec(),
        ));
        if self.failures.changelist {
            return Err(injected("change"));
        }
        if files.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.borrow_mut();
        let id = 1000 + state.changelists.len() as u64;
        state.changelists.insert(id, files.to_vec());
        Ok(Some(id))
    }

    fn file_status(&self, file: &Path) -> Result<FileInfo, VcsError> {
        self.record(VcsCall::FileStatus(file.to_path_buf()));
        let opened = self.state.borrow().opened.contains(file);
        Ok(FileInfo {
            action: opened.then_some(FileAction::Edit),
            ..FileInfo::untracked(file)
        })
    }
}
