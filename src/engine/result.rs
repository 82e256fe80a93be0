use crate::backup::BackupManifest;
use crate::edit::FileModification;
use crate::rollback::RollbackReport;
use crate::validate::ValidationResult;
use crate::vcs::WorkspaceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Engine state machine positions. `Done`, `Failed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validate,
    Backup,
    Checkout,
    Apply,
    Finalize,
    Done,
    Failed,
    RolledBack,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::RolledBack)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Validate => "VALIDATE",
            Phase::Backup => "BACKUP",
            Phase::Checkout => "CHECKOUT",
            Phase::Apply => "APPLY",
            Phase::Finalize => "FINALIZE",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
            Phase::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Success,
    Partial,
    Failed,
    RolledBack,
}

impl ChangeStatus {
    /// Overall status of a set of changes.
    ///
    /// Success when every change succeeded, failed (or rolled back) when none
    /// did, partial otherwise. An empty set is a failure.
    pub fn derive<'a>(statuses: impl IntoIterator<Item = &'a ChangeStatus>) -> Self {
        let statuses: Vec<ChangeStatus> = statuses.into_iter().copied().collect();
        if statuses.is_empty() {
            return ChangeStatus::Failed;
        }
        if statuses.iter().all(|s| *s == ChangeStatus::Success) {
            return ChangeStatus::Success;
        }
        let any_succeeded = statuses
            .iter()
            .any(|s| matches!(s, ChangeStatus::Success | ChangeStatus::Partial));
        if any_succeeded {
            ChangeStatus::Partial
        } else if statuses.iter().all(|s| *s == ChangeStatus::RolledBack) {
            ChangeStatus::RolledBack
        } else {
            ChangeStatus::Failed
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeStatus::Success => "SUCCESS",
            ChangeStatus::Partial => "PARTIAL",
            ChangeStatus::Failed => "FAILED",
            ChangeStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// One entry in the VCS operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsOperation {
    pub operation: String,
    pub files: Vec<PathBuf>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VcsOperation {
    pub fn succeeded(operation: &str, files: &[PathBuf], detail: Option<String>) -> Self {
        Self {
            operation: operation.to_string(),
            files: files.to_vec(),
            success: true,
            detail,
        }
    }

    pub fn failed(operation: &str, files: &[PathBuf], error: impl fmt::Display) -> Self {
        Self {
            operation: operation.to_string(),
            files: files.to_vec(),
            success: false,
            detail: Some(error.to_string()),
        }
    }
}

/// What applying one candidate did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub defect_id: String,
    pub candidate_index: usize,
    pub modifications: Vec<FileModification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_manifest: Option<BackupManifest>,
    #[serde(default)]
    pub vcs_operations: Vec<VcsOperation>,
    /// Files opened for edit; reverted on rollback.
    #[serde(default)]
    pub checked_out_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelist: Option<u64>,
    pub status: ChangeStatus,
}

impl AppliedChange {
    pub fn new(defect_id: impl Into<String>, candidate_index: usize) -> Self {
        Self {
            defect_id: defect_id.into(),
            candidate_index,
            modifications: Vec::new(),
            backup_manifest: None,
            vcs_operations: Vec::new(),
            checked_out_files: Vec::new(),
            changelist: None,
            status: ChangeStatus::Failed,
        }
    }

    pub fn written_files(&self) -> Vec<PathBuf> {
        self.modifications
            .iter()
            .filter(|m| m.written)
            .map(|m| m.file.clone())
            .collect()
    }

    pub fn lines_added(&self) -> usize {
        self.modifications.iter().map(|m| m.lines_added).sum()
    }

    pub fn lines_removed(&self) -> usize {
        self.modifications.iter().map(|m| m.lines_removed).sum()
    }
}

/// Everything one engine run produced. Serialises to the audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationResult {
    pub patch_id: String,
    pub defect_id: String,
    pub status: ChangeStatus,
    /// Terminal phase the run stopped in.
    pub final_phase: Phase,
    pub changes: Vec<AppliedChange>,
    pub validation: ValidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceState>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl ApplicationResult {
    pub fn new(patch_id: impl Into<String>, defect_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            patch_id: patch_id.into(),
            defect_id: defect_id.into(),
            status: ChangeStatus::Failed,
            final_phase: Phase::Validate,
            changes: Vec::new(),
            validation: ValidationResult::default(),
            workspace: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            dry_run,
            started_at: Utc::now(),
            duration_ms: 0,
            rollback: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ChangeStatus::Success
    }

    /// Recompute `status` from the recorded changes.
    pub fn refresh_status(&mut self) {
        self.status = ChangeStatus::derive(self.changes.iter().map(|c| &c.status));
    }

    /// Manifest of the first change that has one.
    pub fn backup_manifest(&self) -> Option<&BackupManifest> {
        self.changes.iter().find_map(|c| c.backup_manifest.as_ref())
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::edit::atomic_write(path, &json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
