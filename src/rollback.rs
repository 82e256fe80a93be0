//! Undo a patch: put backed-up bytes back and revert VCS checkouts.
//!
//! Both steps are best-effort. A failure in one file (or in the revert) is
//! recorded and the remaining work still runs; the caller gets a
//! [`RollbackError`] carrying the full report when anything was left undone.

use crate::backup::{BackupManifest, BackupStore};
use crate::engine::ApplicationResult;
use crate::vcs::VersionControl;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    Restore,
    Revert,
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStep::Restore => write!(f, "restore"),
            RollbackStep::Revert => write!(f, "revert"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub step: RollbackStep,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.step, self.path.display(), self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub restored: Vec<PathBuf>,
    #[serde(default)]
    pub checksum_mismatches: Vec<PathBuf>,
    pub reverted: Vec<PathBuf>,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: RollbackReport) {
        self.restored.extend(other.restored);
        self.checksum_mismatches.extend(other.checksum_mismatches);
        self.reverted.extend(other.reverted);
        self.failures.extend(other.failures);
    }
}

/// Rollback left the tree in an unknown state; an operator has to look.
#[derive(Error, Debug)]
#[error("rollback incomplete, {} step(s) failed; manual intervention required", .report.failures.len())]
pub struct RollbackError {
    pub report: RollbackReport,
}

pub struct RollbackCoordinator<'a> {
    backups: &'a BackupStore,
    vcs: &'a dyn VersionControl,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(backups: &'a BackupStore, vcs: &'a dyn VersionControl) -> Self {
        Self { backups, vcs }
    }

    /// Restore from `manifest` and revert `vcs_files`.
    ///
    /// `modified` lists files known to have been written. Any of them that
    /// the manifest does not cover cannot be restored and counts as a failure.
    pub fn rollback(
        &self,
        manifest: Option<&BackupManifest>,
        modified: &[PathBuf],
        vcs_files: &[PathBuf],
    ) -> Result<RollbackReport, RollbackError> {
        let mut report = RollbackReport::default();

        if let Some(manifest) = manifest {
            let restore = self.backups.restore(manifest);
            report.restored = restore.restored;
            report.checksum_mismatches = restore.checksum_mismatches;
            report
                .failures
                .extend(restore.failed.into_iter().map(|(path, message)| RollbackFailure {
                    step: RollbackStep::Restore,
                    path,
                    message,
                }));
        }

        let covered = |path: &Path| {
            manifest.is_some_and(|m| m.original_paths().any(|original| original == path))
        };
        for path in modified.iter().filter(|p| !covered(p)) {
            warn!(file = %path.display(), "modified file has no backup");
            report.failures.push(RollbackFailure {
                step: RollbackStep::Restore,
                path: path.clone(),
                message: "no backup available".to_string(),
            });
        }

        self.revert(vcs_files, &mut report);

        if report.is_complete() {
            info!(
                restored = report.restored.len(),
                reverted = report.reverted.len(),
                "rollback complete"
            );
            Ok(report)
        } else {
            for failure in &report.failures {
                error!(%failure, "rollback step failed");
            }
            Err(RollbackError { report })
        }
    }

    /// Replay the rollback of a finished run from its recorded changes.
    pub fn rollback_result(
        &self,
        result: &ApplicationResult,
    ) -> Result<RollbackReport, RollbackError> {
        let mut report = RollbackReport::default();
        for change in &result.changes {
            let written: Vec<PathBuf> = change
                .modifications
                .iter()
                .filter(|m| m.written)
                .map(|m| m.file.clone())
                .collect();
            match self.rollback(
                change.backup_manifest.as_ref(),
                &written,
                &change.checked_out_files,
            ) {
                Ok(part) => report.merge(part),
                Err(err) => report.merge(err.report),
            }
        }

        if report.is_complete() {
            Ok(report)
        } else {
            Err(RollbackError { report })
        }
    }

    fn revert(&self, files: &[PathBuf], report: &mut RollbackReport) {
        if files.is_empty() || !self.vcs.is_enabled() {
            return;
        }

        match self.vcs.revert(files) {
            Ok(reverted) => report.reverted.extend(reverted),
            Err(err) => {
                warn!(error = %err, "batch revert failed, retrying per file");
                for file in files {
                    match self.vcs.revert(std::slice::from_ref(file)) {
                        Ok(reverted) => report.reverted.extend(reverted),
                        Err(err) => report.failures.push(RollbackFailure {
                            step: RollbackStep::Revert,
                            path: file.clone(),
                            message: err.to_string(),
                        }),
                    }
                }
            }
        }
    }
}
