//! Patch application engine.
//!
//! One [`PatchEngine::apply`] call drives a single defect's recommended fix
//! through `VALIDATE → BACKUP → CHECKOUT → APPLY → FINALIZE → DONE`.
//! Any failure after the backup exists can move the run to `ROLLED_BACK`.
//! Backups for every target complete before the first write, and checkout of
//! every target completes before the first line is patched.

mod result;

pub use result::{AppliedChange, ApplicationResult, ChangeStatus, Phase, VcsOperation};

use crate::backup::{BackupManifest, BackupStore};
use crate::config::EngineConfig;
use crate::edit::LineEdit;
use crate::model::{AnalysisResult, FixCandidate};
use crate::rollback::{RollbackCoordinator, RollbackError, RollbackReport};
use crate::safety::WorkspaceGuard;
use crate::validate::{ValidationIssue, ValidationResult, Validator};
use crate::vcs::{self, VersionControl};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// File name of the audit record written next to a backup manifest.
pub const AUDIT_RECORD_FILE_NAME: &str = "result.json";

#[derive(Error, Debug)]
pub enum EngineError {
    /// The tree may be inconsistent. `result` holds everything the run did.
    #[error("patch {}: {source}", .result.patch_id)]
    RollbackFailed {
        #[source]
        source: RollbackError,
        result: Box<ApplicationResult>,
    },
}

impl EngineError {
    pub fn result(&self) -> &ApplicationResult {
        match self {
            EngineError::RollbackFailed { result, .. } => result,
        }
    }
}

pub struct PatchEngine {
    config: EngineConfig,
    vcs: Box<dyn VersionControl>,
}

/// Identifier for one (defect, candidate) pair.
pub fn patch_id(analysis: &AnalysisResult) -> String {
    format!("{}-c{}", analysis.defect_id, analysis.recommended_fix_index)
}

fn changelist_description(
    prefix: &str,
    analysis: &AnalysisResult,
    candidate: &FixCandidate,
) -> String {
    let mut description = format!("{prefix}: {}", analysis.defect_id);
    if let Some(category) = &analysis.category {
        description.push_str(&format!(" ({category})"));
    }
    description.push('\n');
    let text = candidate.description.trim();
    if !text.is_empty() {
        description.push('\n');
        description.push_str(text);
        description.push('\n');
    }
    description.push_str(&format!(
        "\nConfidence: {:.2}\n",
        candidate.confidence_score
    ));
    description
}

impl PatchEngine {
    /// Engine with the VCS adapter the configuration asks for.
    pub fn new(config: EngineConfig) -> Self {
        let vcs = vcs::from_config(&config.vcs);
        Self { config, vcs }
    }

    pub fn with_vcs(config: EngineConfig, vcs: Box<dyn VersionControl>) -> Self {
        Self { config, vcs }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vcs(&self) -> &dyn VersionControl {
        self.vcs.as_ref()
    }

    pub fn backup_store(&self, working_dir: &Path) -> BackupStore {
        BackupStore::new(&self.config.backup, working_dir)
    }

    /// Run the validator with the workspace guard for `working_dir`.
    pub fn validate(&self, analysis: &AnalysisResult, working_dir: &Path) -> ValidationResult {
        let validator = Validator::new(&self.config.validation);
        let backup_root = self.backup_store(working_dir).root().to_path_buf();

        match WorkspaceGuard::new(working_dir, &self.config.safety, &backup_root) {
            Ok(guard) => validator.with_guard(&guard).validate(analysis, working_dir),
            Err(err) => {
                let mut report = validator.validate(analysis, working_dir);
                report.push(ValidationIssue::error(format!(
                    "working directory {} is unusable: {err}",
                    working_dir.display()
                )));
                report
            }
        }
    }

    /// Apply the recommended candidate of `analysis` under `working_dir`.
    ///
    /// Every outcome short of a failed rollback comes back as `Ok` with the
    /// status recorded in the result.
    pub fn apply(
        &self,
        analysis: &AnalysisResult,
        working_dir: &Path,
    ) -> Result<ApplicationResult, EngineError> {
        let patch_id = patch_id(analysis);
        let span = info_span!("patch", patch_id = %patch_id, defect_id = %analysis.defect_id);
        let _enter = span.enter();

        let run = Run {
            engine: self,
            analysis,
            working_dir,
            store: self.backup_store(working_dir),
            started: Instant::now(),
            result: ApplicationResult::new(
                &patch_id,
                &analysis.defect_id,
                self.config.safety.dry_run,
            ),
            change: AppliedChange::new(&analysis.defect_id, analysis.recommended_fix_index),
        };
        run.execute()
    }

    /// Undo a finished run from its recorded manifests and checkouts.
    pub fn rollback(
        &self,
        result: &ApplicationResult,
        working_dir: &Path,
    ) -> Result<RollbackReport, RollbackError> {
        let store = self.backup_store(working_dir);
        info!(patch_id = %result.patch_id, "manual rollback");
        RollbackCoordinator::new(&store, self.vcs()).rollback_result(result)
    }
}

/// State of one `apply` call.
struct Run<'a> {
    engine: &'a PatchEngine,
    analysis: &'a AnalysisResult,
    working_dir: &'a Path,
    store: BackupStore,
    started: Instant,
    result: ApplicationResult,
    change: AppliedChange,
}

/// What the apply phase did.
enum ApplyOutcome {
    Completed,
    Aborted,
}

impl<'a> Run<'a> {
    fn config(&self) -> &'a EngineConfig {
        &self.engine.config
    }

    fn vcs(&self) -> &'a dyn VersionControl {
        self.engine.vcs.as_ref()
    }

    fn enter(&mut self, phase: Phase) {
        debug!(%phase, "entering phase");
        self.result.final_phase = phase;
    }

    fn execute(mut self) -> Result<ApplicationResult, EngineError> {
        let analysis = self.analysis;

        // VALIDATE
        self.enter(Phase::Validate);
        let validation = self.engine.validate(analysis, self.working_dir);
        self.result
            .warnings
            .extend(validation.warnings().map(|issue| issue.to_string()));
        let files = validation.files_to_modify.clone();
        let is_valid = validation.is_valid;
        if !is_valid {
            self.result
                .errors
                .extend(validation.errors().map(|issue| issue.to_string()));
        }
        self.result.validation = validation;

        let candidate = match analysis.recommended() {
            Some(candidate) if is_valid && !files.is_empty() => candidate,
            _ => {
                if is_valid {
                    self.result.errors.push("no target files to patch".to_string());
                }
                info!(errors = self.result.errors.len(), "validation failed");
                return Ok(self.finish(Phase::Failed, false));
            }
        };
        info!(files = files.len(), "validation passed");

        if self.vcs().is_enabled() {
            match self.vcs().validate_workspace(&files[0]) {
                Ok(state) => self.result.workspace = Some(state),
                Err(err) => {
                    warn!(error = %err, "workspace query failed");
                    self.result
                        .warnings
                        .push(format!("VCS workspace query failed: {err}"));
                }
            }
        }

        // BACKUP
        self.enter(Phase::Backup);
        if self.config().backup.enabled {
            match self.store.backup(&files, &self.result.patch_id, self.working_dir) {
                Ok(manifest) => self.change.backup_manifest = Some(manifest),
                Err(err) => {
                    self.result.errors.push(format!("backup failed: {err}"));
                    return Ok(self.finish(Phase::Failed, true));
                }
            }
        } else {
            self.result
                .warnings
                .push("backups are disabled; a failed apply cannot be restored".to_string());
        }

        if self.result.dry_run {
            return Ok(self.simulate(&files, candidate));
        }

        // CHECKOUT
        if self.vcs().is_enabled() && self.config().vcs.auto_checkout {
            self.enter(Phase::Checkout);
            if let Err(err) = self.checkout(&files) {
                return self.abort_checkout(&files, err);
            }
        }

        // APPLY
        self.enter(Phase::Apply);
        match self.apply_files(&files, candidate) {
            ApplyOutcome::Completed => {}
            ApplyOutcome::Aborted => return self.abort_apply(),
        }

        // FINALIZE
        self.enter(Phase::Finalize);
        self.change.status = ChangeStatus::Success;
        self.finalize(candidate);
        info!(
            files = self.change.modifications.len(),
            added = self.change.lines_added(),
            removed = self.change.lines_removed(),
            "patch applied"
        );
        Ok(self.finish(Phase::Done, true))
    }

    fn simulate(mut self, files: &[PathBuf], candidate: &FixCandidate) -> ApplicationResult {
        self.enter(Phase::Apply);
        for file in files {
            let edit = LineEdit::new(file, &candidate.fix_text, candidate.line_ranges.clone());
            match edit.simulate() {
                Ok(modification) => self.change.modifications.push(modification),
                Err(err) => {
                    self.result.errors.push(format!("dry run failed: {err}"));
                    return self.finish(Phase::Failed, true);
                }
            }
        }
        self.change.status = ChangeStatus::Success;
        info!(
            added = self.change.lines_added(),
            removed = self.change.lines_removed(),
            "dry run complete, nothing written"
        );
        self.finish(Phase::Done, true)
    }

    fn checkout(&mut self, files: &[PathBuf]) -> Result<(), vcs::VcsError> {
        match self.vcs().checkout(files) {
            Ok(opened) => {
                debug!(opened = opened.len(), "checked out");
                self.change.checked_out_files = files.to_vec();
                self.change
                    .vcs_operations
                    .push(VcsOperation::succeeded("checkout", files, None));
                Ok(())
            }
            Err(err) => {
                self.change
                    .vcs_operations
                    .push(VcsOperation::failed("checkout", files, &err));
                if self.config().vcs.require_checkout {
                    return Err(err);
                }
                warn!(error = %err, "checkout failed, continuing without VCS");
                self.result
                    .warnings
                    .push(format!("checkout failed, files not opened for edit: {err}"));
                self.release_partial_checkout(files);
                Ok(())
            }
        }
    }

    /// Revert whatever a failed optional checkout managed to open. If that
    /// fails too, the files stay recorded so rollback reverts them.
    fn release_partial_checkout(&mut self, files: &[PathBuf]) {
        match self.vcs().revert(files) {
            Ok(reverted) => {
                if !reverted.is_empty() {
                    debug!(reverted = reverted.len(), "released partial checkout");
                    self.change
                        .vcs_operations
                        .push(VcsOperation::succeeded("revert", &reverted, None));
                }
            }
            Err(err) => {
                warn!(error = %err, "could not revert partial checkout");
                self.change
                    .vcs_operations
                    .push(VcsOperation::failed("revert", files, &err));
                self.result
                    .warnings
                    .push(format!("revert after failed checkout failed: {err}"));
                self.change.checked_out_files = files.to_vec();
            }
        }
    }

    /// A required checkout failed. Nothing is written yet, so only a partial
    /// checkout has to be undone.
    fn abort_checkout(
        mut self,
        files: &[PathBuf],
        err: vcs::VcsError,
    ) -> Result<ApplicationResult, EngineError> {
        self.result.errors.push(format!("checkout failed: {err}"));
        let coordinator = RollbackCoordinator::new(&self.store, self.vcs());
        match coordinator.rollback(None, &[], files) {
            Ok(report) => {
                self.change
                    .vcs_operations
                    .push(VcsOperation::succeeded("revert", &report.reverted, None));
                self.result.rollback = Some(report);
                self.change.status = ChangeStatus::RolledBack;
                Ok(self.finish(Phase::RolledBack, true))
            }
            Err(rollback) => Err(self.rollback_failed(rollback)),
        }
    }

    fn apply_files(&mut self, files: &[PathBuf], candidate: &FixCandidate) -> ApplyOutcome {
        for file in files {
            let edit = LineEdit::new(file, &candidate.fix_text, candidate.line_ranges.clone());
            match edit.apply() {
                Ok(modification) => {
                    debug!(
                        file = %file.display(),
                        added = modification.lines_added,
                        removed = modification.lines_removed,
                        written = modification.written,
                        "file patched"
                    );
                    if !modification.ranges_skipped.is_empty() {
                        self.result.warnings.push(format!(
                            "{}: {} range(s) skipped",
                            file.display(),
                            modification.ranges_skipped.len()
                        ));
                    }
                    if !modification.written {
                        self.result
                            .warnings
                            .push(format!("{}: content unchanged", file.display()));
                    }
                    self.change.modifications.push(modification);
                }
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "apply failed, aborting remaining files");
                    self.result.errors.push(format!("apply failed: {err}"));
                    return ApplyOutcome::Aborted;
                }
            }
        }
        ApplyOutcome::Completed
    }

    fn abort_apply(mut self) -> Result<ApplicationResult, EngineError> {
        if !self.config().safety.automatic_rollback_on_failure {
            let written = self.change.written_files();
            if !written.is_empty() {
                self.result.warnings.push(format!(
                    "automatic rollback is disabled; {} file(s) left modified",
                    written.len()
                ));
            }
            self.change.status = ChangeStatus::Failed;
            return Ok(self.finish(Phase::Failed, true));
        }

        let written = self.change.written_files();
        let coordinator = RollbackCoordinator::new(&self.store, self.vcs());
        match coordinator.rollback(
            self.change.backup_manifest.as_ref(),
            &written,
            &self.change.checked_out_files,
        ) {
            Ok(report) => {
                if !report.reverted.is_empty() {
                    self.change
                        .vcs_operations
                        .push(VcsOperation::succeeded("revert", &report.reverted, None));
                }
                self.result.rollback = Some(report);
                self.change.status = ChangeStatus::RolledBack;
                Ok(self.finish(Phase::RolledBack, true))
            }
            Err(rollback) => Err(self.rollback_failed(rollback)),
        }
    }

    /// Changelist and cleanup. Failures here are warnings only.
    fn finalize(&mut self, candidate: &FixCandidate) {
        let checked_out = self.change.checked_out_files.clone();
        let anything_written = self.change.modifications.iter().any(|m| m.written);

        if self.config().vcs.create_changelist && !checked_out.is_empty() && anything_written {
            let description = changelist_description(
                &self.config().vcs.changelist_prefix,
                self.analysis,
                candidate,
            );
            match self.vcs().create_changelist(&description, &checked_out) {
                Ok(id) => {
                    self.change.changelist = id;
                    self.change.vcs_operations.push(VcsOperation::succeeded(
                        "changelist",
                        &checked_out,
                        id.map(|id| format!("change {id}")),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "changelist creation failed");
                    self.change
                        .vcs_operations
                        .push(VcsOperation::failed("changelist", &checked_out, &err));
                    self.result
                        .warnings
                        .push(format!("changelist creation failed: {err}"));
                }
            }
        }

        if self.config().backup.cleanup_on_success {
            if let Some(manifest) = &self.change.backup_manifest {
                if let Err(err) = self.store.cleanup(manifest) {
                    warn!(error = %err, "backup cleanup failed");
                    self.result.warnings.push(format!("backup cleanup failed: {err}"));
                }
            }
        }
    }

    fn rollback_failed(mut self, rollback: RollbackError) -> EngineError {
        self.result.errors.push(rollback.to_string());
        self.result.rollback = Some(rollback.report.clone());
        self.change.status = ChangeStatus::Failed;
        let result = self.finish(Phase::Failed, true);
        EngineError::RollbackFailed {
            source: rollback,
            result: Box::new(result),
        }
    }

    /// Close the run in `phase`, recording the change if one was started.
    fn finish(self, phase: Phase, record_change: bool) -> ApplicationResult {
        let Run {
            engine,
            started,
            mut result,
            change,
            ..
        } = self;

        result.final_phase = phase;
        if record_change {
            result.changes.push(change);
        }
        result.refresh_status();
        result.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(manifest) = result.backup_manifest().cloned() {
            write_audit_record(&engine.config, &manifest, &mut result);
        }

        info!(
            status = %result.status,
            phase = %result.final_phase,
            duration_ms = result.duration_ms,
            "patch finished"
        );
        result
    }
}

fn write_audit_record(
    config: &EngineConfig,
    manifest: &BackupManifest,
    result: &mut ApplicationResult,
) {
    if !config.backup.write_audit_record || !manifest.backup_dir.is_dir() {
        return;
    }
    let path = manifest.backup_dir.join(AUDIT_RECORD_FILE_NAME);
    match result.save(&path) {
        Ok(()) => debug!(path = %path.display(), "audit record written"),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to write audit record");
            result
                .warnings
                .push(format!("failed to write audit record {}: {err}", path.display()));
        }
    }
}
