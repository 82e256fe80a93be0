//! Pre-mutation validation of a proposed fix.
//!
//! The validator is side-effect free: it only stats and reads files. It
//! answers two questions before anything is backed up or written:
//!
//! 1. Can every target file be found, read and (ideally) written?
//! 2. Is the recommended candidate confident enough to apply?
//!
//! Writability problems are warnings only, so dry runs still work on
//! read-only trees.

use crate::config::{ValidatorConfig, MIN_CONFIDENCE};
use crate::model::{AnalysisResult, LineRange};
use crate::patcher::check_range;
use crate::safety::WorkspaceGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ValidationIssue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn at(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " ({}:{})", file.display(), line),
            (Some(file), None) => write!(f, " ({})", file.display()),
            _ => Ok(()),
        }
    }
}

/// Outcome of validating one analysis result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    /// Resolved paths, in candidate order, without duplicates.
    pub files_to_modify: Vec<PathBuf>,
    /// Paths as written in the input that could not be found.
    pub files_missing: Vec<PathBuf>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            files_to_modify: Vec::new(),
            files_missing: Vec::new(),
        }
    }
}

impl ValidationResult {
    /// Record an issue. Any error makes the result invalid.
    pub fn push(&mut self, issue: ValidationIssue) {
        if issue.severity == Severity::Error {
            self.is_valid = false;
        }
        self.issues.push(issue);
    }

    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.severity == severity)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.with_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.with_severity(Severity::Warning)
    }

    fn add_target(&mut self, path: PathBuf) {
        if !self.files_to_modify.contains(&path) {
            self.files_to_modify.push(path);
        }
    }
}

/// Resolve a target path the way the fix generator meant it.
///
/// Absolute paths are taken as-is. Relative paths are tried against
/// `working_dir`; a bare filename that is not found there is retried next to
/// the defect's primary file.
pub fn resolve_target(path: &Path, working_dir: &Path, defect_file: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }

    let direct = working_dir.join(path);
    if direct.exists() {
        return Some(direct);
    }

    let is_bare_name = path.components().count() == 1;
    if is_bare_name {
        let defect_file = if defect_file.is_absolute() {
            defect_file.to_path_buf()
        } else {
            working_dir.join(defect_file)
        };
        if let Some(dir) = defect_file.parent() {
            let sibling = dir.join(path);
            if sibling.exists() {
                return Some(sibling);
            }
        }
    }

    None
}

pub struct Validator<'a> {
    config: &'a ValidatorConfig,
    guard: Option<&'a WorkspaceGuard>,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a ValidatorConfig) -> Self {
        Self {
            config,
            guard: None,
        }
    }

    /// Also refuse targets the guard rejects.
    pub fn with_guard(mut self, guard: &'a WorkspaceGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn validate(&self, result: &AnalysisResult, working_dir: &Path) -> ValidationResult {
        let mut report = ValidationResult::default();

        if result.fix_candidates.is_empty() {
            report.push(
                ValidationIssue::error(format!("defect {} has no fix candidates", result.defect_id))
                    .at(&result.file_path)
                    .at_line(result.line_number),
            );
            return report;
        }

        let Some(candidate) = result.recommended() else {
            report.push(ValidationIssue::error(format!(
                "recommended fix index {} is out of bounds ({} candidates)",
                result.recommended_fix_index,
                result.fix_candidates.len()
            )));
            return report;
        };

        self.check_confidence(candidate.confidence_score, &mut report);

        if candidate.line_ranges.is_empty() {
            report.push(ValidationIssue::warning(
                "fix candidate has no line ranges; nothing will be patched",
            ));
        }

        if candidate.affected_files.is_empty() {
            report.push(
                ValidationIssue::info("no affected files listed; targeting the defect's file")
                    .at(&result.file_path),
            );
        }

        for target in result.target_files() {
            let Some(resolved) = resolve_target(&target, working_dir, &result.file_path) else {
                report.push(
                    ValidationIssue::error(format!("file not found: {}", target.display()))
                        .at(&target),
                );
                report.files_missing.push(target);
                continue;
            };

            if self.check_file(&resolved, &candidate.line_ranges, &mut report) {
                report.add_target(resolved);
            }
        }

        if report.is_valid {
            report.push(ValidationIssue::info(format!(
                "{} file(s) to modify, {} line range(s)",
                report.files_to_modify.len(),
                candidate.line_ranges.len()
            )));
        }

        report
    }

    fn check_confidence(&self, score: f64, report: &mut ValidationResult) {
        if !(0.0..=1.0).contains(&score) {
            report.push(ValidationIssue::error(format!(
                "confidence score {score} is outside [0, 1]"
            )));
        } else if score < MIN_CONFIDENCE {
            report.push(ValidationIssue::error(format!(
                "confidence {score:.2} is too low to apply (minimum {MIN_CONFIDENCE:.2})"
            )));
        } else if score < self.config.auto_apply_threshold {
            report.push(ValidationIssue::warning(format!(
                "confidence {score:.2} is below the auto-apply threshold {:.2}; review recommended",
                self.config.auto_apply_threshold
            )));
        }
    }

    /// Per-file checks. Returns false when the file must not be patched.
    fn check_file(
        &self,
        path: &Path,
        ranges: &[LineRange],
        report: &mut ValidationResult,
    ) -> bool {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                report.push(ValidationIssue::error(format!("cannot stat file: {e}")).at(path));
                return false;
            }
        };
        if !metadata.is_file() {
            report.push(ValidationIssue::error("not a regular file").at(path));
            return false;
        }

        if let Some(guard) = self.guard {
            if let Err(e) = guard.validate_path(path) {
                report.push(ValidationIssue::error(e.to_string()).at(path));
                return false;
            }
        }

        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                report.push(ValidationIssue::error(format!("file is not readable: {e}")).at(path));
                return false;
            }
        };

        if metadata.permissions().readonly() {
            report.push(ValidationIssue::warning("file is not writable").at(path));
        }

        if self.config.check_ranges {
            match std::str::from_utf8(&content) {
                Ok(text) => check_ranges(path, text.lines().count(), ranges, report),
                Err(_) => report.push(
                    ValidationIssue::warning("file is not valid UTF-8; line ranges not checked")
                        .at(path),
                ),
            }
        }

        true
    }
}

fn check_ranges(
    path: &Path,
    line_count: usize,
    ranges: &[LineRange],
    report: &mut ValidationResult,
) {
    for range in ranges {
        let Err(reason) = check_range(*range, line_count) else {
            continue;
        };
        report.push(
            ValidationIssue::warning(format!("range {range} will be skipped: {reason}"))
                .at(path)
                .at_line(range.start),
        );
    }
}
