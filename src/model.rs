//! Input model produced by the upstream fix generator.
//!
//! An [`AnalysisResult`] describes one static-analysis defect together with
//! the fix candidates proposed for it. The engine treats these values as
//! read-only: it trusts the confidence score and line ranges but re-checks
//! everything that touches the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A 1-indexed, inclusive line range.
///
/// Well-formed ranges satisfy `0 < start <= end`. Malformed ranges can still
/// be deserialized; the patcher skips them individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A range covering a single line.
    pub fn line(line: usize) -> Self {
        Self::new(line, line)
    }

    pub fn is_well_formed(&self) -> bool {
        self.start > 0 && self.start <= self.end
    }

    /// Whether the range addresses existing lines of a file with `line_count` lines.
    pub fn fits(&self, line_count: usize) -> bool {
        self.is_well_formed() && self.end <= line_count
    }

    /// Number of lines covered. Zero for malformed ranges.
    pub fn len(&self) -> usize {
        if self.is_well_formed() {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "L{}", self.start)
        } else {
            write!(f, "L{}-{}", self.start, self.end)
        }
    }
}

/// One proposed fix for a defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixCandidate {
    /// Replacement text, possibly spanning several lines.
    pub fix_text: String,
    /// Files the fix touches. Empty means "the defect's own file".
    #[serde(default)]
    pub affected_files: Vec<PathBuf>,
    #[serde(default)]
    pub line_ranges: Vec<LineRange>,
    /// Generator confidence in `[0, 1]`.
    pub confidence_score: f64,
    #[serde(default)]
    pub description: String,
}

impl FixCandidate {
    pub fn new(
        fix_text: impl Into<String>,
        affected_files: Vec<PathBuf>,
        line_ranges: Vec<LineRange>,
        confidence_score: f64,
    ) -> Self {
        Self {
            fix_text: fix_text.into(),
            affected_files,
            line_ranges,
            confidence_score,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A defect plus its fix candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub defect_id: String,
    pub file_path: PathBuf,
    pub line_number: usize,
    #[serde(default)]
    pub fix_candidates: Vec<FixCandidate>,
    #[serde(default)]
    pub recommended_fix_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl AnalysisResult {
    pub fn new(
        defect_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        line_number: usize,
        fix_candidates: Vec<FixCandidate>,
    ) -> Self {
        Self {
            defect_id: defect_id.into(),
            file_path: file_path.into(),
            line_number,
            fix_candidates,
            recommended_fix_index: 0,
            category: None,
        }
    }

    /// The recommended candidate, if the index is in bounds.
    pub fn recommended(&self) -> Option<&FixCandidate> {
        self.fix_candidates.get(self.recommended_fix_index)
    }

    /// Files the recommended candidate targets, as written in the input.
    ///
    /// Falls back to the defect's own file when the candidate lists none.
    pub fn target_files(&self) -> Vec<PathBuf> {
        match self.recommended() {
            Some(candidate) if !candidate.affected_files.is_empty() => {
                candidate.affected_files.clone()
            }
            Some(_) => vec![self.file_path.clone()],
            None => Vec::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("failed to read analysis input {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid analysis JSON{}: {source}", display_path(.path))]
    Json {
        path: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnalysisDocument {
    Many(Vec<AnalysisResult>),
    One(Box<AnalysisResult>),
}

/// Parse one analysis result or a JSON array of them.
pub fn load_analysis_from_str(input: &str) -> Result<Vec<AnalysisResult>, InputError> {
    let document: AnalysisDocument =
        serde_json::from_str(input).map_err(|source| InputError::Json { path: None, source })?;
    Ok(match document {
        AnalysisDocument::Many(results) => results,
        AnalysisDocument::One(result) => vec![*result],
    })
}

pub fn load_analysis_from_path(path: impl AsRef<Path>) -> Result<Vec<AnalysisResult>, InputError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_analysis_from_str(&contents).map_err(|error| match error {
        InputError::Json { path: None, source } => InputError::Json {
            path: Some(path.to_path_buf()),
            source,
        },
        other => other,
    })
}
