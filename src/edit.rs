use crate::model::LineRange;
use crate::patcher::{self, PatchOutcome, SkippedRange};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A line-range patch bound to one file on disk.
///
/// The merge itself is done by [`patcher::apply`]; this type owns the I/O
/// around it: decoding, line-ending preservation and the atomic write.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "LineEdit does nothing until apply() is called"]
pub struct LineEdit {
    /// Resolved path of the file to patch
    pub file: PathBuf,
    /// Replacement text
    pub fix_text: String,
    /// 1-indexed inclusive ranges to replace
    pub ranges: Vec<LineRange>,
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid UTF-8: {source}")]
    Utf8 {
        path: PathBuf,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// Per-file record of what a patch did (or would do, in a dry run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    pub file: PathBuf,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub ranges_applied: Vec<LineRange>,
    #[serde(default)]
    pub ranges_skipped: Vec<SkippedRange>,
    /// False for dry runs and for patches that left the content unchanged.
    pub written: bool,
}

/// Source text split into lines, remembering how to join it back.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LineBuffer {
    lines: Vec<String>,
    eol: &'static str,
    trailing_newline: bool,
}

impl LineBuffer {
    fn parse(content: &str) -> Self {
        let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
        Self {
            lines: content.lines().map(str::to_string).collect(),
            eol,
            trailing_newline: content.ends_with('\n'),
        }
    }

    fn render(&self, lines: &[String]) -> String {
        let mut out = lines.join(self.eol);
        if self.trailing_newline && !lines.is_empty() {
            out.push_str(self.eol);
        }
        out
    }
}

impl LineEdit {
    pub fn new(
        file: impl Into<PathBuf>,
        fix_text: impl Into<String>,
        ranges: Vec<LineRange>,
    ) -> Self {
        Self {
            file: file.into(),
            fix_text: fix_text.into(),
            ranges,
        }
    }

    fn read(&self) -> Result<String, EditError> {
        let bytes = fs::read(&self.file).map_err(|source| EditError::Read {
            path: self.file.clone(),
            source,
        })?;
        String::from_utf8(bytes).map_err(|e| EditError::Utf8 {
            path: self.file.clone(),
            source: e.utf8_error(),
        })
    }

    /// Merge against the given content without touching the filesystem.
    ///
    /// Returns the merge outcome and the rendered text.
    pub fn plan(&self, content: &str) -> (PatchOutcome, String) {
        let buffer = LineBuffer::parse(content);
        let outcome = patcher::apply(&buffer.lines, &self.fix_text, &self.ranges);
        let rendered = if outcome.is_modified() {
            buffer.render(&outcome.lines)
        } else {
            content.to_string()
        };
        (outcome, rendered)
    }

    /// Compute the patched text of the file without writing it.
    pub fn preview(&self) -> Result<(String, String), EditError> {
        let original = self.read()?;
        let (_, rendered) = self.plan(&original);
        Ok((original, rendered))
    }

    /// Compute what [`apply`](Self::apply) would do, without writing.
    pub fn simulate(&self) -> Result<FileModification, EditError> {
        let original = self.read()?;
        let (outcome, _) = self.plan(&original);
        Ok(self.record(outcome, false))
    }

    /// Apply this edit to the file system atomically.
    ///
    /// Uses tempfile + fsync + rename for crash safety. Content that comes out
    /// identical to the input is not rewritten.
    pub fn apply(&self) -> Result<FileModification, EditError> {
        let original = self.read()?;
        let (outcome, rendered) = self.plan(&original);

        if rendered == original {
            return Ok(self.record(outcome, false));
        }

        write_file(&self.file, rendered.as_bytes())?;
        Ok(self.record(outcome, true))
    }

    fn record(&self, outcome: PatchOutcome, written: bool) -> FileModification {
        FileModification {
            file: self.file.clone(),
            lines_added: outcome.lines_added,
            lines_removed: outcome.lines_removed,
            ranges_applied: outcome.applied,
            ranges_skipped: outcome.skipped,
            written,
        }
    }
}

/// Atomically replace `path` with `content` and bump its mtime.
pub(crate) fn write_file(path: &Path, content: &[u8]) -> Result<(), EditError> {
    let wrap = |source| EditError::Write {
        path: path.to_path_buf(),
        source,
    };
    atomic_write(path, content).map_err(wrap)?;

    // Update mtime to invalidate incremental builds
    let now = filetime::FileTime::now();
    filetime::set_file_mtime(path, now).map_err(wrap)?;
    Ok(())
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write succeeds or nothing changes. Existing permissions
/// are carried over to the new file.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Create tempfile in same directory to ensure same filesystem
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Path has no parent directory",
            ))
        }
    };

    let permissions = fs::metadata(path).ok().map(|m| m.permissions());
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;

    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        temp.as_file().set_permissions(permissions)?;
    }

    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
