//! Line-range patching: merge replacement text into a file's lines.
//!
//! This module is pure. It never touches the filesystem, which keeps the
//! merge heuristics trivially testable; [`crate::edit`] does the I/O.
//!
//! # Single range
//!
//! The whole fix text replaces the range.
//!
//! # Multiple ranges
//!
//! Ranges are processed by start line, descending, so that replacing a later
//! range never shifts the indices of an earlier one. With `F` fix lines and
//! `R` ranges:
//!
//! - `F == R`: one fix line per range, in ascending source order.
//! - `F < R`: one line per range taken from the front of the pool while
//!   walking ranges in descending order; ranges left without lines are
//!   skipped.
//! - `F > R`: `F / R` lines per range, with the first `F % R` ranges (in
//!   descending order) taking one extra line.
//!
//! The case is picked from every supplied range, but fix lines are dealt only
//! to valid ones. A range that is invalid (zero, inverted or past the end of
//! the file) is reported as skipped and takes nothing from the pool, so the
//! remaining ranges still receive their lines.

use crate::model::LineRange;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a range was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// `start` or `end` is zero.
    ZeroLine,
    /// `start > end`.
    Inverted,
    /// `end` is beyond the last line.
    OutOfBounds { line_count: usize },
    /// The fix-line pool ran dry before this range was reached.
    NoFixLines,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ZeroLine => write!(f, "line numbers are 1-based"),
            SkipReason::Inverted => write!(f, "start is after end"),
            SkipReason::OutOfBounds { line_count } => {
                write!(f, "range exceeds file length of {line_count} lines")
            }
            SkipReason::NoFixLines => write!(f, "no fix lines left for this range"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRange {
    pub range: LineRange,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl fmt::Display for SkippedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped {}: {}", self.range, self.reason)
    }
}

/// Outcome of merging fix text into a set of lines.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchOutcome holds the patched lines"]
pub struct PatchOutcome {
    pub lines: Vec<String>,
    /// Ranges that were replaced, in processing order.
    pub applied: Vec<LineRange>,
    pub skipped: Vec<SkippedRange>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl PatchOutcome {
    fn unchanged(lines: &[String]) -> Self {
        Self {
            lines: lines.to_vec(),
            applied: Vec::new(),
            skipped: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
        }
    }

    /// True when at least one range was replaced.
    pub fn is_modified(&self) -> bool {
        !self.applied.is_empty()
    }

    fn splice(&mut self, range: LineRange, replacement: &[String]) {
        let start = range.start - 1;
        let end = range.end - 1;
        self.lines
            .splice(start..=end, replacement.iter().cloned());
        self.applied.push(range);
        self.lines_removed += range.len();
        self.lines_added += replacement.len();
    }

    fn skip(&mut self, range: LineRange, reason: SkipReason) {
        self.skipped.push(SkippedRange { range, reason });
    }
}

/// Split fix text into lines. An empty fix text has zero lines.
pub fn split_fix_lines(fix_text: &str) -> Vec<String> {
    fix_text.lines().map(str::to_string).collect()
}

/// Why `range` cannot be applied to a file of `line_count` lines, if it can't.
pub(crate) fn check_range(range: LineRange, line_count: usize) -> Result<(), SkipReason> {
    if range.start == 0 || range.end == 0 {
        return Err(SkipReason::ZeroLine);
    }
    if range.start > range.end {
        return Err(SkipReason::Inverted);
    }
    if range.end > line_count {
        return Err(SkipReason::OutOfBounds { line_count });
    }
    Ok(())
}

/// Merge `fix_text` into `original` according to `ranges`.
pub fn apply(original: &[String], fix_text: &str, ranges: &[LineRange]) -> PatchOutcome {
    let mut outcome = PatchOutcome::unchanged(original);
    let fix_lines = split_fix_lines(fix_text);

    match ranges {
        [] => {}
        [range] => match check_range(*range, original.len()) {
            Ok(()) => outcome.splice(*range, &fix_lines),
            Err(reason) => outcome.skip(*range, reason),
        },
        _ => {
            let mut ordered = ranges.to_vec();
            // Stable: equal starts keep their input order.
            ordered.sort_by(|a, b| b.start.cmp(&a.start));

            let valid = ordered
                .iter()
                .filter(|range| range.fits(original.len()))
                .count();
            let mut allocation = allocate(fix_lines.len(), ordered.len(), valid).into_iter();
            let mut pool = fix_lines.as_slice();

            for range in ordered {
                // Checked against the current lines: an overlapping range can
                // fall out of bounds once a later one has been replaced.
                if let Err(reason) = check_range(range, outcome.lines.len()) {
                    outcome.skip(range, reason);
                    continue;
                }

                let chunk = match allocation.next() {
                    Some(Allocation::Line(index)) => fix_lines.get(index..index + 1).unwrap_or(&[]),
                    Some(Allocation::Front(count)) => {
                        let take = count.min(pool.len());
                        let (chunk, rest) = pool.split_at(take);
                        pool = rest;
                        chunk
                    }
                    None => &[],
                };
                if chunk.is_empty() {
                    outcome.skip(range, SkipReason::NoFixLines);
                    continue;
                }
                outcome.splice(range, chunk);
            }
        }
    }

    outcome
}

/// Fix lines assigned to one valid range, in descending-start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    /// A specific fix line by index.
    Line(usize),
    /// The next `n` lines from the front of the remaining pool.
    Front(usize),
}

/// `range_count` picks the case and the per-range share; only `valid_count`
/// slots are handed out.
fn allocate(fix_count: usize, range_count: usize, valid_count: usize) -> Vec<Allocation> {
    use std::cmp::Ordering;

    match fix_count.cmp(&range_count) {
        Ordering::Equal => (0..valid_count)
            .map(|i| Allocation::Line(valid_count - 1 - i))
            .collect(),
        Ordering::Less => {
            let per_range = (fix_count / range_count).max(1);
            vec![Allocation::Front(per_range); valid_count]
        }
        Ordering::Greater => {
            let per_range = fix_count / range_count;
            let remainder = fix_count % range_count;
            (0..valid_count)
                .map(|i| {
                    if i < remainder {
                        Allocation::Front(per_range + 1)
                    } else {
                        Allocation::Front(per_range)
                    }
                })
                .collect()
        }
    }
}
