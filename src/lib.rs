//! Defect Patcher: safe application of static-analysis fixes
//!
//! Takes a proposed fix for a defect (target files, 1-indexed line ranges,
//! replacement text, confidence score) and applies it to a working tree so
//! that a failure part-way through leaves the tree either fully patched or
//! fully restored.
//!
//! # Architecture
//!
//! [`PatchEngine`] drives each fix through validate, backup, checkout, apply
//! and finalize. The line merge itself is a pure function
//! ([`patcher::apply`]); everything that touches the disk or a
//! version-control client sits behind its own module:
//!
//! - [`validate`]: preconditions, never mutates anything
//! - [`backup`]: checksummed copies plus a JSON manifest
//! - [`edit`]: line-ending preserving, atomic file rewrite
//! - [`vcs`]: Perforce adapter behind the [`VersionControl`] trait
//! - [`rollback`]: restore from backup and revert checkouts
//!
//! # Safety
//!
//! - Every target is backed up before the first write
//! - Atomic file writes (tempfile + fsync + rename)
//! - Backup and VCS metadata directories are never patched
//! - Rollback failures are surfaced, never swallowed
//!
//! # Example
//!
//! ```no_run
//! use defect_patcher::{AnalysisResult, EngineConfig, FixCandidate, LineRange, PatchEngine};
//! use std::path::{Path, PathBuf};
//!
//! let fix = FixCandidate::new(
//!     "if (p == NULL) return -1;",
//!     vec![PathBuf::from("src/io.c")],
//!     vec![LineRange::new(42, 42)],
//!     0.92,
//! );
//! let defect = AnalysisResult::new("CID-1001", "src/io.c", 42, vec![fix]);
//!
//! let engine = PatchEngine::new(EngineConfig::default());
//! match engine.apply(&defect, Path::new(".")) {
//!     Ok(result) => println!("{}: {}", result.defect_id, result.status),
//!     Err(e) => eprintln!("manual intervention required: {e}"),
//! }
//! ```

pub mod backup;
pub mod config;
pub mod edit;
pub mod engine;
pub mod logging;
pub mod model;
pub mod patcher;
pub mod rollback;
pub mod safety;
pub mod validate;
pub mod vcs;

// Re-exports
pub use backup::{BackupEntry, BackupError, BackupManifest, BackupStore, RestoreReport};
pub use config::{load_from_path, load_from_str, ConfigError, EngineConfig};
pub use edit::{EditError, FileModification, LineEdit};
pub use engine::{
    AppliedChange, ApplicationResult, ChangeStatus, EngineError, PatchEngine, Phase,
};
pub use model::{AnalysisResult, FixCandidate, InputError, LineRange};
pub use patcher::{PatchOutcome, SkipReason, SkippedRange};
pub use rollback::{RollbackCoordinator, RollbackError, RollbackReport};
pub use safety::{SafetyError, WorkspaceGuard};
pub use validate::{Severity, ValidationIssue, ValidationResult, Validator};
pub use vcs::{VcsError, VersionControl};
