//! Checksummed file backups.
//!
//! Every file a patch will touch is copied byte-for-byte into a per-patch
//! directory before anything is mutated, and a JSON manifest recording the
//! SHA-256 of each copy is written once all copies succeed. The manifest
//! survives process restarts, so a rollback can be replayed later.
//!
//! Layout of one backup:
//!
//! ```text
//! <backup_root>/<patch_id>[-<timestamp>]/
//!     manifest.json
//!     files/<path relative to the working directory>
//!     external/<n>_<file name>      (targets outside the working directory)
//! ```

use crate::config::BackupConfig;
use crate::edit::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
const FILES_DIR: &str = "files";
const EXTERNAL_DIR: &str = "external";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the original bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub patch_id: String,
    pub backup_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl BackupManifest {
    pub fn manifest_path(&self) -> PathBuf {
        self.backup_dir.join(MANIFEST_FILE_NAME)
    }

    pub fn original_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.original_path.as_path())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("failed to back up {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("failed to write manifest {path}: {source}")]
    WriteManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read manifest {path}: {source}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {source}")]
    ParseManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to remove backup directory {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Files one restore put back, and the ones it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    /// Restored anyway, but the backup bytes no longer match the manifest.
    pub checksum_mismatches: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace anything that is not safe in a directory name.
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "patch".to_string()
    } else {
        cleaned
    }
}

/// Location of a file's copy relative to the backup directory. Working-tree
/// files mirror their path under `files/`; anything else is flattened into
/// `external/`, so the two can never collide.
fn relative_backup_path(original: &Path, working_dir: &Path, index: usize) -> PathBuf {
    if let Ok(relative) = original.strip_prefix(working_dir) {
        let stays_inside = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if stays_inside && !relative.as_os_str().is_empty() {
            return Path::new(FILES_DIR).join(relative);
        }
    }
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Path::new(EXTERNAL_DIR).join(format!("{index}_{name}"))
}

pub struct BackupStore {
    root: PathBuf,
    timestamped: bool,
    verify_checksums: bool,
}

impl BackupStore {
    /// Store rooted at `config.backup_dir`, resolved against `working_dir`.
    pub fn new(config: &BackupConfig, working_dir: &Path) -> Self {
        let root = if config.backup_dir.is_absolute() {
            config.backup_dir.clone()
        } else {
            working_dir.join(&config.backup_dir)
        };
        Self {
            root,
            timestamped: config.timestamped,
            verify_checksums: config.verify_checksums,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn allocate_dir(&self, patch_id: &str) -> Result<PathBuf, BackupError> {
        let base = sanitize_id(patch_id);
        if !self.timestamped {
            let dir = self.root.join(&base);
            if dir.exists() {
                return Err(BackupError::AlreadyExists(dir));
            }
            return Ok(dir);
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
        let stem = format!("{base}-{stamp}");
        let mut dir = self.root.join(&stem);
        let mut n = 1;
        while dir.exists() {
            dir = self.root.join(format!("{stem}-{n}"));
            n += 1;
        }
        Ok(dir)
    }

    /// Copy every file in `files` into a fresh backup directory.
    ///
    /// All-or-nothing: if any copy fails, the partial backup directory is
    /// removed and the error is returned. The manifest is written last.
    pub fn backup(
        &self,
        files: &[PathBuf],
        patch_id: &str,
        working_dir: &Path,
    ) -> Result<BackupManifest, BackupError> {
        let backup_dir = self.allocate_dir(patch_id)?;
        fs::create_dir_all(&backup_dir).map_err(|source| BackupError::CreateDir {
            path: backup_dir.clone(),
            source,
        })?;

        match self.copy_all(files, patch_id, working_dir, &backup_dir) {
            Ok(manifest) => {
                info!(
                    patch_id,
                    files = manifest.total_files,
                    bytes = manifest.total_bytes,
                    dir = %backup_dir.display(),
                    "backup complete"
                );
                Ok(manifest)
            }
            Err(err) => {
                if let Err(e) = fs::remove_dir_all(&backup_dir) {
                    warn!(dir = %backup_dir.display(), error = %e, "failed to remove partial backup");
                }
                Err(err)
            }
        }
    }

    fn copy_all(
        &self,
        files: &[PathBuf],
        patch_id: &str,
        working_dir: &Path,
        backup_dir: &Path,
    ) -> Result<BackupManifest, BackupError> {
        let mut entries = Vec::with_capacity(files.len());

        for (index, original) in files.iter().enumerate() {
            let copy_err = |source| BackupError::Copy {
                path: original.clone(),
                source,
            };

            let bytes = fs::read(original).map_err(copy_err)?;
            let permissions = fs::metadata(original).map_err(copy_err)?.permissions();

            let backup_path = backup_dir.join(relative_backup_path(original, working_dir, index));
            if let Some(parent) = backup_path.parent() {
                fs::create_dir_all(parent).map_err(copy_err)?;
            }
            fs::write(&backup_path, &bytes).map_err(copy_err)?;
            fs::set_permissions(&backup_path, permissions).map_err(copy_err)?;

            debug!(file = %original.display(), backup = %backup_path.display(), "backed up");
            entries.push(BackupEntry {
                original_path: original.clone(),
                backup_path,
                size_bytes: bytes.len() as u64,
                checksum: sha256_hex(&bytes),
                created_at: Utc::now(),
            });
        }

        let manifest = BackupManifest {
            patch_id: patch_id.to_string(),
            backup_dir: backup_dir.to_path_buf(),
            created_at: Utc::now(),
            total_files: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            entries,
        };

        let path = manifest.manifest_path();
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| BackupError::WriteManifest {
            path: path.clone(),
            source: e.into(),
        })?;
        atomic_write(&path, &json).map_err(|source| BackupError::WriteManifest {
            path: path.clone(),
            source,
        })?;

        Ok(manifest)
    }

    /// Copy every backed-up file back to its original location.
    ///
    /// Best-effort: a failing file is recorded and the rest still restore. A
    /// checksum mismatch is logged and the backup bytes are restored anyway.
    pub fn restore(&self, manifest: &BackupManifest) -> RestoreReport {
        let mut report = RestoreReport::default();

        for entry in &manifest.entries {
            let bytes = match fs::read(&entry.backup_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(backup = %entry.backup_path.display(), error = %e, "backup copy unreadable");
                    report
                        .failed
                        .push((entry.original_path.clone(), format!("read backup: {e}")));
                    continue;
                }
            };

            if self.verify_checksums && sha256_hex(&bytes) != entry.checksum {
                warn!(
                    file = %entry.original_path.display(),
                    expected = %entry.checksum,
                    "backup checksum mismatch; restoring anyway"
                );
                report.checksum_mismatches.push(entry.original_path.clone());
            }

            if let Some(parent) = entry.original_path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        report
                            .failed
                            .push((entry.original_path.clone(), format!("create parent: {e}")));
                        continue;
                    }
                }
            }

            match crate::edit::write_file(&entry.original_path, &bytes) {
                Ok(()) => {
                    debug!(file = %entry.original_path.display(), "restored");
                    report.restored.push(entry.original_path.clone());
                }
                Err(e) => {
                    warn!(file = %entry.original_path.display(), error = %e, "restore failed");
                    report.failed.push((entry.original_path.clone(), e.to_string()));
                }
            }
        }

        info!(
            patch_id = %manifest.patch_id,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "restore finished"
        );
        report
    }

    /// Delete a backup directory. Returns false if it was already gone.
    pub fn cleanup(&self, manifest: &BackupManifest) -> Result<bool, BackupError> {
        let dir = &manifest.backup_dir;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir).map_err(|source| BackupError::Cleanup {
            path: dir.clone(),
            source,
        })?;
        info!(patch_id = %manifest.patch_id, dir = %dir.display(), "backup removed");
        Ok(true)
    }

    /// Every manifest under the store root, oldest directory name first.
    pub fn list_manifests(&self) -> Vec<PathBuf> {
        if !self.root.is_dir() {
            return Vec::new();
        }
        let mut manifests: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE_NAME)
            .map(|e| e.into_path())
            .collect();
        manifests.sort();
        manifests
    }
}

pub fn load_manifest(path: impl AsRef<Path>) -> Result<BackupManifest, BackupError> {
    let path = path.as_ref();
    let contents = fs::read(path).map_err(|source| BackupError::ReadManifest {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&contents).map_err(|source| BackupError::ParseManifest {
        path: path.to_path_buf(),
        source,
    })
}
