//! Per-directory VCS settings.
//!
//! A settings file (`.p4config` by default) holds `KEY=VALUE` lines. The
//! nearest one above a target file overrides the process-wide defaults from
//! [`VcsConfig`](crate::config::VcsConfig). Lookups are memoised per
//! directory that holds a settings file.

use super::VcsError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Effective settings for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSettings {
    /// Directory holding the settings file that applied, if any.
    pub root: Option<PathBuf>,
    pub values: BTreeMap<String, String>,
}

impl WorkspaceSettings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are ignored, as are
/// lines without `=`.
pub fn parse_settings(input: &str) -> BTreeMap<String, String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Cache of parsed settings files, keyed by the directory that holds them.
#[derive(Debug, Default)]
pub struct WorkspaceConfigCache {
    file_name: String,
    by_dir: HashMap<PathBuf, BTreeMap<String, String>>,
}

impl WorkspaceConfigCache {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            by_dir: HashMap::new(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Number of settings files parsed so far.
    pub fn len(&self) -> usize {
        self.by_dir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dir.is_empty()
    }

    /// Nearest directory at or above `start` that holds a settings file.
    fn discover(&self, start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .find(|dir| self.by_dir.contains_key(*dir) || dir.join(&self.file_name).is_file())
            .map(Path::to_path_buf)
    }

    /// Settings for `target`, with the nearest settings file merged over `defaults`.
    pub fn resolve(
        &mut self,
        target: &Path,
        defaults: &BTreeMap<String, String>,
    ) -> Result<WorkspaceSettings, VcsError> {
        let start = if target.is_dir() {
            target
        } else {
            target.parent().unwrap_or(target)
        };

        let mut values = defaults.clone();
        let Some(root) = self.discover(start) else {
            return Ok(WorkspaceSettings { root: None, values });
        };

        if !self.by_dir.contains_key(&root) {
            let path = root.join(&self.file_name);
            let contents = fs::read_to_string(&path)
                .map_err(|source| VcsError::Settings { path, source })?;
            self.by_dir.insert(root.clone(), parse_settings(&contents));
        }

        if let Some(local) = self.by_dir.get(&root) {
            values.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(WorkspaceSettings {
            root: Some(root),
            values,
        })
    }
}
