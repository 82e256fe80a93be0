//! Perforce adapter backed by the `p4` command-line client.
//!
//! Queries use tagged output (`p4 -ztag ...`), where every field is printed
//! as `... key value` and records are separated by blank lines.

use super::process::run_with_timeout;
use super::workspace::{WorkspaceConfigCache, WorkspaceSettings};
use super::{FileAction, FileInfo, VcsError, VersionControl, WorkspaceState};
use crate::config::VcsConfig;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub type TaggedRecord = BTreeMap<String, String>;

/// Parse `-ztag` output into records.
pub fn parse_tagged(output: &str) -> Vec<TaggedRecord> {
    let mut records = Vec::new();
    let mut current = TaggedRecord::new();

    for line in output.lines() {
        let Some(field) = line.strip_prefix("... ") else {
            if line.trim().is_empty() && !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        };
        let (key, value) = field.split_once(' ').unwrap_or((field, ""));
        current.insert(key.to_string(), value.to_string());
    }

    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn file_info_from_record(record: &TaggedRecord, fallback: &Path) -> FileInfo {
    let local_path = record
        .get("clientFile")
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf());
    let revision = ["workRev", "haveRev", "rev"]
        .iter()
        .find_map(|key| record.get(*key))
        .and_then(|rev| rev.parse().ok());

    FileInfo {
        local_path,
        depot_path: record.get("depotFile").cloned(),
        revision,
        action: record.get("action").map(|a| FileAction::parse(a)),
        changelist: record.get("change").cloned(),
    }
}

/// Extract `N` from `Change N created.`
fn parse_created_change(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Change ")?;
        let (number, tail) = rest.split_once(' ')?;
        tail.starts_with("created").then(|| number.parse().ok())?
    })
}

/// Render a changelist spec for `p4 change -i`.
pub fn changelist_spec(
    description: &str,
    files: &[PathBuf],
    client: Option<&str>,
    user: Option<&str>,
) -> String {
    let mut spec = String::from("Change: new\n\n");
    if let Some(client) = client {
        spec.push_str(&format!("Client: {client}\n\n"));
    }
    if let Some(user) = user {
        spec.push_str(&format!("User: {user}\n\n"));
    }
    spec.push_str("Status: new\n\nDescription:\n");
    for line in description.lines() {
        spec.push('\t');
        spec.push_str(line);
        spec.push('\n');
    }
    if !files.is_empty() {
        spec.push_str("\nFiles:\n");
        for file in files {
            spec.push('\t');
            spec.push_str(&file.to_string_lossy());
            spec.push('\n');
        }
    }
    spec
}

pub struct PerforceClient {
    config: VcsConfig,
    cache: RefCell<WorkspaceConfigCache>,
}

impl PerforceClient {
    pub fn new(config: VcsConfig) -> Self {
        let cache = WorkspaceConfigCache::new(config.config_file_name.clone());
        Self {
            config,
            cache: RefCell::new(cache),
        }
    }

    fn settings_for(&self, target: &Path) -> Result<WorkspaceSettings, VcsError> {
        self.cache
            .borrow_mut()
            .resolve(target, &self.config.base_settings())
    }

    fn describe(&self, args: &[String]) -> String {
        let mut command = self.config.binary.clone();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    /// Run the client with the settings that apply to `target`.
    fn run(
        &self,
        target: &Path,
        settings: &WorkspaceSettings,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, VcsError> {
        let description = self.describe(args);
        let cwd = settings
            .root
            .clone()
            .or_else(|| target.parent().map(Path::to_path_buf))
            .filter(|dir| dir.is_dir());

        let mut command = Command::new(&self.config.binary);
        command.args(args).envs(&settings.values);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!(command = %description, "running VCS client");
        let output = run_with_timeout(&mut command, stdin, self.config.timeout()).map_err(
            |source| VcsError::Spawn {
                command: description.clone(),
                source,
            },
        )?;

        if output.timed_out {
            return Err(VcsError::Timeout {
                command: description,
                timeout_secs: self.config.timeout_secs,
            });
        }
        if !output.success() {
            return Err(VcsError::CommandFailed {
                command: description,
                code: output.code(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Split `files` by the workspace settings that apply to each, keeping order.
    fn group_by_workspace(
        &self,
        files: &[PathBuf],
    ) -> Result<Vec<(WorkspaceSettings, Vec<PathBuf>)>, VcsError> {
        let mut groups: Vec<(WorkspaceSettings, Vec<PathBuf>)> = Vec::new();
        for file in files {
            let settings = self.settings_for(file)?;
            match groups.iter_mut().find(|(s, _)| *s == settings) {
                Some((_, members)) => members.push(file.clone()),
                None => groups.push((settings, vec![file.clone()])),
            }
        }
        Ok(groups)
    }

    fn file_args(command: &str, files: &[PathBuf]) -> Vec<String> {
        let mut args = vec!["-ztag".to_string(), command.to_string()];
        args.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
        args
    }

    fn checkout_group(
        &self,
        settings: &WorkspaceSettings,
        files: &[PathBuf],
    ) -> Result<Vec<FileInfo>, VcsError> {
        let args = Self::file_args("edit", files);
        let attempts = self.config.checkout_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.run(&files[0], settings, &args, None) {
                Ok(stdout) => {
                    let records = parse_tagged(&stdout);
                    if records.is_empty() {
                        return Err(VcsError::Parse {
                            command: self.describe(&args),
                            message: "no files were opened for edit".to_string(),
                        });
                    }
                    return Ok(records
                        .iter()
                        .zip(files.iter().chain(std::iter::repeat(&files[0])))
                        .map(|(record, fallback)| file_info_from_record(record, fallback))
                        .collect());
                }
                Err(err @ VcsError::Spawn { .. }) => return Err(err),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let backoff = Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(1 << (attempt - 1).min(16)),
                    );
                    warn!(
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "checkout failed, retrying"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
            }
        }
    }
}

impl VersionControl for PerforceClient {
    fn is_enabled(&self) -> bool {
        true
    }

    fn validate_workspace(&self, target: &Path) -> Result<WorkspaceState, VcsError> {
        let settings = self.settings_for(target)?;
        let info_args = vec!["-ztag".to_string(), "info".to_string()];
        let info = parse_tagged(&self.run(target, &settings, &info_args, None)?);
        let Some(info) = info.first() else {
            return Err(VcsError::Parse {
                command: self.describe(&info_args),
                message: "empty info output".to_string(),
            });
        };

        let client_name = info
            .get("clientName")
            .filter(|name| name.as_str() != "*unknown*")
            .cloned();

        let pending_files = if client_name.is_some() {
            let opened_args = vec!["-ztag".to_string(), "opened".to_string()];
            parse_tagged(&self.run(target, &settings, &opened_args, None)?)
                .iter()
                .filter_map(|r| r.get("clientFile").or_else(|| r.get("depotFile")))
                .map(PathBuf::from)
                .collect()
        } else {
            Vec::new()
        };

        Ok(WorkspaceState {
            enabled: true,
            connected: true,
            client_name,
            client_root: info.get("clientRoot").map(PathBuf::from),
            user: info.get("userName").cloned(),
            server: info.get("serverAddress").cloned(),
            settings_dir: settings.root,
            pending_files,
        })
    }

    fn checkout(&self, files: &[PathBuf]) -> Result<Vec<FileInfo>, VcsError> {
        let mut opened = Vec::with_capacity(files.len());
        for (settings, group) in self.group_by_workspace(files)? {
            opened.extend(self.checkout_group(&settings, &group)?);
        }
        Ok(opened)
    }

    fn revert(&self, files: &[PathBuf]) -> Result<Vec<PathBuf>, VcsError> {
        let mut reverted = Vec::new();
        for (settings, group) in self.group_by_workspace(files)? {
            let args = Self::file_args("revert", &group);
            let stdout = self.run(&group[0], &settings, &args, None)?;
            reverted.extend(
                parse_tagged(&stdout)
                    .iter()
                    .filter_map(|r| r.get("clientFile"))
                    .map(PathBuf::from),
            );
        }
        Ok(reverted)
    }

    fn create_changelist(
        &self,
        description: &str,
        files: &[PathBuf],
    ) -> Result<Option<u64>, VcsError> {
        let Some(first) = files.first() else {
            return Ok(None);
        };
        let settings = self.settings_for(first)?;
        let spec = changelist_spec(
            description,
            files,
            settings.get("P4CLIENT"),
            settings.get("P4USER"),
        );
        let args = vec!["change".to_string(), "-i".to_string()];
        let stdout = self.run(first, &settings, &args, Some(&spec))?;

        parse_created_change(&stdout).map(Some).ok_or_else(|| VcsError::Parse {
            command: self.describe(&args),
            message: format!("no changelist number in {:?}", stdout.trim()),
        })
    }

    fn file_status(&self, file: &Path) -> Result<FileInfo, VcsError> {
        let settings = self.settings_for(file)?;
        let args = Self::file_args("fstat", &[file.to_path_buf()]);
        match self.run(file, &settings, &args, None) {
            Ok(stdout) => Ok(parse_tagged(&stdout)
                .first()
                .map(|record| file_info_from_record(record, file))
                .unwrap_or_else(|| FileInfo::untracked(file))),
            Err(VcsError::CommandFailed { stderr, .. }) if stderr.contains("no such file") => {
                Ok(FileInfo::untracked(file))
            }
            Err(err) => Err(err),
        }
    }
}
