use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Confidence below which a fix is never applied.
pub const MIN_CONFIDENCE: f64 = 0.5;

/// Engine configuration, one section per component.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub validation: ValidatorConfig,
    pub backup: BackupConfig,
    pub vcs: VcsConfig,
    pub safety: SafetyConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Scores at or above this apply without a warning.
    pub auto_apply_threshold: f64,
    /// Check that each resolved range fits in its file.
    pub check_ranges: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 0.8,
            check_ranges: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Backup root; relative paths are resolved against the working directory.
    pub backup_dir: PathBuf,
    /// Namespace each patch's backup directory with a timestamp.
    pub timestamped: bool,
    pub verify_checksums: bool,
    pub cleanup_on_success: bool,
    /// Persist the run's result next to the manifest.
    pub write_audit_record: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_dir: PathBuf::from(".defect-patcher/backups"),
            timestamped: true,
            verify_checksums: true,
            cleanup_on_success: false,
            write_audit_record: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VcsConfig {
    pub enabled: bool,
    /// Client binary to invoke.
    pub binary: String,
    pub auto_checkout: bool,
    /// Treat a failed checkout as fatal for the patch.
    pub require_checkout: bool,
    pub create_changelist: bool,
    pub changelist_prefix: String,
    pub timeout_secs: u64,
    pub checkout_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Per-directory settings file looked up from each target upward.
    pub config_file_name: String,
    pub port: Option<String>,
    pub user: Option<String>,
    pub client: Option<String>,
    /// Extra environment passed to every client invocation.
    pub env: BTreeMap<String, String>,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: "p4".to_string(),
            auto_checkout: true,
            require_checkout: false,
            create_changelist: true,
            changelist_prefix: "Automated fix".to_string(),
            timeout_secs: 30,
            checkout_attempts: 3,
            retry_backoff_ms: 250,
            config_file_name: ".p4config".to_string(),
            port: None,
            user: None,
            client: None,
            env: BTreeMap::new(),
        }
    }
}

impl VcsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Process-wide settings that per-directory files are merged over.
    pub fn base_settings(&self) -> BTreeMap<String, String> {
        let mut settings = self.env.clone();
        let named = [
            ("P4PORT", &self.port),
            ("P4USER", &self.user),
            ("P4CLIENT", &self.client),
        ];
        for (key, value) in named {
            if let Some(value) = value {
                settings.insert(key.to_string(), value.clone());
            }
        }
        settings
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    pub dry_run: bool,
    pub automatic_rollback_on_failure: bool,
    /// Directory names (relative to the working directory) that may never be patched.
    pub forbidden_dirs: Vec<String>,
    /// Refuse targets that resolve outside the working directory.
    pub restrict_to_workspace: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            automatic_rollback_on_failure: true,
            forbidden_dirs: vec![".git".to_string(), ".hg".to_string(), ".svn".to_string()],
            restrict_to_workspace: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut issues = Vec::new();

        let threshold = self.validation.auto_apply_threshold;
        if !(MIN_CONFIDENCE..=1.0).contains(&threshold) {
            issues.push(SchemaIssue::OutOfRange {
                field: "validation.auto_apply_threshold",
                message: format!("{threshold} is outside [{MIN_CONFIDENCE}, 1.0]"),
            });
        }

        if self.backup.enabled && self.backup.backup_dir.as_os_str().is_empty() {
            issues.push(SchemaIssue::Empty {
                field: "backup.backup_dir",
            });
        }

        if self.vcs.enabled {
            if self.vcs.binary.trim().is_empty() {
                issues.push(SchemaIssue::Empty { field: "vcs.binary" });
            }
            if self.vcs.config_file_name.trim().is_empty() {
                issues.push(SchemaIssue::Empty {
                    field: "vcs.config_file_name",
                });
            }
            if self.vcs.timeout_secs == 0 {
                issues.push(SchemaIssue::OutOfRange {
                    field: "vcs.timeout_secs",
                    message: "timeout must be at least one second".to_string(),
                });
            }
            if self.vcs.checkout_attempts == 0 {
                issues.push(SchemaIssue::OutOfRange {
                    field: "vcs.checkout_attempts",
                    message: "at least one attempt is required".to_string(),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SchemaError { issues })
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}", render_issues(.issues))]
pub struct SchemaError {
    pub issues: Vec<SchemaIssue>,
}

fn render_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Error)]
pub enum SchemaIssue {
    #[error("'{field}' must not be empty")]
    Empty { field: &'static str },
    #[error("'{field}' out of range: {message}")]
    OutOfRange { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_collects_every_issue() {
        let mut config = EngineConfig::default();
        config.validation.auto_apply_threshold = 0.3;
        config.vcs.enabled = true;
        config.vcs.binary = "  ".to_string();
        config.vcs.timeout_secs = 0;

        let err = config.validate().unwrap_err();
        assert_eq!(err.issues.len(), 3);
        let text = err.to_string();
        assert!(text.contains("validation.auto_apply_threshold"));
        assert!(text.contains("vcs.binary"));
        assert!(text.contains("vcs.timeout_secs"));
    }

    #[test]
    fn test_vcs_fields_ignored_when_disabled() {
        let mut config = EngineConfig::default();
        config.vcs.timeout_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_settings_merge_env_and_named_fields() {
        let mut vcs = VcsConfig::default();
        vcs.env.insert("P4PORT".to_string(), "ssl:old:1666".to_string());
        vcs.env.insert("P4CHARSET".to_string(), "utf8".to_string());
        vcs.port = Some("ssl:new:1666".to_string());

        let settings = vcs.base_settings();
        assert_eq!(settings["P4PORT"], "ssl:new:1666");
        assert_eq!(settings["P4CHARSET"], "utf8");
        assert!(!settings.contains_key("P4USER"));
    }
}
