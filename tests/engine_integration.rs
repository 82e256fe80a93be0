//! Integration tests for the patch engine
//!
//! Drives complete runs against temporary working trees: validation
//! failures, backups, VCS coordination, automatic and manual rollback.

use defect_patcher::engine::AUDIT_RECORD_FILE_NAME;
use defect_patcher::vcs::{FailureInjection, InMemoryVcs, VcsCall};
use defect_patcher::{
    AnalysisResult, ApplicationResult, ChangeStatus, EngineConfig, EngineError, FixCandidate,
    LineRange, PatchEngine, Phase,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

/// Helper to create a working tree with the given text files
fn setup_workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        write_file(dir.path(), name, content.as_bytes());
    }
    dir
}

fn write_file(dir: &Path, name: &str, content: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Bytes that are not UTF-8: they back up fine but cannot be patched.
const NOT_UTF8: &[u8] = &[0xff, 0xfe, b'\n', b'x', b'\n'];

fn defect(files: &[&str], fix: &str, ranges: Vec<LineRange>, score: f64) -> AnalysisResult {
    let affected = files.iter().map(PathBuf::from).collect();
    AnalysisResult::new(
        "CID-1001",
        files.first().copied().unwrap_or("main.c"),
        ranges.first().map_or(1, |r| r.start),
        vec![FixCandidate::new(fix, affected, ranges, score)
            .with_description("Guard against null dereference")],
    )
}

fn engine_with(config: EngineConfig, vcs: &Rc<InMemoryVcs>) -> PatchEngine {
    PatchEngine::with_vcs(config, Box::new(Rc::clone(vcs)))
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap()
}

#[test]
fn test_single_range_replacement() {
    let dir = setup_workspace(&[("main.c", "a\nb\nc\nd\ne\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::new(2, 3)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(result.final_phase, Phase::Done);
    assert_eq!(read(dir.path(), "main.c"), "a\nX\nd\ne\n");

    let change = &result.changes[0];
    assert_eq!(change.candidate_index, 0);
    assert_eq!(change.modifications[0].lines_added, 1);
    assert_eq!(change.modifications[0].lines_removed, 2);
    assert!(change.modifications[0].written);
}

#[test]
fn test_one_fix_line_per_range() {
    let dir = setup_workspace(&[("main.c", "1\n2\n3\n4\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(
            &defect(
                &["main.c"],
                "p\nq",
                vec![LineRange::line(2), LineRange::line(3)],
                0.9,
            ),
            dir.path(),
        )
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(read(dir.path(), "main.c"), "1\np\nq\n4\n");
}

#[test]
fn test_missing_file_writes_nothing() {
    let dir = setup_workspace(&[("other.c", "keep\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(&defect(&["missing.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert!(!result.validation.is_valid);
    assert_eq!(result.validation.files_missing, vec![PathBuf::from("missing.c")]);
    assert_eq!(result.status, ChangeStatus::Failed);
    assert_eq!(result.final_phase, Phase::Failed);
    assert!(result.changes.is_empty());

    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(read(dir.path(), "other.c"), "keep\n");
}

#[test]
fn test_low_confidence_is_rejected() {
    let dir = setup_workspace(&[("main.c", "a\nb\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.3), dir.path())
        .unwrap();

    assert!(!result.validation.is_valid);
    assert_eq!(result.status, ChangeStatus::Failed);
    assert!(result.errors.iter().any(|e| e.contains("too low to apply")));
    assert_eq!(read(dir.path(), "main.c"), "a\nb\n");
    assert!(!dir.path().join(".defect-patcher").exists());
}

#[test]
fn test_medium_confidence_applies_with_warning() {
    let dir = setup_workspace(&[("main.c", "a\nb\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.6), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert!(result.warnings.iter().any(|w| w.contains("auto-apply threshold")));
    assert_eq!(read(dir.path(), "main.c"), "X\nb\n");
}

#[test]
fn test_failure_on_seventh_of_ten_files_restores_all() {
    let names: Vec<String> = (1..=10).map(|i| format!("src/file{i:02}.c")).collect();
    let mut contents: Vec<Vec<u8>> = names
        .iter()
        .map(|name| format!("// {name}\nint value = 0;\n").into_bytes())
        .collect();
    contents[6] = NOT_UTF8.to_vec();

    let dir = TempDir::new().unwrap();
    for (name, content) in names.iter().zip(&contents) {
        write_file(dir.path(), name, content);
    }
    let engine = PatchEngine::new(EngineConfig::default());

    let targets: Vec<&str> = names.iter().map(String::as_str).collect();
    let result = engine
        .apply(
            &defect(&targets, "int value = 1;", vec![LineRange::line(2)], 0.95),
            dir.path(),
        )
        .unwrap();

    assert_eq!(result.status, ChangeStatus::RolledBack);
    assert_eq!(result.final_phase, Phase::RolledBack);
    assert_eq!(result.backup_manifest().unwrap().total_files, 10);

    let report = result.rollback.as_ref().unwrap();
    assert_eq!(report.restored.len(), 10);
    assert!(report.failures.is_empty());

    for (name, original) in names.iter().zip(&contents) {
        assert_eq!(&fs::read(dir.path().join(name)).unwrap(), original, "{name}");
    }
    // Six files were patched before the failure.
    assert_eq!(result.changes[0].modifications.len(), 6);
}

#[test]
fn test_failure_without_rollback_leaves_partial_edits() {
    let dir = setup_workspace(&[("a.c", "one\ntwo\n")]);
    write_file(dir.path(), "b.c", NOT_UTF8);
    let mut config = EngineConfig::default();
    config.safety.automatic_rollback_on_failure = false;
    let engine = PatchEngine::new(config);

    let result = engine
        .apply(&defect(&["a.c", "b.c"], "ONE", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Failed);
    assert_eq!(result.final_phase, Phase::Failed);
    assert!(result.rollback.is_none());
    assert_eq!(read(dir.path(), "a.c"), "ONE\ntwo\n");
    assert!(result.warnings.iter().any(|w| w.contains("left modified")));
}

#[test]
fn test_dry_run_estimates_without_writing() {
    let dir = setup_workspace(&[("main.c", "a\nb\nc\n")]);
    let mut config = EngineConfig::default();
    config.safety.dry_run = true;
    let engine = PatchEngine::new(config);

    let result = engine
        .apply(
            &defect(&["main.c"], "x\ny\nz", vec![LineRange::line(2)], 0.9),
            dir.path(),
        )
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert!(result.dry_run);
    let modification = &result.changes[0].modifications[0];
    assert_eq!(modification.lines_added, 3);
    assert_eq!(modification.lines_removed, 1);
    assert!(!modification.written);
    assert_eq!(read(dir.path(), "main.c"), "a\nb\nc\n");
    // Backup still runs in dry-run mode.
    assert!(result.backup_manifest().is_some());
}

#[test]
fn test_vcs_checkout_and_changelist() {
    let dir = setup_workspace(&[("main.c", "a\nb\n")]);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("alice-ws"));
    let engine = engine_with(config, &vcs);

    let mut input = defect(&["main.c"], "X", vec![LineRange::line(1)], 0.9);
    input.category = Some("NULL_RETURNS".to_string());
    let result = engine.apply(&input, dir.path()).unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    let target = dir.path().join("main.c");
    let calls = vcs.calls();
    assert_eq!(calls[0], VcsCall::ValidateWorkspace(target.clone()));
    assert_eq!(calls[1], VcsCall::Checkout(vec![target.clone()]));
    match &calls[2] {
        VcsCall::CreateChangelist(description, files) => {
            assert!(description.starts_with("Automated fix: CID-1001 (NULL_RETURNS)"));
            assert!(description.contains("Guard against null dereference"));
            assert_eq!(files, &vec![target.clone()]);
        }
        other => panic!("unexpected call {other:?}"),
    }

    let change = &result.changes[0];
    assert_eq!(change.changelist, Some(1000));
    assert_eq!(change.checked_out_files, vec![target.clone()]);
    assert_eq!(
        result.workspace.as_ref().unwrap().client_name.as_deref(),
        Some("alice-ws")
    );
    assert_eq!(vcs.opened_files(), vec![target]);
}

#[test]
fn test_vcs_revert_on_apply_failure() {
    let dir = setup_workspace(&[("a.c", "a\n")]);
    write_file(dir.path(), "b.c", NOT_UTF8);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws"));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["a.c", "b.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::RolledBack);
    assert_eq!(read(dir.path(), "a.c"), "a\n");
    assert!(vcs.opened_files().is_empty());
    assert!(vcs.changelists().is_empty());
    assert_eq!(result.rollback.as_ref().unwrap().reverted.len(), 2);
}

#[test]
fn test_optional_checkout_failure_is_a_warning() {
    let dir = setup_workspace(&[("main.c", "a\n")]);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        checkout: true,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(read(dir.path(), "main.c"), "X\n");
    assert!(result.warnings.iter().any(|w| w.contains("checkout failed")));
    // Nothing was opened, so no changelist either.
    assert!(vcs.changelists().is_empty());
    assert!(!result.changes[0].vcs_operations[0].success);
}

#[test]
fn test_optional_partial_checkout_is_released() {
    let dir = setup_workspace(&[("a.c", "a\n"), ("b.c", "b\n")]);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        checkout: true,
        checkout_opens: 1,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["a.c", "b.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(read(dir.path(), "a.c"), "X\n");
    assert!(vcs.opened_files().is_empty());
    assert!(vcs.changelists().is_empty());
    let operations = &result.changes[0].vcs_operations;
    assert_eq!(operations[1].operation, "revert");
    assert!(operations[1].success);
}

#[test]
fn test_optional_partial_checkout_is_released_before_rollback() {
    let dir = setup_workspace(&[("a.c", "a\n")]);
    write_file(dir.path(), "b.c", NOT_UTF8);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        checkout: true,
        checkout_opens: 1,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["a.c", "b.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::RolledBack);
    assert_eq!(read(dir.path(), "a.c"), "a\n");
    assert!(vcs.opened_files().is_empty());
}

#[test]
fn test_unreleased_partial_checkout_is_reverted_by_rollback() {
    let dir = setup_workspace(&[("a.c", "a\n")]);
    write_file(dir.path(), "b.c", NOT_UTF8);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        checkout: true,
        checkout_opens: 1,
        revert: true,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let err = engine
        .apply(&defect(&["a.c", "b.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap_err();

    // The files stay recorded, so the rollback retries the revert and reports it.
    let EngineError::RollbackFailed { result, .. } = &err;
    assert_eq!(result.changes[0].checked_out_files.len(), 2);
    assert_eq!(read(dir.path(), "a.c"), "a\n");
    let reverts = vcs
        .calls()
        .into_iter()
        .filter(|call| matches!(call, VcsCall::Revert(_)))
        .count();
    assert!(reverts >= 2);
}

#[test]
fn test_required_checkout_failure_stops_before_apply() {
    let dir = setup_workspace(&[("main.c", "a\n")]);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    config.vcs.require_checkout = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        checkout: true,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::RolledBack);
    assert_eq!(read(dir.path(), "main.c"), "a\n");
    assert!(result.changes[0].modifications.is_empty());
}

#[test]
fn test_changelist_failure_does_not_roll_back() {
    let dir = setup_workspace(&[("main.c", "a\n")]);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        changelist: true,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(read(dir.path(), "main.c"), "X\n");
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("changelist creation failed")));
}

#[test]
fn test_rollback_failure_is_surfaced() {
    let dir = setup_workspace(&[("a.c", "a\n")]);
    write_file(dir.path(), "b.c", NOT_UTF8);
    let mut config = EngineConfig::default();
    config.vcs.enabled = true;
    let vcs = Rc::new(InMemoryVcs::new("ws").with_failures(FailureInjection {
        revert: true,
        ..FailureInjection::default()
    }));
    let engine = engine_with(config, &vcs);

    let err = engine
        .apply(&defect(&["a.c", "b.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap_err();

    let EngineError::RollbackFailed { source, result } = err;
    assert!(!source.report.failures.is_empty());
    assert_eq!(result.status, ChangeStatus::Failed);
    assert!(result.errors.iter().any(|e| e.contains("manual intervention")));
    // Restoring the bytes still happened.
    assert_eq!(read(dir.path(), "a.c"), "a\n");
}

#[test]
fn test_manual_rollback_from_audit_record() {
    let dir = setup_workspace(&[("a.c", "a\nb\n"), ("b.c", "c\nd\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(&defect(&["a.c", "b.c"], "Z", vec![LineRange::line(2)], 0.9), dir.path())
        .unwrap();
    assert_eq!(read(dir.path(), "a.c"), "a\nZ\n");

    let record = result
        .backup_manifest()
        .unwrap()
        .backup_dir
        .join(AUDIT_RECORD_FILE_NAME);
    let recorded = ApplicationResult::load(&record).unwrap();
    assert_eq!(recorded.patch_id, result.patch_id);

    let report = engine.rollback(&recorded, dir.path()).unwrap();
    assert_eq!(report.restored.len(), 2);
    assert_eq!(read(dir.path(), "a.c"), "a\nb\n");
    assert_eq!(read(dir.path(), "b.c"), "c\nd\n");
}

#[test]
fn test_cleanup_on_success_removes_backup() {
    let dir = setup_workspace(&[("main.c", "a\n")]);
    let mut config = EngineConfig::default();
    config.backup.cleanup_on_success = true;
    let engine = PatchEngine::new(config);

    let result = engine
        .apply(&defect(&["main.c"], "X", vec![LineRange::line(1)], 0.9), dir.path())
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert!(!result.backup_manifest().unwrap().backup_dir.exists());
}

#[test]
fn test_out_of_range_lines_are_skipped() {
    let dir = setup_workspace(&[("main.c", "a\nb\nc\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(
            &defect(
                &["main.c"],
                "X\nY",
                vec![LineRange::line(1), LineRange::new(7, 9)],
                0.9,
            ),
            dir.path(),
        )
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Success);
    assert_eq!(result.changes[0].modifications[0].ranges_skipped.len(), 1);
    assert!(result.warnings.iter().any(|w| w.contains("will be skipped")));
    assert_eq!(read(dir.path(), "main.c"), "X\nb\nc\n");
}

#[test]
fn test_backups_are_refused_as_targets() {
    let dir = setup_workspace(&[("main.c", "a\n"), (".defect-patcher/backups/old.c", "x\n")]);
    let engine = PatchEngine::new(EngineConfig::default());

    let result = engine
        .apply(
            &defect(&[".defect-patcher/backups/old.c"], "X", vec![LineRange::line(1)], 0.9),
            dir.path(),
        )
        .unwrap();

    assert_eq!(result.status, ChangeStatus::Failed);
    assert_eq!(read(dir.path(), ".defect-patcher/backups/old.c"), "x\n");
}
