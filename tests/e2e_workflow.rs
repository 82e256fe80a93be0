//! End-to-end workflow test
//!
//! Tests the complete workflow:
//! 1. Load a batch of analysis results and a TOML config
//! 2. Apply every defect
//! 3. Inspect the backups left behind
//! 4. Roll the batch back and check the tree is restored

use defect_patcher::backup::load_manifest;
use defect_patcher::model::load_analysis_from_path;
use defect_patcher::{load_from_path, BackupStore, ChangeStatus, PatchEngine, Phase};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PARSER_C: &str = "static int parse(const char *s) {\n    int n = atoi(s);\n    return n;\n}\n";
const IO_C: &str = "void close_all(FILE *f) {\r\n    fclose(f);\r\n}\r\n";

/// Create a small C tree, a batch of two defects, and a config file
fn setup_e2e_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();

    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/parser.c"), PARSER_C).unwrap();
    fs::write(dir.path().join("src/io.c"), IO_C).unwrap();

    let batch = serde_json::json!([
        {
            "defect_id": "CID-100",
            "file_path": "src/parser.c",
            "line_number": 2,
            "category": "TAINTED_SCALAR",
            "fix_candidates": [{
                "fix_text": "    long n = strtol(s, NULL, 10);",
                "affected_files": ["src/parser.c"],
                "line_ranges": [{"start": 2, "end": 2}],
                "confidence_score": 0.92,
                "description": "Use strtol"
            }]
        },
        {
            "defect_id": "CID-101",
            "file_path": "src/io.c",
            "line_number": 2,
            "fix_candidates": [
                {
                    "fix_text": "    /* ignored */",
                    "affected_files": ["src/io.c"],
                    "line_ranges": [{"start": 2, "end": 2}],
                    "confidence_score": 0.55
                },
                {
                    "fix_text": "    if (f != NULL)\n        fclose(f);",
                    "affected_files": ["src/io.c"],
                    "line_ranges": [{"start": 2, "end": 2}],
                    "confidence_score": 0.85
                }
            ],
            "recommended_fix_index": 1
        }
    ]);
    fs::write(
        dir.path().join("defects.json"),
        serde_json::to_string_pretty(&batch).unwrap(),
    )
    .unwrap();

    fs::write(
        dir.path().join("patcher.toml"),
        r#"
[validation]
auto_apply_threshold = 0.8

[backup]
backup_dir = "out/backups"
"#,
    )
    .unwrap();

    dir
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

#[test]
fn test_e2e_apply_inspect_rollback() {
    let workspace = setup_e2e_workspace();
    let root = workspace.path();

    let config = load_from_path(root.join("patcher.toml")).unwrap();
    let engine = PatchEngine::new(config.clone());
    let defects = load_analysis_from_path(root.join("defects.json")).unwrap();
    assert_eq!(defects.len(), 2);

    // Step 1: validate everything up front
    for defect in &defects {
        let report = engine.validate(defect, root);
        assert!(report.is_valid, "{}: {:?}", defect.defect_id, report.issues);
        assert_eq!(report.files_to_modify.len(), 1);
    }

    // Step 2: apply
    let results: Vec<_> = defects
        .iter()
        .map(|defect| engine.apply(defect, root).unwrap())
        .collect();

    for result in &results {
        assert_eq!(result.status, ChangeStatus::Success, "{:?}", result.errors);
        assert_eq!(result.final_phase, Phase::Done);
        assert!(result.errors.is_empty());
    }
    assert_eq!(results[1].patch_id, "CID-101-c1");

    assert_eq!(
        read(root, "src/parser.c"),
        "static int parse(const char *s) {\n    long n = strtol(s, NULL, 10);\n    return n;\n}\n"
    );
    // CRLF files keep their line endings, including inside the inserted text
    assert_eq!(
        read(root, "src/io.c"),
        "void close_all(FILE *f) {\r\n    if (f != NULL)\r\n        fclose(f);\r\n}\r\n"
    );

    // Step 3: one backup per defect under the configured root
    let store = BackupStore::new(&config.backup, root);
    assert_eq!(store.root(), root.join("out/backups"));
    let manifests = store.list_manifests();
    assert_eq!(manifests.len(), 2);

    for path in &manifests {
        let manifest = load_manifest(path).unwrap();
        assert_eq!(manifest.total_files, 1);
        assert!(manifest.backup_dir.join("result.json").is_file());
    }

    // Step 4: roll back in reverse order
    for result in results.iter().rev() {
        let report = engine.rollback(result, root).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored.len(), 1);
    }

    assert_eq!(read(root, "src/parser.c"), PARSER_C);
    assert_eq!(read(root, "src/io.c"), IO_C);
}

#[test]
fn test_e2e_reapply_after_rollback_is_stable() {
    let workspace = setup_e2e_workspace();
    let root = workspace.path();

    let engine = PatchEngine::new(load_from_path(root.join("patcher.toml")).unwrap());
    let defects = load_analysis_from_path(root.join("defects.json")).unwrap();
    let parser = &defects[0];

    let first = engine.apply(parser, root).unwrap();
    let patched = read(root, "src/parser.c");
    engine.rollback(&first, root).unwrap();
    assert_eq!(read(root, "src/parser.c"), PARSER_C);

    let second = engine.apply(parser, root).unwrap();
    assert_eq!(second.status, ChangeStatus::Success);
    assert_eq!(read(root, "src/parser.c"), patched);
    assert_ne!(
        first.backup_manifest().unwrap().backup_dir,
        second.backup_manifest().unwrap().backup_dir
    );
}

#[test]
fn test_e2e_dry_run_batch_changes_nothing() {
    let workspace = setup_e2e_workspace();
    let root = workspace.path();

    let mut config = load_from_path(root.join("patcher.toml")).unwrap();
    config.safety.dry_run = true;
    let engine = PatchEngine::new(config);

    for defect in load_analysis_from_path(root.join("defects.json")).unwrap() {
        let result = engine.apply(&defect, root).unwrap();
        assert!(result.dry_run);
        assert_eq!(result.status, ChangeStatus::Success);
        let change = &result.changes[0];
        assert!(change.modifications.iter().all(|m| !m.written));
        assert!(change.lines_added() > 0);
    }

    assert_eq!(read(root, "src/parser.c"), PARSER_C);
    assert_eq!(read(root, "src/io.c"), IO_C);
}
