use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use defect_patcher::backup::{load_manifest, BackupStore};
use defect_patcher::config::{self, EngineConfig};
use defect_patcher::edit::LineEdit;
use defect_patcher::engine::{ApplicationResult, ChangeStatus, EngineError, PatchEngine};
use defect_patcher::logging;
use defect_patcher::model::{load_analysis_from_path, AnalysisResult};
use defect_patcher::rollback::{RollbackCoordinator, RollbackError, RollbackReport};
use defect_patcher::validate::Severity;
use similar::{ChangeTag, TextDiff};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_ROLLED_BACK: u8 = 3;
const EXIT_ROLLBACK_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "defect-patcher")]
#[command(about = "Apply static-analysis fixes with checksummed backups and rollback", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the recommended fix of each analysis result
    Apply {
        /// Analysis result files (one object or an array per file)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Working directory the fixes refer to (defaults to the current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Validate and back up, but only simulate the edits
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Override the backup directory
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Configuration file (defaults to <workdir>/.defect-patcher.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Leave partial edits on disk when an apply fails
        #[arg(long)]
        no_rollback: bool,
    },

    /// Check fixes against the working tree without touching it
    Validate {
        input: PathBuf,

        #[arg(short, long)]
        workdir: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Undo a previous run from its audit record or a backup manifest
    Rollback {
        /// Audit record (result.json) written by a previous run
        #[arg(long, conflicts_with = "manifest", required_unless_present = "manifest")]
        result: Option<PathBuf>,

        /// Backup manifest (manifest.json) to restore from
        #[arg(long)]
        manifest: Option<PathBuf>,

        #[arg(short, long)]
        workdir: Option<PathBuf>,
    },

    /// List backups under the backup directory
    Backups {
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Delete the backup a manifest describes
    Cleanup { manifest: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json, logging::level_for_verbosity(cli.verbose));

    let outcome = match cli.command {
        Commands::Apply {
            inputs,
            workdir,
            dry_run,
            backup_dir,
            config,
            diff,
            json,
            no_rollback,
        } => cmd_apply(ApplyArgs {
            inputs,
            workdir,
            dry_run,
            backup_dir,
            config,
            show_diff: diff,
            json,
            no_rollback,
        }),

        Commands::Validate {
            input,
            workdir,
            config,
        } => cmd_validate(&input, workdir, config),

        Commands::Rollback {
            result,
            manifest,
            workdir,
        } => cmd_rollback(result, manifest, workdir),

        Commands::Backups {
            workdir,
            backup_dir,
        } => cmd_backups(workdir, backup_dir),

        Commands::Cleanup { manifest } => cmd_cleanup(&manifest),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

/// Helper: Resolve the working directory (explicit flag or current directory).
fn resolve_workdir(workdir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match workdir {
        Some(dir) => dir,
        None => env::current_dir().context("cannot determine current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("working directory {} not found", dir.display()))
}

fn load_config(path: Option<&Path>, workdir: &Path) -> Result<EngineConfig> {
    config::discover(path, workdir).context("failed to load configuration")
}

fn load_inputs(inputs: &[PathBuf]) -> Result<Vec<AnalysisResult>> {
    let mut all = Vec::new();
    for input in inputs {
        let results = load_analysis_from_path(input)
            .with_context(|| format!("failed to load {}", input.display()))?;
        all.extend(results);
    }
    Ok(all)
}

fn exit_code_for(status: ChangeStatus) -> u8 {
    match status {
        ChangeStatus::Success => EXIT_SUCCESS,
        ChangeStatus::Failed => EXIT_FAILED,
        ChangeStatus::Partial => EXIT_PARTIAL,
        ChangeStatus::RolledBack => EXIT_ROLLED_BACK,
    }
}

fn status_label(status: ChangeStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        ChangeStatus::Success => label.green().bold(),
        ChangeStatus::Partial => label.yellow().bold(),
        ChangeStatus::Failed => label.red().bold(),
        ChangeStatus::RolledBack => label.cyan().bold(),
    }
}

/// Helper: Show unified diff between original and modified content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

/// Diff every file a run touched (or would touch, for dry runs).
fn show_result_diff(analysis: &AnalysisResult, result: &ApplicationResult) {
    let Some(candidate) = analysis.recommended() else {
        return;
    };
    for change in &result.changes {
        for modification in &change.modifications {
            let file = &modification.file;
            let texts = if result.dry_run {
                LineEdit::new(file, &candidate.fix_text, candidate.line_ranges.clone())
                    .preview()
                    .ok()
            } else {
                // The backup holds the pre-patch bytes.
                change
                    .backup_manifest
                    .as_ref()
                    .and_then(|m| m.entries.iter().find(|e| &e.original_path == file))
                    .and_then(|entry| fs::read_to_string(&entry.backup_path).ok())
                    .zip(fs::read_to_string(file).ok())
            };
            match texts {
                Some((before, after)) if before != after => display_diff(file, &before, &after),
                Some(_) => {}
                None => eprintln!("  {}", format!("(no diff available for {})", file.display()).dimmed()),
            }
        }
    }
}

fn print_result(result: &ApplicationResult) {
    let mode = if result.dry_run { " [DRY RUN]".cyan().to_string() } else { String::new() };
    println!(
        "{} {}{} ({}, {} ms)",
        status_label(result.status),
        result.defect_id,
        mode,
        result.final_phase,
        result.duration_ms
    );

    for change in &result.changes {
        for m in &change.modifications {
            let verb = if m.written { "patched" } else { "would patch" };
            println!(
                "  {} {} {}: +{} -{}",
                "✓".green(),
                verb,
                m.file.display(),
                m.lines_added,
                m.lines_removed
            );
        }
        if let Some(manifest) = &change.backup_manifest {
            println!(
                "  {}",
                format!("backup: {}", manifest.manifest_path().display()).dimmed()
            );
        }
        if let Some(id) = change.changelist {
            println!("  changelist {}", id);
        }
    }

    for warning in &result.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    for error in &result.errors {
        eprintln!("  {} {}", "✗".red(), error);
    }
    if let Some(report) = &result.rollback {
        print_rollback_report(report);
    }
}

fn print_rollback_report(report: &RollbackReport) {
    println!(
        "  {} restored {} file(s), reverted {}",
        "↺".cyan(),
        report.restored.len(),
        report.reverted.len()
    );
    for path in &report.checksum_mismatches {
        println!(
            "  {} checksum mismatch on restore: {}",
            "⚠".yellow(),
            path.display()
        );
    }
    for failure in &report.failures {
        eprintln!("  {} {}", "✗".red(), failure);
    }
}

struct ApplyArgs {
    inputs: Vec<PathBuf>,
    workdir: Option<PathBuf>,
    dry_run: bool,
    backup_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    show_diff: bool,
    json: bool,
    no_rollback: bool,
}

fn cmd_apply(args: ApplyArgs) -> Result<u8> {
    let workdir = resolve_workdir(args.workdir)?;
    let mut config = load_config(args.config.as_deref(), &workdir)?;
    config.safety.dry_run |= args.dry_run;
    if let Some(dir) = args.backup_dir {
        config.backup.backup_dir = dir;
    }
    if args.no_rollback {
        config.safety.automatic_rollback_on_failure = false;
    }
    config.validate().context("invalid configuration")?;

    let analyses = load_inputs(&args.inputs)?;
    let engine = PatchEngine::new(config);

    if !args.json {
        println!("Working directory: {}", workdir.display());
        if engine.config().safety.dry_run {
            println!("{}", "[DRY RUN - edits are simulated, backups are real]".cyan());
        }
        println!();
    }

    let mut results = Vec::with_capacity(analyses.len());
    let mut rollback_failed = false;

    for analysis in &analyses {
        let result = match engine.apply(analysis, &workdir) {
            Ok(result) => result,
            Err(EngineError::RollbackFailed { source, result }) => {
                rollback_failed = true;
                eprintln!(
                    "{} {}: {}",
                    "ROLLBACK FAILED".red().bold(),
                    result.defect_id,
                    source
                );
                eprintln!(
                    "  {}",
                    "The working tree may be inconsistent. Inspect the files below manually.".red()
                );
                *result
            }
        };

        if !args.json {
            print_result(&result);
            if args.show_diff {
                show_result_diff(analysis, &result);
            }
            println!();
        }
        results.push(result);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        let count = |status: ChangeStatus| results.iter().filter(|r| r.status == status).count();
        println!("{}", "Summary:".bold());
        println!("  {} succeeded", format!("{}", count(ChangeStatus::Success)).green());
        println!("  {} partial", format!("{}", count(ChangeStatus::Partial)).yellow());
        println!("  {} rolled back", format!("{}", count(ChangeStatus::RolledBack)).cyan());
        println!("  {} failed", format!("{}", count(ChangeStatus::Failed)).red());
    }

    if rollback_failed {
        return Ok(EXIT_ROLLBACK_FAILED);
    }
    Ok(exit_code_for(ChangeStatus::derive(
        results.iter().map(|r| &r.status),
    )))
}

fn cmd_validate(input: &Path, workdir: Option<PathBuf>, config: Option<PathBuf>) -> Result<u8> {
    let workdir = resolve_workdir(workdir)?;
    let engine = PatchEngine::new(load_config(config.as_deref(), &workdir)?);
    let analyses = load_inputs(&[input.to_path_buf()])?;

    let mut all_valid = true;
    for analysis in &analyses {
        let report = engine.validate(analysis, &workdir);
        all_valid &= report.is_valid;

        let verdict = if report.is_valid {
            "VALID".green().bold()
        } else {
            "INVALID".red().bold()
        };
        println!("{} {}", verdict, analysis.defect_id);
        for issue in &report.issues {
            let marker = match issue.severity {
                Severity::Error => "✗".red(),
                Severity::Warning => "⚠".yellow(),
                Severity::Info => "·".dimmed(),
            };
            println!("  {} {}", marker, issue);
        }
        for file in &report.files_to_modify {
            println!("  {}", format!("target: {}", file.display()).dimmed());
        }
    }

    Ok(if all_valid { EXIT_SUCCESS } else { EXIT_FAILED })
}

fn cmd_rollback(
    result: Option<PathBuf>,
    manifest: Option<PathBuf>,
    workdir: Option<PathBuf>,
) -> Result<u8> {
    let workdir = resolve_workdir(workdir)?;
    let engine = PatchEngine::new(load_config(None, &workdir)?);

    let outcome: Result<RollbackReport, RollbackError> = match (result, manifest) {
        (Some(path), _) => {
            let recorded = ApplicationResult::load(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            println!("Rolling back {} ({})", recorded.patch_id, recorded.status);
            engine.rollback(&recorded, &workdir)
        }
        (None, Some(path)) => {
            let manifest = load_manifest(&path)?;
            println!(
                "Restoring {} file(s) from {}",
                manifest.total_files,
                manifest.backup_dir.display()
            );
            let store = engine.backup_store(&workdir);
            RollbackCoordinator::new(&store, engine.vcs()).rollback(Some(&manifest), &[], &[])
        }
        (None, None) => anyhow::bail!("either --result or --manifest is required"),
    };

    match outcome {
        Ok(report) => {
            print_rollback_report(&report);
            println!("{}", "Rollback complete".green().bold());
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            print_rollback_report(&err.report);
            eprintln!("{} {}", "ROLLBACK FAILED".red().bold(), err);
            Ok(EXIT_ROLLBACK_FAILED)
        }
    }
}

fn cmd_backups(workdir: Option<PathBuf>, backup_dir: Option<PathBuf>) -> Result<u8> {
    let workdir = resolve_workdir(workdir)?;
    let mut config = load_config(None, &workdir)?;
    if let Some(dir) = backup_dir {
        config.backup.backup_dir = dir;
    }
    let store = BackupStore::new(&config.backup, &workdir);

    let manifests = store.list_manifests();
    if manifests.is_empty() {
        println!("{}", format!("No backups under {}", store.root().display()).yellow());
        return Ok(EXIT_SUCCESS);
    }

    println!("{}", format!("Backups under {}", store.root().display()).bold());
    for path in manifests {
        match load_manifest(&path) {
            Ok(manifest) => println!(
                "  {} {} file(s), {} bytes, {}  {}",
                manifest.patch_id.bold(),
                manifest.total_files,
                manifest.total_bytes,
                manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                path.display().to_string().dimmed()
            ),
            Err(e) => eprintln!("  {} {}", "✗".red(), e),
        }
    }
    Ok(EXIT_SUCCESS)
}

fn cmd_cleanup(manifest_path: &Path) -> Result<u8> {
    let manifest = load_manifest(manifest_path)?;
    let parent = manifest.backup_dir.parent().unwrap_or(manifest.backup_dir.as_path());
    let store = BackupStore::new(&config::BackupConfig::default(), parent);

    if store.cleanup(&manifest)? {
        println!("{} removed {}", "✓".green(), manifest.backup_dir.display());
    } else {
        println!(
            "{}",
            format!("{} was already gone", manifest.backup_dir.display()).yellow()
        );
    }
    Ok(EXIT_SUCCESS)
}
