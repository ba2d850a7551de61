//! Batch mutation-test runner.
//!
//! The controller commands (`init`, `dedupe`, `prepare`, `process-results`)
//! own `.mutation/catalog.json`; worker commands (`get-next`, `update`,
//! `terminate`) only touch their own Plan File and the shared Execution Log.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use mutation_runner::coordinate::{Coordinator, UpdateOutcome};
use mutation_runner::exit_codes;
use mutation_runner::io::clock::SystemClock;
use mutation_runner::io::config::{RunConfig, load_config};
use mutation_runner::io::exec_log::FileLog;
use mutation_runner::io::init::{InitOptions, RunPaths, init_run};
use mutation_runner::logging;
use mutation_runner::prepare::{PrepareOutcome, prepare_batch, run_dedupe};
use mutation_runner::results::{ResultsOutcome, process_results};
use mutation_runner::status::batch_status;
use mutation_runner::validate::validate_run;

#[derive(Parser)]
#[command(
    name = "mutation-runner",
    version,
    about = "Batch mutation testing against a remote-protocol server"
)]
struct Cli {
    /// Project root containing `.mutation/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.mutation/` with a default config and an empty catalog.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Recompute dedupe markers in the catalog.
    Dedupe,
    /// Plan the next batch into per-worker Plan Files.
    Prepare,
    /// Hand the next operation to the worker on PORT.
    GetNext {
        #[arg(long)]
        port: u16,
    },
    /// Record the response for the worker's outstanding operation.
    Update {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        tool_name: String,
        /// JSON response, or `-` to read it from stdin.
        #[arg(long)]
        response: String,
    },
    /// Hard-terminate the worker on PORT.
    Terminate {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show per-worker progress of the current batch.
    Status,
    /// Fold the batch results into the catalog.
    ProcessResults {
        /// Process even while workers are still active.
        #[arg(long)]
        force: bool,
    },
    /// Check config, catalog markers and every Plan File.
    Validate,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Dedupe => cmd_dedupe(root),
        Command::Prepare => cmd_prepare(root),
        Command::GetNext { port } => cmd_get_next(root, port),
        Command::Update {
            port,
            tool_name,
            response,
        } => cmd_update(root, port, &tool_name, &response),
        Command::Terminate { port, reason } => cmd_terminate(root, port, reason),
        Command::Status => cmd_status(root),
        Command::ProcessResults { force } => cmd_process_results(root, force),
        Command::Validate => cmd_validate(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_run(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_dedupe(root: &Path) -> Result<i32> {
    let report = run_dedupe(root)?;
    println!(
        "dedupe: {} representatives, {} duplicates, {} children of duplicates",
        report.representatives, report.duplicates, report.children_of_duplicates
    );
    Ok(exit_codes::OK)
}

fn cmd_prepare(root: &Path) -> Result<i32> {
    let report = prepare_batch(root, &SystemClock)?;
    if !report.auto_passed.is_empty() {
        println!("auto-passed: {}", report.auto_passed.join(", "));
    }
    match report.outcome {
        PrepareOutcome::NothingToTest => {
            println!("nothing to test");
            Ok(exit_codes::NOTHING_TO_TEST)
        }
        PrepareOutcome::Prepared(batch) => {
            println!(
                "batch {}: {} types, {} deferred",
                batch.batch_number,
                batch.types.len(),
                batch.deferred
            );
            for packet in &batch.packets {
                println!(
                    "  port {}: {} parts, {} operations",
                    packet.port, packet.parts, packet.operations
                );
            }
            Ok(exit_codes::OK)
        }
    }
}

fn coordinator_inputs(root: &Path) -> Result<(RunPaths, RunConfig, FileLog)> {
    let paths = RunPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let log = FileLog::new(&paths.log_path);
    Ok((paths, config, log))
}

fn cmd_get_next(root: &Path, port: u16) -> Result<i32> {
    let (paths, config, log) = coordinator_inputs(root)?;
    let coordinator = Coordinator::new(paths, config, &log, &SystemClock)?;
    let response = coordinator.get_next(port)?;
    println!(
        "{}",
        serde_json::to_string(&response).context("serialize get-next response")?
    );
    Ok(exit_codes::OK)
}

fn read_response(raw: &str) -> Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read response from stdin")?;
        buf
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).context("parse response json")
}

fn cmd_update(root: &Path, port: u16, tool_name: &str, raw: &str) -> Result<i32> {
    let response = read_response(raw)?;
    let (paths, config, log) = coordinator_inputs(root)?;
    let coordinator = Coordinator::new(paths, config, &log, &SystemClock)?;
    match coordinator.update(port, tool_name, &response)? {
        UpdateOutcome::Recorded {
            operation_id,
            status,
            error: None,
        } => println!("op {operation_id}: {}", status.label()),
        UpdateOutcome::Recorded {
            operation_id,
            status,
            error: Some(error),
        } => println!("op {operation_id}: {} ({error})", status.label()),
        UpdateOutcome::Ignored { reason } => println!("ignored: {reason}"),
    }
    Ok(exit_codes::OK)
}

fn cmd_terminate(root: &Path, port: u16, reason: Option<String>) -> Result<i32> {
    let (paths, config, log) = coordinator_inputs(root)?;
    let coordinator = Coordinator::new(paths, config, &log, &SystemClock)?;
    if coordinator.terminate(port, reason)? {
        println!("port {port} terminated");
    } else {
        println!("port {port} already done");
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = RunPaths::new(root);
    let report = batch_status(&FileLog::new(&paths.log_path))?;
    println!("{report}");
    Ok(exit_codes::OK)
}

fn cmd_process_results(root: &Path, force: bool) -> Result<i32> {
    let paths = RunPaths::new(root);
    let log = FileLog::new(&paths.log_path);
    match process_results(root, &log, &SystemClock, force)? {
        ResultsOutcome::NothingToProcess => {
            println!("no open batch");
            Ok(exit_codes::NOTHING_TO_TEST)
        }
        ResultsOutcome::Processed(summary) => {
            println!(
                "batch {}: {} passed, {} auto-retry, {} needs review, {} not started",
                summary.batch_number,
                summary.passed,
                summary.auto_retried,
                summary.needs_review,
                summary.not_started
            );
            for name in &summary.needs_review_types {
                println!("  needs review: {name}");
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_run(root)?;
    println!("ok: {} types, {} plan files", outcome.types, outcome.plans);
    Ok(exit_codes::OK)
}
