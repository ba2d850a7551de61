//! Orchestration for `mutation-runner prepare` and `mutation-runner dedupe`.
//!
//! Everything is computed in memory first; files are only touched once the
//! batch is known to be valid.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::core::dedupe::{DedupeReport, dedupe_catalog, validate_dedupe};
use crate::core::log_event::{LogHeader, LogState};
use crate::core::operation::WorkPacket;
use crate::core::packing::{plan_packets, select_batch};
use crate::core::types::{Catalog, TestStatus, TypeRecord};
use crate::io::catalog_store::{load_catalog, write_catalog};
use crate::io::clock::Clock;
use crate::io::config::load_config;
use crate::io::exec_log::{ExecutionLog, FileLog};
use crate::io::init::RunPaths;
use crate::io::plan_store::{clear_plans, write_plan};

/// Per-packet line of the prepare report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSummary {
    pub port: u16,
    pub parts: usize,
    pub operations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatch {
    pub batch_number: u32,
    pub types: Vec<String>,
    pub packets: Vec<PacketSummary>,
    /// Untested types left for a later batch.
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    Prepared(PreparedBatch),
    /// Every type already has a verdict.
    NothingToTest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareReport {
    pub dedupe: DedupeReport,
    pub auto_passed: Vec<String>,
    pub outcome: PrepareOutcome,
}

/// Run the dedupe pre-pass and fail on any inconsistent marker.
pub fn dedupe_and_validate(catalog: &mut Catalog) -> Result<DedupeReport> {
    let report = dedupe_catalog(&mut catalog.type_guide);
    let errors = validate_dedupe(&catalog.type_guide);
    if !errors.is_empty() {
        bail!("dedupe validation failed:\n- {}", errors.join("\n- "));
    }
    Ok(report)
}

/// `dedupe` command: recompute markers and persist them.
#[instrument(skip_all)]
pub fn run_dedupe(root: &Path) -> Result<DedupeReport> {
    let paths = RunPaths::new(root);
    load_config(&paths.config_path)?;
    let mut catalog = load_catalog(&paths.catalog_path)?;
    let report = dedupe_and_validate(&mut catalog)?;
    write_catalog(&paths.catalog_path, &catalog)?;
    info!(
        representatives = report.representatives,
        duplicates = report.duplicates,
        "dedupe markers written"
    );
    Ok(report)
}

/// Mark untested types with nothing to exercise as passed.
fn auto_pass(catalog: &mut Catalog, empty_sequences: &[String]) -> Vec<String> {
    let mut passed = Vec::new();
    for record in catalog.type_guide.values_mut() {
        if record.test_status != TestStatus::Untested || record.batch_number.is_some() {
            continue;
        }
        if record.auto_passes() || empty_sequences.contains(&record.type_name) {
            record.test_status = TestStatus::Passed;
            record.fail_reason = None;
            passed.push(record.type_name.clone());
        }
    }
    passed
}

fn ensure_no_open_batch(catalog: &Catalog) -> Result<()> {
    let open: Vec<&str> = catalog
        .type_guide
        .values()
        .filter(|record| record.batch_number.is_some())
        .map(|record| record.type_name.as_str())
        .collect();
    if open.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "{} type(s) still assigned to batch {} (run process-results first): {}",
        open.len(),
        catalog.last_batch_number,
        open.join(", ")
    ))
}

/// `prepare` command: select, plan and publish the next batch.
#[instrument(skip_all)]
pub fn prepare_batch(root: &Path, clock: &dyn Clock) -> Result<PrepareReport> {
    let paths = RunPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let limits = config.packing_limits();
    let mut catalog = load_catalog(&paths.catalog_path)?;
    ensure_no_open_batch(&catalog)?;

    let dedupe = dedupe_and_validate(&mut catalog)?;

    let probe = select_batch(
        catalog
            .type_guide
            .values()
            .filter(|record| record.test_status == TestStatus::Untested),
        &limits,
    );
    let auto_passed = auto_pass(&mut catalog, &probe.empty);

    let untested = catalog
        .type_guide
        .values()
        .filter(|record| record.test_status == TestStatus::Untested);
    let selection = select_batch(untested, &limits);
    if !selection.oversized.is_empty() {
        let named: Vec<String> = selection
            .oversized
            .iter()
            .map(|(name, parts)| format!("{name} needs {parts} parts"))
            .collect();
        bail!(
            "types exceed batch capacity of {} parts, raise max_workers: {}",
            limits.capacity(),
            named.join("; ")
        );
    }

    if selection.selected.is_empty() {
        catalog.refresh_counts();
        write_catalog(&paths.catalog_path, &catalog)?;
        info!(auto_passed = auto_passed.len(), "nothing left to test");
        return Ok(PrepareReport {
            dedupe,
            auto_passed,
            outcome: PrepareOutcome::NothingToTest,
        });
    }

    let batch_number = catalog.last_batch_number + 1;
    let records: Vec<&TypeRecord> = selection
        .selected
        .iter()
        .filter_map(|name| catalog.type_guide.get(name))
        .collect();
    let packets = plan_packets(&records, batch_number, &limits).map_err(|err| anyhow!(err))?;
    let deferred = catalog
        .type_guide
        .values()
        .filter(|record| record.test_status == TestStatus::Untested)
        .count()
        - selection.selected.len();

    publish_batch(&paths, &packets, batch_number, clock)?;

    for name in &selection.selected {
        if let Some(record) = catalog.type_guide.get_mut(name) {
            record.batch_number = Some(batch_number);
        }
    }
    catalog.last_batch_number = batch_number;
    catalog.refresh_counts();
    write_catalog(&paths.catalog_path, &catalog)?;

    let summaries = packets
        .iter()
        .map(|packet| PacketSummary {
            port: packet.worker_port,
            parts: packet.tests.len(),
            operations: packet.operation_count(),
        })
        .collect();
    info!(
        batch = batch_number,
        types = selection.selected.len(),
        workers = packets.len(),
        "batch prepared"
    );
    Ok(PrepareReport {
        dedupe,
        auto_passed,
        outcome: PrepareOutcome::Prepared(PreparedBatch {
            batch_number,
            types: selection.selected,
            packets: summaries,
            deferred,
        }),
    })
}

/// Replace plan files and start a fresh log, archiving the previous one.
fn publish_batch(
    paths: &RunPaths,
    packets: &[WorkPacket],
    batch_number: u32,
    clock: &dyn Clock,
) -> Result<()> {
    let removed = clear_plans(&paths.plans_dir)?;
    if removed > 0 {
        info!(removed, "cleared previous plan files");
    }
    for packet in packets {
        write_plan(&paths.plan_path(packet.worker_port), packet)
            .with_context(|| format!("write plan for port {}", packet.worker_port))?;
    }

    let log = FileLog::new(&paths.log_path);
    let previous = LogState::replay(&log.lines()?);
    if let Some(previous_batch) = previous.batch_number {
        if !previous.complete {
            warn!(batch = previous_batch, "archiving log of an incomplete batch");
        }
        log.archive(&paths.archived_log_path(previous_batch))?;
    } else if log.archive(&paths.archived_log_path(0))? {
        warn!("archived log without a batch header");
    }

    let ports: Vec<u16> = packets.iter().map(|packet| packet.worker_port).collect();
    log.start(&[
        LogHeader::Batch(batch_number),
        LogHeader::Started(clock.now()),
        LogHeader::Ports(ports),
    ])
}
