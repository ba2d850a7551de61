//! Orchestration for `mutation-runner process-results`.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, instrument, warn};

use crate::core::aggregate::{BatchSummary, apply_verdicts, judge_packets};
use crate::core::log_event::{LogEntry, LogEvent, LogLine};
use crate::core::operation::WorkPacket;
use crate::io::catalog_store::{load_catalog, write_catalog};
use crate::io::clock::Clock;
use crate::io::config::load_config;
use crate::io::exec_log::ExecutionLog;
use crate::io::init::RunPaths;
use crate::io::plan_store::load_all_plans;

/// Port recorded on controller-written log lines.
const CONTROLLER_PORT: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultsOutcome {
    Processed(BatchSummary),
    /// No type is assigned to an open batch.
    NothingToProcess,
}

/// Fold every Plan File of the open batch into the catalog.
///
/// Refuses while workers are still active unless `force` is set; forced
/// processing treats their unfinished operations as not executed.
#[instrument(skip_all)]
pub fn process_results(
    root: &Path,
    log: &dyn ExecutionLog,
    clock: &dyn Clock,
    force: bool,
) -> Result<ResultsOutcome> {
    let paths = RunPaths::new(root);
    load_config(&paths.config_path)?;
    let mut catalog = load_catalog(&paths.catalog_path)?;
    let batch_number = catalog.last_batch_number;
    if catalog.types_in_batch(batch_number).is_empty() {
        info!(batch = batch_number, "no open batch");
        return Ok(ResultsOutcome::NothingToProcess);
    }

    let state = log.replay()?;
    let active = state.active_ports();
    if !active.is_empty() {
        let ports: Vec<String> = active.iter().map(u16::to_string).collect();
        if !force {
            bail!(
                "batch {batch_number} still has active workers on port(s) {} (use --force to process anyway)",
                ports.join(", ")
            );
        }
        warn!(ports = %ports.join(","), "processing batch with active workers");
    }

    let packets: Vec<WorkPacket> = load_all_plans(&paths.plans_dir)?
        .into_iter()
        .filter(|packet| packet.batch_number == batch_number)
        .collect();
    let verdicts = judge_packets(&packets);
    let summary = apply_verdicts(&mut catalog, batch_number, &verdicts);

    if !state.complete {
        let now = clock.now();
        if state.summary.is_none() {
            log.append(&controller_line(now, LogEvent::Summary(state.counters())))?;
        }
        log.append(&controller_line(now, LogEvent::Complete))?;
    }
    write_catalog(&paths.catalog_path, &catalog)?;

    info!(
        batch = batch_number,
        types = summary.total(),
        passed = summary.passed,
        auto_retried = summary.auto_retried,
        needs_review = summary.needs_review,
        not_started = summary.not_started,
        "batch processed"
    );
    Ok(ResultsOutcome::Processed(summary))
}

fn controller_line(timestamp: chrono::NaiveDateTime, event: LogEvent) -> LogLine {
    LogLine::Entry(LogEntry {
        timestamp,
        port: CONTROLLER_PORT,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_event::LogHeader;
    use crate::core::operation::OperationStatus;
    use crate::core::types::TestStatus;
    use crate::io::plan_store::write_plan;
    use crate::test_support::{
        ManualClock, MemoryLog, TestWorkspace, catalog_with, component_packet, ts,
    };

    fn open_batch(workspace: &TestWorkspace, packet: &WorkPacket) {
        let names: Vec<String> = packet.tests.iter().map(|p| p.type_name.clone()).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut catalog = catalog_with(&refs, Some(1));
        catalog.last_batch_number = 1;
        workspace.write_catalog(&catalog);
        write_plan(&workspace.paths.plan_path(packet.worker_port), packet).expect("plan");
    }

    fn log_for(ports: Vec<u16>) -> MemoryLog {
        MemoryLog::with_headers(vec![
            LogHeader::Batch(1),
            LogHeader::Started(ts("2026-10-19 10:00:00")),
            LogHeader::Ports(ports),
        ])
    }

    fn succeed_all(packet: &mut WorkPacket) {
        for part in &mut packet.tests {
            for op in &mut part.operations {
                op.status = Some(OperationStatus::Success);
                op.call_count = 1;
                op.times_provided = 1;
            }
        }
    }

    #[test]
    fn nothing_to_process_without_open_batch() {
        let workspace = TestWorkspace::new();
        let outcome = process_results(
            workspace.root(),
            &MemoryLog::new(),
            &ManualClock::at("2026-10-19 11:00:00"),
            false,
        )
        .expect("process");
        assert_eq!(outcome, ResultsOutcome::NothingToProcess);
    }

    #[test]
    fn refuses_while_workers_are_active() {
        let workspace = TestWorkspace::new();
        open_batch(&workspace, &component_packet(30001, &[1]));
        let err = process_results(
            workspace.root(),
            &log_for(vec![30001]),
            &ManualClock::at("2026-10-19 11:00:00"),
            false,
        )
        .expect_err("active workers");
        assert!(err.to_string().contains("30001"));
        assert_eq!(workspace.catalog().type_guide["game::T0"].batch_number, Some(1));
    }

    #[test]
    fn forced_processing_releases_batch_and_writes_summary() {
        let workspace = TestWorkspace::new();
        let mut packet = component_packet(30001, &[1, 1]);
        // T0 passes; T1 never started.
        packet.tests[0].operations.iter_mut().for_each(|op| {
            op.status = Some(OperationStatus::Success);
            op.call_count = 1;
        });
        open_batch(&workspace, &packet);
        let log = log_for(vec![30001]);

        let outcome = process_results(
            workspace.root(),
            &log,
            &ManualClock::at("2026-10-19 11:00:00"),
            true,
        )
        .expect("process");
        let ResultsOutcome::Processed(summary) = outcome else {
            panic!("expected summary");
        };
        assert_eq!((summary.passed, summary.not_started), (1, 1));

        let catalog = workspace.catalog();
        assert_eq!(catalog.type_guide["game::T0"].test_status, TestStatus::Passed);
        assert_eq!(catalog.type_guide["game::T1"].test_status, TestStatus::Untested);
        assert!(catalog.type_guide.values().all(|r| r.batch_number.is_none()));

        let rendered = log.rendered();
        assert!(rendered.iter().any(|l| l.contains("port=0 SUMMARY")));
        assert!(rendered.last().expect("line").ends_with("ALL WORKERS COMPLETE"));
        assert!(log.replay().expect("replay").ports.is_empty());
    }

    #[test]
    fn completed_log_is_left_alone() {
        let workspace = TestWorkspace::new();
        let mut packet = component_packet(30001, &[2]);
        succeed_all(&mut packet);
        open_batch(&workspace, &packet);
        let log = log_for(vec![30001]);
        let at = ts("2026-10-19 10:05:00");
        for event in [LogEvent::Finished, LogEvent::Complete] {
            log.append(&LogLine::Entry(LogEntry {
                timestamp: at,
                port: 30001,
                event,
            }))
            .expect("append");
        }
        let before = log.rendered();

        process_results(
            workspace.root(),
            &log,
            &ManualClock::at("2026-10-19 11:00:00"),
            false,
        )
        .expect("process");
        assert_eq!(log.rendered(), before);
        let record = &workspace.catalog().type_guide["game::T0"];
        assert_eq!(record.mutations_passed, vec![".f0", ".f1"]);
        assert_eq!(record.operations_attempted, 3);
    }
}
