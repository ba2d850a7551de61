//! Orchestration for the worker-facing commands: `get-next`, `update` and
//! `terminate`.
//!
//! Workers share nothing but the Execution Log. Each call replays the log,
//! reads and rewrites only its own Plan File, and appends its events. The
//! Plan File is always persisted before the log line that reports it.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::coordinator::{
    Interpretation, advance, find_pending, interpret_response, record_result,
};
use crate::core::log_event::{LogEntry, LogEvent, LogLine, LogState, PortMarker};
use crate::core::operation::{ExecutionParams, OperationStatus, WorkPacket};
use crate::io::clock::Clock;
use crate::io::config::RunConfig;
use crate::io::exec_log::ExecutionLog;
use crate::io::init::RunPaths;
use crate::io::plan_store::{load_plan, write_plan};

/// `get-next` reply, printed as JSON for the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextResponse {
    NextOperation { operation: ExecutionParams },
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Recorded {
        operation_id: u32,
        status: OperationStatus,
        error: Option<String>,
    },
    /// Nothing was written.
    Ignored { reason: String },
}

/// Per-worker coordinator over one run directory.
pub struct Coordinator<'a> {
    paths: RunPaths,
    config: RunConfig,
    fatal: Vec<Regex>,
    log: &'a dyn ExecutionLog,
    clock: &'a dyn Clock,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        paths: RunPaths,
        config: RunConfig,
        log: &'a dyn ExecutionLog,
        clock: &'a dyn Clock,
    ) -> Result<Self> {
        let fatal = config.fatal_patterns()?;
        Ok(Self {
            paths,
            config,
            fatal,
            log,
            clock,
        })
    }

    fn append(&self, port: u16, event: LogEvent) -> Result<()> {
        let line = LogLine::Entry(LogEntry {
            timestamp: self.clock.now(),
            port,
            event,
        });
        debug!(%line, "log append");
        self.log.append(&line)
    }

    fn load_packet(&self, port: u16) -> Result<WorkPacket> {
        let path = self.paths.plan_path(port);
        if !path.exists() {
            return Err(anyhow!("no plan for port {port} ({})", path.display()));
        }
        let packet = load_plan(&path)?;
        if packet.worker_port != port {
            return Err(anyhow!(
                "plan {} belongs to port {}",
                path.display(),
                packet.worker_port
            ));
        }
        Ok(packet)
    }

    fn save_packet(&self, packet: &WorkPacket) -> Result<()> {
        write_plan(&self.paths.plan_path(packet.worker_port), packet)
    }

    /// Bring a timed-out port back; returns the refreshed state.
    fn resume_if_timed_out(&self, port: u16, state: LogState) -> Result<LogState> {
        if state.marker(port) != PortMarker::TimedOut {
            return Ok(state);
        }
        info!(port, "resuming after timeout");
        self.append(port, LogEvent::Resumed)?;
        self.log.replay()
    }

    /// Leader-only: tick `ELAPSED` and time out idle ports.
    fn heartbeat(&self, port: u16, state: &LogState) -> Result<()> {
        if !state.leads(port) {
            return Ok(());
        }
        let Some(reference) = state.last_elapsed.or(state.started_at) else {
            return Ok(());
        };
        let now = self.clock.now();
        let interval =
            i64::try_from(self.config.timing.heartbeat_interval_secs).unwrap_or(i64::MAX);
        if (now - reference).num_seconds() < interval {
            return Ok(());
        }

        let minutes = state
            .started_at
            .map_or(0, |started| (now - started).num_minutes());
        self.append(port, LogEvent::Elapsed { minutes })?;

        let timeout =
            i64::try_from(self.config.timing.inactivity_timeout_secs).unwrap_or(i64::MAX);
        for other in state.active_ports() {
            if other == port {
                continue;
            }
            let Some(last_seen) = state.last_seen(other) else {
                continue;
            };
            let idle = (now - last_seen).num_seconds();
            if idle > timeout {
                warn!(port = other, idle_secs = idle, "marking idle port timed out");
                self.append(other, LogEvent::TimedOut { by: port })?;
            }
        }
        Ok(())
    }

    /// Append the batch summary once every participating port is done.
    ///
    /// Only the port with the most recent `FINISHED` line writes it, unless
    /// `force` is set.
    fn finalize_if_done(&self, port: u16, force: bool) -> Result<bool> {
        let state = self.log.replay()?;
        if !state.all_done() || state.summary.is_some() || state.complete {
            return Ok(false);
        }
        if !force && state.last_finisher != Some(port) {
            return Ok(false);
        }
        let counters = state.counters();
        self.append(port, LogEvent::Summary(counters))?;
        self.append(port, LogEvent::Complete)?;
        info!(
            port,
            succeeded = counters.ops_succeeded,
            failed = counters.ops_failed,
            "all workers complete"
        );
        Ok(true)
    }

    /// Next operation for `port`, or `finished` once its packet is exhausted.
    #[instrument(skip_all, fields(port))]
    pub fn get_next(&self, port: u16) -> Result<NextResponse> {
        let state = self.log.replay()?;
        if state.complete || is_closed(state.marker(port)) {
            return Ok(NextResponse::Finished);
        }
        let state = self.resume_if_timed_out(port, state)?;
        self.heartbeat(port, &state)?;

        let mut packet = self.load_packet(port)?;
        let step = advance(&mut packet, &self.config.retry_policy(), &self.fatal);
        if step.changed() {
            self.save_packet(&packet)?;
        }
        for skipped in &step.skipped {
            warn!(
                type_name = %skipped.type_name,
                part = skipped.part_number,
                operation = skipped.operation_id,
                reason = %skipped.reason,
                "abandoning rest of part"
            );
            self.append(
                port,
                LogEvent::Status {
                    operation_id: skipped.operation_id,
                    status: OperationStatus::Fail,
                    detail: Some(format!(
                        "skipped={} error={}",
                        skipped.marked, skipped.reason
                    )),
                },
            )?;
        }

        let Some(cursor) = step.next else {
            self.append(port, LogEvent::Finished)?;
            info!(port, "worker finished");
            self.finalize_if_done(port, false)?;
            return Ok(NextResponse::Finished);
        };

        let params = cursor.params(&packet);
        self.append(
            port,
            LogEvent::Provided {
                operation_id: params.operation_id,
                part_number: params.part_number,
                total_parts: params.total_parts,
                type_name: params.type_name.clone(),
            },
        )?;
        Ok(NextResponse::NextOperation { operation: params })
    }

    /// Record the response for the operation most recently handed to `port`.
    #[instrument(skip_all, fields(port, tool_name))]
    pub fn update(&self, port: u16, tool_name: &str, response: &Value) -> Result<UpdateOutcome> {
        let state = self.log.replay()?;
        if state.complete || is_closed(state.marker(port)) {
            return Ok(ignored(format!("port {port} is {}", state.marker(port).label())));
        }

        let mut packet = self.load_packet(port)?;
        let Some(cursor) = find_pending(&packet) else {
            return Ok(ignored("no pending operation".to_string()));
        };
        let op = cursor.operation(&packet);
        if op.tool() != tool_name {
            return Ok(ignored(format!(
                "operation {} expects {}, got {tool_name}",
                op.operation_id,
                op.tool()
            )));
        }
        if op.times_provided <= op.call_count {
            return Ok(ignored(format!(
                "operation {} has no outstanding delivery",
                op.operation_id
            )));
        }
        self.resume_if_timed_out(port, state)?;

        let outcome: Interpretation = interpret_response(op, response);
        let params = cursor.params(&packet);
        record_result(&mut packet, cursor, &outcome);
        self.save_packet(&packet)?;

        let detail = match &outcome.error {
            Some(error) => {
                let request = serde_json::to_string(&params).context("serialize request")?;
                Some(format!("error={error} | request={request}"))
            }
            None => None,
        };
        self.append(
            port,
            LogEvent::Status {
                operation_id: params.operation_id,
                status: outcome.status,
                detail,
            },
        )?;
        Ok(UpdateOutcome::Recorded {
            operation_id: params.operation_id,
            status: outcome.status,
            error: outcome.error,
        })
    }

    /// Hard-terminate `port`. Returns false when it was already finished or terminated.
    #[instrument(skip_all, fields(port))]
    pub fn terminate(&self, port: u16, reason: Option<String>) -> Result<bool> {
        let state = self.log.replay()?;
        if is_closed(state.marker(port)) {
            return Ok(false);
        }
        self.append(port, LogEvent::Terminated { reason })?;
        warn!(port, "worker terminated");
        self.finalize_if_done(port, true)?;
        Ok(true)
    }
}

/// Finished or hard-terminated ports never receive work again.
fn is_closed(marker: PortMarker) -> bool {
    matches!(marker, PortMarker::Finished | PortMarker::Terminated)
}

fn ignored(reason: String) -> UpdateOutcome {
    debug!(%reason, "update ignored");
    UpdateOutcome::Ignored { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_event::LogHeader;
    use crate::test_support::{ManualClock, MemoryLog, TestWorkspace, component_packet};
    use serde_json::json;

    struct Fixture {
        workspace: TestWorkspace,
        log: MemoryLog,
        clock: ManualClock,
    }

    impl Fixture {
        fn new(packets: &[WorkPacket]) -> Self {
            let workspace = TestWorkspace::new();
            for packet in packets {
                write_plan(&workspace.paths.plan_path(packet.worker_port), packet)
                    .expect("write plan");
            }
            let log = MemoryLog::with_headers(vec![
                LogHeader::Batch(1),
                LogHeader::Started(crate::test_support::ts("2026-10-19 10:00:00")),
                LogHeader::Ports(packets.iter().map(|p| p.worker_port).collect()),
            ]);
            Self {
                workspace,
                log,
                clock: ManualClock::at("2026-10-19 10:00:00"),
            }
        }

        fn coordinator(&self) -> Coordinator<'_> {
            Coordinator::new(
                self.workspace.paths.clone(),
                RunConfig::default(),
                &self.log,
                &self.clock,
            )
            .expect("coordinator")
        }

        fn plan(&self, port: u16) -> WorkPacket {
            load_plan(&self.workspace.paths.plan_path(port)).expect("plan")
        }
    }

    fn next_id(response: &NextResponse) -> u32 {
        match response {
            NextResponse::NextOperation { operation } => operation.operation_id,
            NextResponse::Finished => panic!("unexpected finished"),
        }
    }

    #[test]
    fn get_next_json_shape() {
        let finished = serde_json::to_value(NextResponse::Finished).expect("json");
        assert_eq!(finished, json!({"status": "finished"}));
    }

    #[test]
    fn delivers_in_order_and_records_results() {
        let fixture = Fixture::new(&[component_packet(30001, &[1])]);
        let coordinator = fixture.coordinator();

        let first = coordinator.get_next(30001).expect("next");
        assert_eq!(next_id(&first), 1);
        let outcome = coordinator
            .update(30001, "world.query", &json!({"result": [{"entity": 5}]}))
            .expect("update");
        assert!(matches!(outcome, UpdateOutcome::Recorded { status: OperationStatus::Success, .. }));

        let second = coordinator.get_next(30001).expect("next");
        let NextResponse::NextOperation { operation } = &second else {
            panic!("expected operation");
        };
        assert_eq!(operation.operation_id, 2);
        assert_eq!(operation.entity, Some(crate::core::operation::EntityRef::Resolved(5)));

        coordinator
            .update(30001, "world.mutate_components", &json!({}))
            .expect("update");
        assert_eq!(coordinator.get_next(30001).expect("next"), NextResponse::Finished);

        let rendered = fixture.log.rendered();
        assert!(rendered.iter().any(|l| l.ends_with("port=30001 FINISHED")));
        assert!(rendered.iter().any(|l| l.ends_with("ALL WORKERS COMPLETE")));
        assert!(rendered.iter().any(|l| l.contains("SUMMARY ops_succeeded=2 ops_failed=0")));
    }

    #[test]
    fn finished_is_idempotent_without_writes() {
        let fixture = Fixture::new(&[component_packet(30001, &[0])]);
        let coordinator = fixture.coordinator();
        coordinator.get_next(30001).expect("next");
        coordinator
            .update(30001, "world.query", &json!([{"entity": 1}]))
            .expect("update");
        assert_eq!(coordinator.get_next(30001).expect("next"), NextResponse::Finished);

        let before = fixture.log.rendered();
        let plan_before = fixture.plan(30001);
        for _ in 0..3 {
            assert_eq!(coordinator.get_next(30001).expect("next"), NextResponse::Finished);
        }
        assert_eq!(fixture.log.rendered(), before);
        assert_eq!(fixture.plan(30001), plan_before);
    }

    #[test]
    fn mismatched_tool_is_ignored() {
        let fixture = Fixture::new(&[component_packet(30001, &[1])]);
        let coordinator = fixture.coordinator();
        coordinator.get_next(30001).expect("next");
        let lines_before = fixture.log.rendered().len();
        let outcome = coordinator
            .update(30001, "world.mutate_components", &json!({}))
            .expect("update");
        assert!(matches!(outcome, UpdateOutcome::Ignored { .. }));
        assert_eq!(fixture.log.rendered().len(), lines_before);
        assert_eq!(fixture.plan(30001).tests[0].operations[0].call_count, 0);
    }

    #[test]
    fn repeated_update_does_not_double_count() {
        let fixture = Fixture::new(&[component_packet(30001, &[1])]);
        let coordinator = fixture.coordinator();
        coordinator.get_next(30001).expect("next");
        coordinator
            .update(30001, "world.query", &json!([{"entity": 3}]))
            .expect("first update");
        // The mutation has not been delivered yet.
        let outcome = coordinator
            .update(30001, "world.mutate_components", &json!({}))
            .expect("second update");
        assert!(matches!(outcome, UpdateOutcome::Ignored { .. }));
        let plan = fixture.plan(30001);
        assert_eq!(plan.tests[0].operations[0].call_count, 1);
        assert_eq!(plan.tests[0].operations[1].status, None);
    }

    #[test]
    fn failed_update_logs_request_and_is_redelivered() {
        let fixture = Fixture::new(&[component_packet(30001, &[1])]);
        let coordinator = fixture.coordinator();
        coordinator.get_next(30001).expect("next");
        coordinator
            .update(30001, "world.query", &json!([{"entity": 3}]))
            .expect("update");
        coordinator.get_next(30001).expect("next");
        let outcome = coordinator
            .update(30001, "world.mutate_components", &json!({"error": "bad value"}))
            .expect("update");
        assert!(matches!(outcome, UpdateOutcome::Recorded { status: OperationStatus::Fail, .. }));
        let last = fixture.log.rendered().pop().expect("line");
        assert!(last.contains("status=FAIL op=2 error=bad value | request={"), "{last}");

        assert_eq!(next_id(&coordinator.get_next(30001).expect("next")), 2);
        let plan = fixture.plan(30001);
        assert_eq!(plan.tests[0].operations[1].times_provided, 2);
        assert_eq!(plan.tests[0].operations[1].error.as_deref(), Some("bad value"));
    }

    #[test]
    fn undelivered_operation_abandons_part_and_moves_on() {
        let mut packet = component_packet(30002, &[4, 1]);
        for op in &mut packet.tests[0].operations[..4] {
            op.status = Some(OperationStatus::Success);
            op.call_count = 1;
            op.times_provided = 1;
        }
        packet.tests[0].operations[4].times_provided = 4;
        let fixture = Fixture::new(&[packet]);

        let next = fixture.coordinator().get_next(30002).expect("next");
        assert_eq!(next_id(&next), 6);

        let plan = fixture.plan(30002);
        let op = &plan.tests[0].operations[4];
        assert_eq!(op.status, Some(OperationStatus::Fail));
        assert!(op.skipped);
        assert!(op.error.as_deref().is_some_and(|e| e.contains("not executed")));
        assert!(
            fixture
                .log
                .rendered()
                .iter()
                .any(|l| l.contains("port=30002 status=FAIL op=5 skipped=1 error=operation not executed"))
        );
    }

    #[test]
    fn terminated_port_gets_finished() {
        let fixture = Fixture::new(&[component_packet(30001, &[1]), component_packet(30002, &[1])]);
        let coordinator = fixture.coordinator();
        assert!(coordinator.terminate(30002, Some("operator".to_string())).expect("terminate"));
        assert!(!coordinator.terminate(30002, None).expect("again"));
        assert_eq!(coordinator.get_next(30002).expect("next"), NextResponse::Finished);
        assert_eq!(next_id(&coordinator.get_next(30001).expect("next")), 1);
    }

    #[test]
    fn leader_times_out_idle_port_which_later_resumes() {
        let fixture = Fixture::new(&[component_packet(30001, &[3]), component_packet(30002, &[3])]);
        let coordinator = fixture.coordinator();

        coordinator.get_next(30002).expect("30002 starts");
        fixture.clock.advance_secs(30);
        coordinator.get_next(30001).expect("30001 starts");

        // 30002 goes quiet; the leader (30001) keeps working.
        fixture.clock.advance_secs(70);
        coordinator.get_next(30001).expect("tick");
        let rendered = fixture.log.rendered();
        assert!(rendered.iter().any(|l| l.contains("port=30001 ELAPSED 1m")));
        assert!(
            rendered
                .iter()
                .any(|l| l.contains("port=30002 TERMINATED (TIMEOUT) by=30001")),
            "{rendered:#?}"
        );

        coordinator.get_next(30002).expect("resume");
        assert!(
            fixture
                .log
                .rendered()
                .iter()
                .any(|l| l.ends_with("port=30002 RESUMING AFTER TIMEOUT"))
        );
        let state = fixture.log.replay().expect("replay");
        assert_eq!(state.marker(30002), PortMarker::Active);
    }

    #[test]
    fn declared_port_that_never_reports_is_timed_out() {
        let fixture = Fixture::new(&[component_packet(30001, &[1]), component_packet(30002, &[6])]);
        let coordinator = fixture.coordinator();

        // Only 30002 ever talks to the coordinator, every 30 seconds.
        for _ in 0..7 {
            let NextResponse::NextOperation { operation } =
                coordinator.get_next(30002).expect("next")
            else {
                panic!("expected operation");
            };
            let response = if operation.tool == "world.query" {
                json!([{"entity": 1}])
            } else {
                json!({})
            };
            coordinator
                .update(30002, &operation.tool, &response)
                .expect("update");
            fixture.clock.advance_secs(30);
        }
        assert_eq!(coordinator.get_next(30002).expect("done"), NextResponse::Finished);

        let rendered = fixture.log.rendered();
        assert!(rendered.iter().any(|l| l.contains("port=30002 ELAPSED 1m")));
        assert!(
            rendered
                .iter()
                .any(|l| l.contains("port=30001 TERMINATED (TIMEOUT) by=30002")),
            "{rendered:#?}"
        );
        assert!(rendered.last().expect("line").ends_with("ALL WORKERS COMPLETE"));
        let state = fixture.log.replay().expect("replay");
        assert!(state.all_done());
        assert_eq!(state.leader(), None);
    }

    #[test]
    fn only_last_finisher_writes_summary() {
        let fixture = Fixture::new(&[component_packet(30001, &[0]), component_packet(30002, &[0])]);
        let coordinator = fixture.coordinator();
        for port in [30001, 30002] {
            coordinator.get_next(port).expect("next");
            coordinator
                .update(port, "world.query", &json!([{"entity": 1}]))
                .expect("update");
        }
        coordinator.get_next(30001).expect("30001 finishes");
        assert!(!fixture.log.rendered().iter().any(|l| l.contains("SUMMARY")));
        coordinator.get_next(30002).expect("30002 finishes");

        let summaries: Vec<String> = fixture
            .log
            .rendered()
            .into_iter()
            .filter(|l| l.contains("SUMMARY"))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].contains("port=30002"));
        assert!(summaries[0].contains("ports_finished=2"));
    }
}
