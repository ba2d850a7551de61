//! Read-only `mutation-runner status`: per-port progress derived from the log.

use std::fmt;

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::core::log_event::{BatchCounters, PortMarker, TIMESTAMP_FORMAT};
use crate::io::exec_log::ExecutionLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReport {
    pub port: u16,
    pub marker: PortMarker,
    pub last_activity: Option<NaiveDateTime>,
    pub deliveries: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub batch_number: Option<u32>,
    pub started_at: Option<NaiveDateTime>,
    pub ports: Vec<PortReport>,
    pub counters: BatchCounters,
    pub complete: bool,
}

pub fn batch_status(log: &dyn ExecutionLog) -> Result<StatusReport> {
    let state = log.replay()?;
    let ports = state
        .participating()
        .into_iter()
        .map(|port| {
            let port_state = state.port(port);
            PortReport {
                port,
                marker: port_state.marker,
                last_activity: port_state.last_activity,
                deliveries: port_state.deliveries,
                succeeded: port_state.succeeded(),
                failed: port_state.failed(),
            }
        })
        .collect();
    Ok(StatusReport {
        batch_number: state.batch_number,
        started_at: state.started_at,
        ports,
        counters: state.counters(),
        complete: state.complete,
    })
}

fn format_time(at: Option<NaiveDateTime>) -> String {
    at.map_or_else(|| "-".to_string(), |at| at.format(TIMESTAMP_FORMAT).to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(batch) = self.batch_number else {
            return f.write_str("no batch in progress");
        };
        writeln!(f, "batch {batch} started {}", format_time(self.started_at))?;
        for port in &self.ports {
            writeln!(
                f,
                "  port {} {:<10} last={} provided={} ok={} fail={}",
                port.port,
                port.marker.label(),
                format_time(port.last_activity),
                port.deliveries,
                port.succeeded,
                port.failed
            )?;
        }
        let state = if self.complete { "complete" } else { "running" };
        write!(
            f,
            "{state}: {} succeeded, {} failed",
            self.counters.ops_succeeded, self.counters.ops_failed
        )
    }
}
