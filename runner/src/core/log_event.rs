//! Execution Log line format and replay.
//!
//! Every line is either a header (`# <key> <value>`) or an entry:
//!
//! ```text
//! [2026-10-19 12:00:00] port=30001 provided op=5 part=1/3 type=game::Health
//! [2026-10-19 12:00:04] port=30001 status=FAIL op=5 error=... | request={...}
//! [2026-10-19 12:01:00] port=30001 ELAPSED 1m
//! ```
//!
//! State is never stored in the log; it is derived by [`LogState::replay`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::core::operation::OperationStatus;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\] port=(\d+) (.+)$")
        .expect("entry regex")
});

/// Header lines written once when a batch is prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogHeader {
    Batch(u32),
    Started(NaiveDateTime),
    Ports(Vec<u16>),
}

/// Aggregate counters appended once when every worker is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub ops_succeeded: usize,
    pub ops_failed: usize,
    pub ports_finished: usize,
    pub ports_timed_out: usize,
    pub ports_terminated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Provided {
        operation_id: u32,
        part_number: u32,
        total_parts: u32,
        type_name: String,
    },
    Status {
        operation_id: u32,
        status: OperationStatus,
        /// Free text after the operation id (error, request parameters).
        detail: Option<String>,
    },
    Finished,
    /// Hard termination; the port never receives work again this batch.
    Terminated { reason: Option<String> },
    /// Soft termination written by the heartbeat leader for an idle port.
    TimedOut { by: u16 },
    Resumed,
    Elapsed { minutes: i64 },
    Summary(BatchCounters),
    Complete,
    /// Unrecognized event text, kept so replay never fails on new events.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub port: u16,
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Header(LogHeader),
    Entry(LogEntry),
}

impl fmt::Display for LogHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogHeader::Batch(batch) => write!(f, "# batch {batch}"),
            LogHeader::Started(at) => write!(f, "# started {}", at.format(TIMESTAMP_FORMAT)),
            LogHeader::Ports(ports) => {
                let joined: Vec<String> = ports.iter().map(u16::to_string).collect();
                write!(f, "# ports {}", joined.join(","))
            }
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Provided {
                operation_id,
                part_number,
                total_parts,
                type_name,
            } => write!(
                f,
                "provided op={operation_id} part={part_number}/{total_parts} type={type_name}"
            ),
            LogEvent::Status {
                operation_id,
                status,
                detail,
            } => {
                write!(f, "status={} op={operation_id}", status.label())?;
                if let Some(detail) = detail {
                    write!(f, " {}", single_line(detail))?;
                }
                Ok(())
            }
            LogEvent::Finished => f.write_str("FINISHED"),
            LogEvent::Terminated { reason: None } => f.write_str("TERMINATED"),
            LogEvent::Terminated {
                reason: Some(reason),
            } => write!(f, "TERMINATED reason={}", single_line(reason)),
            LogEvent::TimedOut { by } => write!(f, "TERMINATED (TIMEOUT) by={by}"),
            LogEvent::Resumed => f.write_str("RESUMING AFTER TIMEOUT"),
            LogEvent::Elapsed { minutes } => write!(f, "ELAPSED {minutes}m"),
            LogEvent::Summary(c) => write!(
                f,
                "SUMMARY ops_succeeded={} ops_failed={} ports_finished={} ports_timed_out={} ports_terminated={}",
                c.ops_succeeded, c.ops_failed, c.ports_finished, c.ports_timed_out, c.ports_terminated
            ),
            LogEvent::Complete => f.write_str("ALL WORKERS COMPLETE"),
            LogEvent::Other(text) => f.write_str(&single_line(text)),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] port={} {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.port,
            self.event
        )
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLine::Header(header) => header.fmt(f),
            LogLine::Entry(entry) => entry.fmt(f),
        }
    }
}

/// Log lines must stay single-line for replay.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

/// Parse one line; `None` for blank or malformed lines (e.g. a torn final write).
pub fn parse_line(line: &str) -> Option<LogLine> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    if let Some(header) = line.strip_prefix("# ") {
        return parse_header(header).map(LogLine::Header);
    }
    let caps = ENTRY_RE.captures(line)?;
    let timestamp = parse_timestamp(&caps[1])?;
    let port: u16 = caps[2].parse().ok()?;
    let event = parse_event(&caps[3])?;
    Some(LogLine::Entry(LogEntry {
        timestamp,
        port,
        event,
    }))
}

fn parse_header(text: &str) -> Option<LogHeader> {
    let (key, value) = text.split_once(' ')?;
    match key {
        "batch" => value.trim().parse().ok().map(LogHeader::Batch),
        "started" => parse_timestamp(value).map(LogHeader::Started),
        "ports" => {
            let ports: Option<Vec<u16>> = value
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().parse().ok())
                .collect();
            ports.map(LogHeader::Ports)
        }
        _ => None,
    }
}

fn field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.split_whitespace()
        .find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

fn parse_event(text: &str) -> Option<LogEvent> {
    if let Some(rest) = text.strip_prefix("provided ") {
        let operation_id = field(rest, "op")?.parse().ok()?;
        let (part_number, total_parts) = field(rest, "part")?.split_once('/')?;
        let type_name = rest
            .split_once(" type=")
            .map(|(_, name)| name.to_string())
            .unwrap_or_default();
        return Some(LogEvent::Provided {
            operation_id,
            part_number: part_number.parse().ok()?,
            total_parts: total_parts.parse().ok()?,
            type_name,
        });
    }
    if let Some(rest) = text.strip_prefix("status=") {
        let (status, rest) = rest.split_once(' ')?;
        let status = match status {
            "SUCCESS" => OperationStatus::Success,
            "FAIL" => OperationStatus::Fail,
            _ => return None,
        };
        let rest = rest.strip_prefix("op=")?;
        let (id, detail) = match rest.split_once(' ') {
            Some((id, detail)) => (id, Some(detail.to_string())),
            None => (rest, None),
        };
        return Some(LogEvent::Status {
            operation_id: id.parse().ok()?,
            status,
            detail,
        });
    }
    if let Some(rest) = text.strip_prefix("TERMINATED (TIMEOUT)") {
        let by = field(rest, "by").and_then(|p| p.parse().ok()).unwrap_or(0);
        return Some(LogEvent::TimedOut { by });
    }
    if let Some(rest) = text.strip_prefix("TERMINATED") {
        let reason = rest
            .trim()
            .strip_prefix("reason=")
            .map(str::to_string)
            .filter(|r| !r.is_empty());
        return Some(LogEvent::Terminated { reason });
    }
    if let Some(rest) = text.strip_prefix("ELAPSED ") {
        let minutes = rest.trim().trim_end_matches('m').parse().ok()?;
        return Some(LogEvent::Elapsed { minutes });
    }
    if let Some(rest) = text.strip_prefix("SUMMARY") {
        let count = |key: &str| field(rest, key).and_then(|v| v.parse().ok()).unwrap_or(0);
        return Some(LogEvent::Summary(BatchCounters {
            ops_succeeded: count("ops_succeeded"),
            ops_failed: count("ops_failed"),
            ports_finished: count("ports_finished"),
            ports_timed_out: count("ports_timed_out"),
            ports_terminated: count("ports_terminated"),
        }));
    }
    let event = match text {
        "FINISHED" => LogEvent::Finished,
        "RESUMING AFTER TIMEOUT" => LogEvent::Resumed,
        "ALL WORKERS COMPLETE" => LogEvent::Complete,
        other => LogEvent::Other(other.to_string()),
    };
    Some(event)
}

/// Last lifecycle marker seen for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortMarker {
    #[default]
    Active,
    Finished,
    Terminated,
    TimedOut,
}

impl PortMarker {
    /// Finished, hard-terminated or timed out.
    pub fn is_done(self) -> bool {
        !matches!(self, PortMarker::Active)
    }

    pub fn label(self) -> &'static str {
        match self {
            PortMarker::Active => "active",
            PortMarker::Finished => "finished",
            PortMarker::Terminated => "terminated",
            PortMarker::TimedOut => "timed out",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortState {
    pub marker: PortMarker,
    /// Last line written by the port itself (timeout markers excluded).
    pub last_activity: Option<NaiveDateTime>,
    /// Final reported status per operation id.
    pub operations: BTreeMap<u32, OperationStatus>,
    pub deliveries: usize,
}

impl PortState {
    pub fn succeeded(&self) -> usize {
        self.operations
            .values()
            .filter(|s| **s == OperationStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.operations
            .values()
            .filter(|s| **s == OperationStatus::Fail)
            .count()
    }
}

/// Batch state derived from a full log replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogState {
    pub batch_number: Option<u32>,
    pub started_at: Option<NaiveDateTime>,
    pub declared_ports: Vec<u16>,
    pub ports: BTreeMap<u16, PortState>,
    pub last_elapsed: Option<NaiveDateTime>,
    pub summary: Option<BatchCounters>,
    pub complete: bool,
    /// Port of the most recent `FINISHED` line.
    pub last_finisher: Option<u16>,
}

impl LogState {
    pub fn replay<'a>(lines: impl IntoIterator<Item = &'a LogLine>) -> Self {
        let mut state = LogState::default();
        for line in lines {
            match line {
                LogLine::Header(LogHeader::Batch(batch)) => state.batch_number = Some(*batch),
                LogLine::Header(LogHeader::Started(at)) => state.started_at = Some(*at),
                LogLine::Header(LogHeader::Ports(ports)) => state.declared_ports.clone_from(ports),
                LogLine::Entry(entry) => state.apply(entry),
            }
        }
        state
    }

    fn apply(&mut self, entry: &LogEntry) {
        match &entry.event {
            LogEvent::Elapsed { .. } => {
                self.last_elapsed = Some(entry.timestamp);
                self.port_mut(entry.port).last_activity = Some(entry.timestamp);
            }
            LogEvent::Summary(counters) => self.summary = Some(*counters),
            LogEvent::Complete => self.complete = true,
            LogEvent::TimedOut { .. } => {
                let port = self.port_mut(entry.port);
                if port.marker == PortMarker::Active {
                    port.marker = PortMarker::TimedOut;
                }
            }
            event => {
                let port = self.port_mut(entry.port);
                port.last_activity = Some(entry.timestamp);
                match event {
                    LogEvent::Provided { .. } => port.deliveries += 1,
                    LogEvent::Status {
                        operation_id,
                        status,
                        ..
                    } => {
                        port.operations.insert(*operation_id, *status);
                    }
                    LogEvent::Finished => port.marker = PortMarker::Finished,
                    LogEvent::Terminated { .. } => port.marker = PortMarker::Terminated,
                    LogEvent::Resumed => {
                        if port.marker == PortMarker::TimedOut {
                            port.marker = PortMarker::Active;
                        }
                    }
                    _ => {}
                }
                if matches!(event, LogEvent::Finished) {
                    self.last_finisher = Some(entry.port);
                }
            }
        }
    }

    fn port_mut(&mut self, port: u16) -> &mut PortState {
        self.ports.entry(port).or_default()
    }

    pub fn port(&self, port: u16) -> PortState {
        self.ports.get(&port).cloned().unwrap_or_default()
    }

    pub fn marker(&self, port: u16) -> PortMarker {
        self.ports
            .get(&port)
            .map(|state| state.marker)
            .unwrap_or_default()
    }

    /// Ports expected to take part: declared in the header plus any seen in entries.
    pub fn participating(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.declared_ports.clone();
        ports.extend(self.ports.keys().copied());
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Participating ports whose last marker is not terminal.
    pub fn active_ports(&self) -> Vec<u16> {
        self.participating()
            .into_iter()
            .filter(|port| !self.marker(*port).is_done())
            .collect()
    }

    /// Deterministic heartbeat leader: the lowest port that has written a
    /// line and is not done. Declared ports that never started cannot lead.
    pub fn leader(&self) -> Option<u16> {
        self.started_ports().min()
    }

    /// Whether `port` leads once it writes its own next line.
    pub fn leads(&self, port: u16) -> bool {
        !self.marker(port).is_done() && self.started_ports().all(|other| other >= port)
    }

    fn started_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .filter(|(_, state)| !state.marker.is_done())
            .map(|(port, _)| *port)
    }

    pub fn all_done(&self) -> bool {
        self.active_ports().is_empty()
    }

    /// Reference point for inactivity: last own activity, else batch start.
    pub fn last_seen(&self, port: u16) -> Option<NaiveDateTime> {
        self.ports
            .get(&port)
            .and_then(|state| state.last_activity)
            .or(self.started_at)
    }

    pub fn counters(&self) -> BatchCounters {
        let mut counters = BatchCounters::default();
        for port in self.participating() {
            let state = self.port(port);
            counters.ops_succeeded += state.succeeded();
            counters.ops_failed += state.failed();
            match state.marker {
                PortMarker::Finished => counters.ports_finished += 1,
                PortMarker::TimedOut => counters.ports_timed_out += 1,
                PortMarker::Terminated => counters.ports_terminated += 1,
                PortMarker::Active => {}
            }
        }
        counters
    }
}
