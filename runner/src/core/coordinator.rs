//! Pure transitions behind `get-next` and `update`.
//!
//! Everything here mutates an in-memory [`WorkPacket`]; persisting it and
//! appending the matching log lines is the caller's job.

use regex::Regex;
use serde_json::Value;

use crate::core::operation::{
    EntityRef, ExecutionParams, Operation, OperationKind, OperationStatus, Part, WorkPacket,
};
use crate::core::value::substitute_entity;

/// Error text that marks an operation the worker never ran.
pub const NOT_EXECUTED: &str = "not executed";

/// Delivery ceilings applied before an operation is handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Stop once an operation has been executed this many times.
    pub max_executions: u32,
    /// Stop once deliveries outnumber executions by this much.
    pub max_undelivered: u32,
    /// Absolute ceiling on either counter.
    pub hard_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_executions: 4,
            max_undelivered: 4,
            hard_limit: 10,
        }
    }
}

/// Position of an operation inside a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub part: usize,
    pub op: usize,
}

impl Cursor {
    pub fn operation<'a>(&self, packet: &'a WorkPacket) -> &'a Operation {
        &packet.tests[self.part].operations[self.op]
    }

    pub fn params(&self, packet: &WorkPacket) -> ExecutionParams {
        let part = &packet.tests[self.part];
        ExecutionParams::from_operation(&part.operations[self.op], part)
    }
}

/// First operation, in packet order, that is unset or failed without being skipped.
pub fn find_pending(packet: &WorkPacket) -> Option<Cursor> {
    packet.tests.iter().enumerate().find_map(|(part_index, part)| {
        part.operations
            .iter()
            .position(Operation::is_pending)
            .map(|op| Cursor {
                part: part_index,
                op,
            })
    })
}

/// Why `op` must not be delivered again, if any ceiling or fatal class applies.
pub fn termination_reason(op: &Operation, policy: &RetryPolicy, fatal: &[Regex]) -> Option<String> {
    if op.call_count > policy.hard_limit || op.times_provided > policy.hard_limit {
        return Some(format!(
            "hard limit exceeded (callCount={}, timesProvided={})",
            op.call_count, op.times_provided
        ));
    }
    if op.call_count >= policy.max_executions {
        return Some(format!(
            "retry limit reached after {} executions",
            op.call_count
        ));
    }
    if op.times_provided.saturating_sub(op.call_count) >= policy.max_undelivered {
        return Some(format!(
            "operation {NOT_EXECUTED}: provided {} times without a result",
            op.times_provided
        ));
    }
    let error = op.error.as_deref()?;
    fatal
        .iter()
        .any(|pattern| pattern.is_match(error))
        .then(|| format!("fatal error: {error}"))
}

/// Fail every non-successful operation of `part` from `from` onward.
///
/// The triggering operation keeps its own error when it has one. Returns the
/// number of operations marked.
pub fn skip_remainder(part: &mut Part, from: usize, reason: &str) -> usize {
    let trigger_id = part
        .operations
        .get(from)
        .map(|op| op.operation_id)
        .unwrap_or_default();
    let mut marked = 0;
    for (index, op) in part.operations.iter_mut().enumerate().skip(from) {
        if op.is_success() {
            continue;
        }
        op.status = Some(OperationStatus::Fail);
        op.skipped = true;
        if op.error.is_none() {
            op.error = Some(if index == from {
                reason.to_string()
            } else {
                format!("{NOT_EXECUTED}: part abandoned at operation {trigger_id} ({reason})")
            });
        }
        marked += 1;
    }
    marked
}

/// A part abandoned by [`advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPart {
    pub type_name: String,
    pub part_number: u32,
    pub total_parts: u32,
    pub operation_id: u32,
    pub reason: String,
    pub marked: usize,
}

/// Outcome of [`advance`].
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    /// Operation to deliver; `None` when the packet is exhausted.
    pub next: Option<Cursor>,
    pub skipped: Vec<SkippedPart>,
}

impl Advance {
    /// The packet was modified and must be persisted.
    pub fn changed(&self) -> bool {
        self.next.is_some() || !self.skipped.is_empty()
    }
}

/// Select the next operation to deliver, abandoning parts whose current
/// operation hit a ceiling. The chosen operation's `times_provided` is bumped.
pub fn advance(packet: &mut WorkPacket, policy: &RetryPolicy, fatal: &[Regex]) -> Advance {
    let mut skipped = Vec::new();
    loop {
        let Some(cursor) = find_pending(packet) else {
            return Advance {
                next: None,
                skipped,
            };
        };
        let op = cursor.operation(packet);
        if let Some(reason) = termination_reason(op, policy, fatal) {
            let operation_id = op.operation_id;
            let part = &mut packet.tests[cursor.part];
            let marked = skip_remainder(part, cursor.op, &reason);
            skipped.push(SkippedPart {
                type_name: part.type_name.clone(),
                part_number: part.part_number,
                total_parts: part.total_parts,
                operation_id,
                reason,
                marked,
            });
            continue;
        }
        packet.tests[cursor.part].operations[cursor.op].times_provided += 1;
        return Advance {
            next: Some(cursor),
            skipped,
        };
    }
}

/// Response classification for one executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub status: OperationStatus,
    pub error: Option<String>,
    /// Entity returned by a successful query.
    pub entity: Option<u64>,
}

impl Interpretation {
    fn success(entity: Option<u64>) -> Self {
        Self {
            status: OperationStatus::Success,
            error: None,
            entity,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Fail,
            error: Some(error.into()),
            entity: None,
        }
    }
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string),
        other => other.to_string(),
    }
}

/// Map a protocol response onto SUCCESS/FAIL.
///
/// Any object without an `error` member and without `"status": "error"`
/// succeeds. A query additionally needs a non-empty result array (either the
/// response itself or its `result` member) whose first element carries a
/// numeric `entity`.
pub fn interpret_response(op: &Operation, response: &Value) -> Interpretation {
    if let Value::Object(map) = response {
        if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
            return Interpretation::fail(error_text(error));
        }
        if map.get("status").and_then(Value::as_str) == Some("error") {
            let message = map
                .get("message")
                .map_or_else(|| "request failed".to_string(), error_text);
            return Interpretation::fail(message);
        }
    }

    if op.is_query() {
        let result = match response {
            Value::Array(_) => Some(response),
            Value::Object(map) => map.get("result"),
            _ => None,
        };
        let entity = result
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("entity"))
            .and_then(Value::as_u64);
        return match entity {
            Some(entity) => Interpretation::success(Some(entity)),
            None => Interpretation::fail(format!("resource not found: no {} entity", op.type_name)),
        };
    }

    if response.is_object() {
        Interpretation::success(None)
    } else {
        Interpretation::fail(format!("unexpected response: {response}"))
    }
}

/// Apply `outcome` to the operation at `cursor`. A successful query resolves the
/// entity for the rest of its part.
pub fn record_result(packet: &mut WorkPacket, cursor: Cursor, outcome: &Interpretation) {
    let part = &mut packet.tests[cursor.part];
    let op = &mut part.operations[cursor.op];
    op.call_count += 1;
    op.status = Some(outcome.status);
    op.error = match outcome.status {
        OperationStatus::Success => None,
        OperationStatus::Fail => outcome.error.clone(),
    };
    let resolves = op.is_query() && outcome.status == OperationStatus::Success;
    if let (true, Some(entity)) = (resolves, outcome.entity) {
        propagate_entity(part, cursor.op + 1, entity);
    }
}

/// Resolve entity placeholders in every later operation of `part`.
///
/// Returns the number of operations changed.
pub fn propagate_entity(part: &mut Part, from: usize, entity: u64) -> usize {
    let mut changed = 0;
    for op in part.operations.iter_mut().skip(from) {
        let mut touched = false;
        if op.entity.is_some_and(EntityRef::is_pending) {
            op.entity = Some(EntityRef::Resolved(entity));
            touched = true;
        }
        if matches!(op.kind, OperationKind::Mutate { .. }) && !op.entity_placeholders.is_empty() {
            let pointers = op.entity_placeholders.clone();
            if let Some(value) = op.value_mut() {
                if substitute_entity(value, &pointers, entity) > 0 {
                    op.entity_placeholders.clear();
                    touched = true;
                }
            }
        }
        if touched {
            changed += 1;
        }
    }
    changed
}
