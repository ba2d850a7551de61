//! Bin-packing of types into fixed-capacity worker packets.
//!
//! A slot is `ops_per_slot` operations. A type needing more than one slot is
//! split into that many parts; parts are then dealt into packets of
//! `types_per_worker` parts, one packet per worker port.

use crate::core::operation::{Operation, OperationKind, Part, WorkPacket};
use crate::core::sequencer::sequence_operations;
use crate::core::types::TypeRecord;

/// Capacity limits for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingLimits {
    pub types_per_worker: usize,
    pub max_workers: usize,
    pub ops_per_slot: usize,
    pub base_port: u16,
}

impl PackingLimits {
    /// Total parts a batch can hold.
    pub fn capacity(&self) -> usize {
        self.types_per_worker * self.max_workers
    }
}

/// Number of slots (and therefore parts) a sequence of `op_count` operations needs.
pub fn slots_needed(op_count: usize, ops_per_slot: usize) -> usize {
    op_count.div_ceil(ops_per_slot.max(1))
}

/// Parts a sequence splits into: one per slot, but never more parts than
/// mutations.
pub fn part_count(ops: &[Operation], ops_per_slot: usize) -> usize {
    let mutations = ops.iter().filter(|op| op.is_mutation()).count();
    slots_needed(ops.len(), ops_per_slot).min(mutations.max(1))
}

/// Sequence `record` and split it into parts sized by `ops_per_slot`.
///
/// Returns no parts when the type has no operations at all.
pub fn parts_for_type(record: &TypeRecord, ops_per_slot: usize) -> Vec<Part> {
    let ops = sequence_operations(record);
    if ops.is_empty() {
        return Vec::new();
    }
    let total = part_count(&ops, ops_per_slot);
    split_sequence(record, ops, total)
}

/// Split a full operation sequence into `total_parts` parts.
///
/// Mutations are cut at `floor(k * len / total_parts)`. Part 1 keeps create and
/// query; later parts repeat the query and, when their slice does not start
/// with a root-setter, re-apply the nearest preceding one so each part can run
/// without the side effects of earlier parts.
pub fn split_sequence(record: &TypeRecord, ops: Vec<Operation>, total_parts: usize) -> Vec<Part> {
    let total_parts = total_parts.max(1);
    let mut creates = Vec::new();
    let mut query = None;
    let mut mutations = Vec::new();
    for op in ops {
        match op.kind {
            OperationKind::Create { .. } => creates.push(op),
            OperationKind::Query => query = Some(op),
            OperationKind::Mutate { .. } => mutations.push(op),
        }
    }

    let len = mutations.len();
    // Every later part must carry at least one mutation.
    let total_parts = total_parts.min(len.max(1));
    let bounds: Vec<usize> = (0..=total_parts).map(|k| k * len / total_parts).collect();

    let mut parts = Vec::with_capacity(total_parts);
    for part_index in 0..total_parts {
        let (start, end) = (bounds[part_index], bounds[part_index + 1]);
        let mut part_ops = Vec::new();
        if part_index == 0 {
            part_ops.extend(creates.iter().cloned());
        }
        if let Some(query) = &query {
            part_ops.push(query.clone());
        }
        if part_index > 0 {
            if let Some(root) = preceding_root_setter(&mutations, start) {
                part_ops.push(root);
            }
        }
        part_ops.extend(mutations[start..end].iter().cloned());

        parts.push(Part {
            type_name: record.type_name.clone(),
            mutation_kind: record.mutation_kind,
            part_number: (part_index + 1) as u32,
            total_parts: total_parts as u32,
            operations: part_ops,
        });
    }
    parts
}

/// Root-setter to prepend to a slice starting at `start`, if one is needed.
fn preceding_root_setter(mutations: &[Operation], start: usize) -> Option<Operation> {
    let first = mutations.get(start)?;
    if first.is_root_setter() {
        return None;
    }
    mutations[..start]
        .iter()
        .rev()
        .find(|op| op.is_root_setter())
        .cloned()
}

/// Result of choosing which untested types go into the next batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSelection {
    /// Type names admitted to the batch, in catalog order.
    pub selected: Vec<String>,
    /// Types whose own part count exceeds the whole batch capacity.
    pub oversized: Vec<(String, usize)>,
    /// Types with no operations at all.
    pub empty: Vec<String>,
    pub total_parts: usize,
}

/// First-fit selection of candidate types in the given order.
///
/// A type that does not fit in the remaining capacity waits for a later batch;
/// a type that could never fit is reported as oversized.
pub fn select_batch<'a>(
    candidates: impl IntoIterator<Item = &'a TypeRecord>,
    limits: &PackingLimits,
) -> BatchSelection {
    let capacity = limits.capacity();
    let mut selection = BatchSelection::default();
    for record in candidates {
        let ops = sequence_operations(record);
        if ops.is_empty() {
            selection.empty.push(record.type_name.clone());
            continue;
        }
        let parts = part_count(&ops, limits.ops_per_slot);
        if parts > capacity {
            selection.oversized.push((record.type_name.clone(), parts));
            continue;
        }
        if selection.total_parts + parts <= capacity {
            selection.total_parts += parts;
            selection.selected.push(record.type_name.clone());
        }
    }
    selection
}

/// Pack `records` into worker packets for `batch_number`.
///
/// Fails rather than dropping work: any type whose parts exceed the batch
/// capacity, or a total that exceeds `max_workers * types_per_worker`, is an
/// error naming the offending counts.
pub fn plan_packets(
    records: &[&TypeRecord],
    batch_number: u32,
    limits: &PackingLimits,
) -> Result<Vec<WorkPacket>, String> {
    if limits.types_per_worker == 0 || limits.max_workers == 0 {
        return Err("types_per_worker and max_workers must be > 0".to_string());
    }
    let capacity = limits.capacity();

    let mut oversized = Vec::new();
    let mut all_parts = Vec::new();
    for record in records {
        let parts = parts_for_type(record, limits.ops_per_slot);
        if parts.len() > capacity {
            oversized.push(format!(
                "{} needs {} parts (capacity {})",
                record.type_name,
                parts.len(),
                capacity
            ));
            continue;
        }
        all_parts.extend(parts);
    }
    if !oversized.is_empty() {
        return Err(format!(
            "types exceed batch capacity, raise max_workers: {}",
            oversized.join("; ")
        ));
    }
    if all_parts.len() > capacity {
        return Err(format!(
            "batch needs {} parts but capacity is {} ({} workers x {} per worker)",
            all_parts.len(),
            capacity,
            limits.max_workers,
            limits.types_per_worker
        ));
    }

    let mut packets = Vec::new();
    let mut parts = all_parts.into_iter().peekable();
    while parts.peek().is_some() {
        let tests: Vec<Part> = parts.by_ref().take(limits.types_per_worker).collect();
        let port = limits.base_port + packets.len() as u16;
        let mut packet = WorkPacket {
            batch_number,
            worker_port: port,
            tests,
        };
        assign_operation_ids(&mut packet);
        packets.push(packet);
    }
    Ok(packets)
}

/// Number operations 1.. across the packet in delivery order.
pub fn assign_operation_ids(packet: &mut WorkPacket) {
    let mut next = 1;
    for part in &mut packet.tests {
        for op in &mut part.operations {
            op.operation_id = next;
            next += 1;
        }
    }
}
