//! Semantic Plan File invariants not expressible via JSON Schema.

use std::collections::BTreeMap;

use crate::core::operation::{OperationStatus, WorkPacket};

/// Check semantic invariants not expressible in JSON Schema:
/// - Operation ids unique and strictly increasing in delivery order
/// - `error` present iff status is FAIL
/// - `skipped` implies FAIL
/// - Part numbers of a type within the packet are distinct and within `1..=total`
pub fn validate_plan(packet: &WorkPacket) -> Vec<String> {
    let mut errors = Vec::new();
    let mut last_id = 0;
    let mut parts_by_type: BTreeMap<&str, Vec<u32>> = BTreeMap::new();

    for part in &packet.tests {
        let location = format!("{} {}", part.type_name, part.label());
        if part.total_parts == 0 || part.part_number == 0 || part.part_number > part.total_parts {
            errors.push(format!("{location}: part number out of range"));
        }
        parts_by_type
            .entry(part.type_name.as_str())
            .or_default()
            .push(part.part_number);

        for op in &part.operations {
            if op.operation_id <= last_id {
                errors.push(format!(
                    "{location}: operation id {} not greater than {}",
                    op.operation_id, last_id
                ));
            }
            last_id = last_id.max(op.operation_id);

            if op.type_name != part.type_name {
                errors.push(format!(
                    "{location}: operation {} belongs to {}",
                    op.operation_id, op.type_name
                ));
            }
            let failed = op.status == Some(OperationStatus::Fail);
            match (failed, op.error.is_some()) {
                (true, false) => errors.push(format!(
                    "{location}: operation {} is FAIL without error",
                    op.operation_id
                )),
                (false, true) => errors.push(format!(
                    "{location}: operation {} has an error but is not FAIL",
                    op.operation_id
                )),
                _ => {}
            }
            if op.skipped && !failed {
                errors.push(format!(
                    "{location}: operation {} is skipped but not FAIL",
                    op.operation_id
                ));
            }
        }
    }

    for (type_name, mut numbers) in parts_by_type {
        let count = numbers.len();
        numbers.sort_unstable();
        numbers.dedup();
        if numbers.len() != count {
            errors.push(format!("{type_name}: duplicate part numbers"));
        }
    }

    errors
}
