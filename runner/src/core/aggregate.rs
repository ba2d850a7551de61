//! Merge per-part results into one verdict per type.

use indexmap::IndexMap;

use crate::core::coordinator::NOT_EXECUTED;
use crate::core::operation::{Operation, OperationKind, Part, WorkPacket};
use crate::core::types::{Catalog, TestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    /// Crash-class failure; the type goes back to `untested`.
    AutoRetry,
    /// Genuine failure that a human should look at.
    NeedsReview,
    /// No operation of the type ever ran.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeVerdict {
    pub type_name: String,
    pub verdict: Verdict,
    pub reason: Option<String>,
    pub mutations_passed: Vec<String>,
    pub operations_attempted: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_number: u32,
    pub passed: usize,
    pub auto_retried: usize,
    pub needs_review: usize,
    pub not_started: usize,
    pub needs_review_types: Vec<String>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.passed + self.auto_retried + self.needs_review + self.not_started
    }
}

fn first_failure<'a>(parts: &[&'a Part]) -> Option<(&'a Part, &'a Operation, String)> {
    parts.iter().find_map(|part| {
        part.operations.iter().find(|op| !op.is_success()).map(|op| {
            let error = op
                .error
                .clone()
                .unwrap_or_else(|| format!("operation {NOT_EXECUTED}"));
            (*part, op, error)
        })
    })
}

fn failure_reason(part: &Part, op: &Operation, error: &str) -> String {
    let target = match op.path() {
        Some(path) => format!("path '{path}'"),
        None => op.tool().to_string(),
    };
    format!(
        "{}: operation {} ({target}): {error}",
        part.label(),
        op.operation_id
    )
}

/// Judge one type from all of its parts.
pub fn judge_type(type_name: &str, parts: &mut [&Part]) -> TypeVerdict {
    parts.sort_by_key(|part| part.part_number);
    let parts: &[&Part] = parts;
    let operations = || parts.iter().copied().flat_map(|part| part.operations.iter());

    let mut mutations_passed: Vec<String> = Vec::new();
    for op in operations() {
        if let (true, OperationKind::Mutate { path, .. }) = (op.is_success(), &op.kind) {
            if !mutations_passed.contains(path) {
                mutations_passed.push(path.clone());
            }
        }
    }
    let operations_attempted = operations().filter(|op| op.call_count > 0).count() as u32;

    let (verdict, reason) = if operations().all(|op| op.status.is_none()) {
        (Verdict::NotStarted, None)
    } else {
        match first_failure(parts) {
            None => (Verdict::Passed, None),
            Some((part, op, error)) => {
                let verdict = if error.contains(NOT_EXECUTED) {
                    Verdict::AutoRetry
                } else {
                    Verdict::NeedsReview
                };
                (verdict, Some(failure_reason(part, op, &error)))
            }
        }
    };

    TypeVerdict {
        type_name: type_name.to_string(),
        verdict,
        reason,
        mutations_passed,
        operations_attempted,
    }
}

/// Group parts across every packet by type (first appearance order) and judge each.
pub fn judge_packets(packets: &[WorkPacket]) -> Vec<TypeVerdict> {
    let mut grouped: IndexMap<&str, Vec<&Part>> = IndexMap::new();
    for packet in packets {
        for part in &packet.tests {
            grouped.entry(part.type_name.as_str()).or_default().push(part);
        }
    }
    grouped
        .into_iter()
        .map(|(type_name, mut parts)| judge_type(type_name, &mut parts))
        .collect()
}

/// Write verdicts into the catalog and release every type of `batch_number`.
///
/// Batch types without any part in the plans count as not started.
pub fn apply_verdicts(
    catalog: &mut Catalog,
    batch_number: u32,
    verdicts: &[TypeVerdict],
) -> BatchSummary {
    let mut summary = BatchSummary {
        batch_number,
        ..BatchSummary::default()
    };
    let by_name: IndexMap<&str, &TypeVerdict> = verdicts
        .iter()
        .map(|verdict| (verdict.type_name.as_str(), verdict))
        .collect();

    for record in catalog.type_guide.values_mut() {
        if record.batch_number != Some(batch_number) {
            continue;
        }
        record.batch_number = None;
        let Some(verdict) = by_name.get(record.type_name.as_str()) else {
            summary.not_started += 1;
            continue;
        };
        match verdict.verdict {
            Verdict::NotStarted => {
                summary.not_started += 1;
                continue;
            }
            Verdict::Passed => {
                record.test_status = TestStatus::Passed;
                record.fail_reason = None;
                summary.passed += 1;
            }
            Verdict::AutoRetry => {
                record.test_status = TestStatus::Untested;
                record.fail_reason.clone_from(&verdict.reason);
                summary.auto_retried += 1;
            }
            Verdict::NeedsReview => {
                record.test_status = TestStatus::Failed;
                record.fail_reason.clone_from(&verdict.reason);
                summary.needs_review += 1;
                summary.needs_review_types.push(record.type_name.clone());
            }
        }
        record.mutations_passed.clone_from(&verdict.mutations_passed);
        record.operations_attempted = verdict.operations_attempted;
    }

    catalog.refresh_counts();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::OperationStatus;
    use crate::test_support::{catalog_with, component_packet, split_packet};

    fn pass_all(part: &mut Part) {
        for op in &mut part.operations {
            op.status = Some(OperationStatus::Success);
            op.call_count = 1;
        }
    }

    #[test]
    fn pass_pass_is_pass() {
        let mut packet = split_packet("game::Big", 30001, 2);
        packet.tests.iter_mut().for_each(pass_all);
        let verdicts = judge_packets(&[packet]);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].verdict, Verdict::Passed);
        assert_eq!(verdicts[0].reason, None);
        assert_eq!(verdicts[0].mutations_passed, vec![".f0", ".f1"]);
        assert_eq!(verdicts[0].operations_attempted, 4);
    }

    #[test]
    fn pass_fail_names_the_failing_part() {
        let mut packet = split_packet("game::Big", 30001, 2);
        pass_all(&mut packet.tests[0]);
        pass_all(&mut packet.tests[1]);
        let op = &mut packet.tests[1].operations[1];
        op.status = Some(OperationStatus::Fail);
        op.error = Some("invalid enum variant".to_string());

        // Parts arrive out of order across plan files.
        packet.tests.reverse();
        let verdict = &judge_packets(&[packet])[0];
        assert_eq!(verdict.verdict, Verdict::NeedsReview);
        let reason = verdict.reason.as_deref().expect("reason");
        assert!(reason.starts_with("part 2/2"), "{reason}");
        assert!(reason.contains("path '.f1'"));
        assert!(reason.contains("invalid enum variant"));
    }

    #[test]
    fn unset_operations_in_started_type_are_auto_retried() {
        let mut packet = component_packet(30001, &[2]);
        packet.tests[0].operations[0].status = Some(OperationStatus::Success);
        let verdict = &judge_packets(&[packet])[0];
        assert_eq!(verdict.verdict, Verdict::AutoRetry);
        assert!(verdict.reason.as_deref().expect("reason").contains(NOT_EXECUTED));
    }

    #[test]
    fn untouched_type_is_not_started() {
        let packet = component_packet(30001, &[2]);
        assert_eq!(judge_packets(&[packet])[0].verdict, Verdict::NotStarted);
    }

    #[test]
    fn apply_updates_catalog_and_clears_batch() {
        let mut catalog = catalog_with(&["game::A", "game::B", "game::C", "game::D"], Some(3));
        let verdict = |name: &str, verdict, reason: Option<&str>| TypeVerdict {
            type_name: name.to_string(),
            verdict,
            reason: reason.map(str::to_string),
            mutations_passed: Vec::new(),
            operations_attempted: 1,
        };
        let verdicts = vec![
            verdict("game::A", Verdict::Passed, None),
            verdict("game::B", Verdict::AutoRetry, Some("operation not executed")),
            verdict("game::C", Verdict::NeedsReview, Some("bad value")),
        ];
        let summary = apply_verdicts(&mut catalog, 3, &verdicts);

        assert_eq!(
            (summary.passed, summary.auto_retried, summary.needs_review, summary.not_started),
            (1, 1, 1, 1)
        );
        assert_eq!(summary.needs_review_types, vec!["game::C"]);
        assert!(catalog.type_guide.values().all(|r| r.batch_number.is_none()));

        let status = |name: &str| catalog.type_guide[name].test_status;
        assert_eq!(status("game::A"), TestStatus::Passed);
        assert_eq!(status("game::B"), TestStatus::Untested);
        assert_eq!(status("game::C"), TestStatus::Failed);
        assert_eq!(status("game::D"), TestStatus::Untested);
        assert_eq!(
            catalog.type_guide["game::B"].fail_reason.as_deref(),
            Some("operation not executed")
        );
        assert_eq!(catalog.tested_count, 2);
    }

    #[test]
    fn other_batches_are_left_alone() {
        let mut catalog = catalog_with(&["game::A"], Some(2));
        let summary = apply_verdicts(&mut catalog, 3, &[]);
        assert_eq!(summary.total(), 0);
        assert_eq!(catalog.type_guide["game::A"].batch_number, Some(2));
    }
}
