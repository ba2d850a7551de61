//! Convert a type's declared mutation paths into an ordered operation list.
//!
//! The output is deterministic: create, then query (components only), then
//! per path and example a mutation, each preceded by a root-setter whenever
//! the required root value changes.

use serde_json::Value;

use crate::core::operation::{EntityRef, Operation, OperationKind};
use crate::core::types::{MutationKind, PathSpec, ROOT_PATH, TypeRecord};
use crate::core::value::placeholder_paths;

/// Build the full operation sequence for `record`. Operation ids are left at 0;
/// the packing planner assigns them per Plan File.
pub fn sequence_operations(record: &TypeRecord) -> Vec<Operation> {
    let mut ops = Vec::new();

    if let Some(spawn) = &record.spawn_format {
        let mut create = Operation::new(
            &record.type_name,
            record.mutation_kind,
            OperationKind::Create {
                value: spawn.clone(),
            },
        );
        create.entity_placeholders = placeholder_paths(spawn);
        ops.push(create);
    }

    if record.mutation_kind == MutationKind::Component {
        ops.push(Operation::new(
            &record.type_name,
            record.mutation_kind,
            OperationKind::Query,
        ));
    }

    ops.extend(mutation_operations(record));
    ops
}

/// Only the mutation sub-sequence (root-setters and leaf mutations).
pub fn mutation_operations(record: &TypeRecord) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut last_root: Option<Value> = None;

    for (path, spec) in record.testable_paths() {
        if !spec.is_mutable() {
            continue;
        }
        push_path_operations(record, path, spec, &mut last_root, &mut ops);
    }
    ops
}

fn push_path_operations(
    record: &TypeRecord,
    path: &str,
    spec: &PathSpec,
    last_root: &mut Option<Value>,
    ops: &mut Vec<Operation>,
) {
    for example in spec.all_examples() {
        // Variant metadata without a payload cannot be tested on its own.
        let Some(value) = example.example else {
            continue;
        };

        let required_root = example.root_example.or_else(|| spec.root_example.clone());
        if let Some(root) = required_root {
            if last_root.as_ref() != Some(&root) {
                ops.push(mutation(record, ROOT_PATH, root.clone(), Vec::new()));
                *last_root = Some(root);
            }
        }

        let leaf = mutation(record, path, value, example.applicable_variants);
        if path == ROOT_PATH {
            // A declared root example replaces whatever root was applied before.
            *last_root = leaf.value().cloned();
        }
        ops.push(leaf);
    }
}

fn mutation(record: &TypeRecord, path: &str, value: Value, variants: Vec<String>) -> Operation {
    let placeholders = placeholder_paths(&value);
    let mut op = Operation::new(
        &record.type_name,
        record.mutation_kind,
        OperationKind::Mutate {
            path: path.to_string(),
            value,
            variants,
        },
    );
    op.entity_placeholders = placeholders;
    if record.mutation_kind == MutationKind::Component {
        op.entity = Some(EntityRef::PENDING);
    }
    op
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DuplicateRef, PathExample};
    use crate::test_support::{mutable_path, not_mutable_path, rooted_path, type_record};
    use serde_json::json;

    fn paths(ops: &[Operation]) -> Vec<String> {
        ops.iter()
            .map(|op| match &op.kind {
                OperationKind::Create { .. } => "create".to_string(),
                OperationKind::Query => "query".to_string(),
                OperationKind::Mutate { path, .. } => format!("mutate:{path}"),
            })
            .collect()
    }

    #[test]
    fn component_sequence_is_create_query_mutations() {
        let mut record = type_record(
            "game::Health",
            MutationKind::Component,
            vec![
                (ROOT_PATH, mutable_path(json!({"value": 3}))),
                (".value", mutable_path(json!(5))),
            ],
        );
        record.spawn_format = Some(json!({"value": 1}));

        let ops = sequence_operations(&record);
        assert_eq!(
            paths(&ops),
            vec!["create", "query", "mutate:", "mutate:.value"]
        );
        assert!(ops[2..].iter().all(|op| op.entity == Some(EntityRef::PENDING)));
    }

    #[test]
    fn resource_sequence_has_no_query_or_entity() {
        let mut record = type_record(
            "game::Score",
            MutationKind::Resource,
            vec![(".points", mutable_path(json!(10)))],
        );
        record.spawn_format = Some(json!({"points": 0}));

        let ops = sequence_operations(&record);
        assert_eq!(paths(&ops), vec!["create", "mutate:.points"]);
        assert!(ops.iter().all(|op| op.entity.is_none()));
    }

    #[test]
    fn skips_not_mutable_and_duplicate_paths() {
        let mut duplicate = mutable_path(json!(1));
        duplicate.duplicate_of = Some(DuplicateRef::ChildOfDuplicate);
        let record = type_record(
            "game::Health",
            MutationKind::Component,
            vec![
                (".locked", not_mutable_path()),
                (".dup", duplicate),
                (".ok", mutable_path(json!(2))),
            ],
        );
        let ops = sequence_operations(&record);
        assert_eq!(paths(&ops), vec!["query", "mutate:.ok"]);
    }

    #[test]
    fn root_setters_are_emitted_once_per_distinct_root() {
        let record = type_record(
            "game::Shape",
            MutationKind::Component,
            vec![
                (".Circle.radius", rooted_path(json!({"Circle": {"radius": 1.0}}), json!(2.0))),
                (".Circle.filled", rooted_path(json!({"Circle": {"radius": 1.0}}), json!(true))),
                (".Square.side", rooted_path(json!({"Square": {"side": 1.0}}), json!(4.0))),
            ],
        );
        let ops = sequence_operations(&record);
        assert_eq!(
            paths(&ops),
            vec![
                "query",
                "mutate:",
                "mutate:.Circle.radius",
                "mutate:.Circle.filled",
                "mutate:",
                "mutate:.Square.side",
            ]
        );
        assert_eq!(ops[1].value(), Some(&json!({"Circle": {"radius": 1.0}})));
        assert_eq!(ops[4].value(), Some(&json!({"Square": {"side": 1.0}})));
    }

    #[test]
    fn variant_examples_without_payload_are_skipped() {
        let spec = PathSpec {
            examples: vec![
                PathExample {
                    example: Some(json!("A")),
                    applicable_variants: vec!["A".to_string()],
                    root_example: None,
                },
                PathExample {
                    example: None,
                    applicable_variants: vec!["B".to_string()],
                    root_example: None,
                },
            ],
            ..PathSpec::default()
        };
        let record = type_record("game::Mode", MutationKind::Resource, vec![(".mode", spec)]);
        let ops = sequence_operations(&record);
        assert_eq!(paths(&ops), vec!["mutate:.mode"]);
        match &ops[0].kind {
            OperationKind::Mutate { variants, .. } => assert_eq!(variants, &vec!["A".to_string()]),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn per_example_root_override_triggers_new_root_setter() {
        let spec = PathSpec {
            root_example: Some(json!({"Some": 1})),
            examples: vec![
                PathExample {
                    example: Some(json!(5)),
                    applicable_variants: vec!["Some".to_string()],
                    root_example: None,
                },
                PathExample {
                    example: Some(json!(6)),
                    applicable_variants: vec!["Other".to_string()],
                    root_example: Some(json!({"Other": 0})),
                },
            ],
            ..PathSpec::default()
        };
        let record = type_record("game::Opt", MutationKind::Resource, vec![(".0", spec)]);
        let ops = sequence_operations(&record);
        assert_eq!(
            paths(&ops),
            vec!["mutate:", "mutate:.0", "mutate:", "mutate:.0"]
        );
        assert_eq!(ops[2].value(), Some(&json!({"Other": 0})));
    }

    #[test]
    fn placeholders_are_flagged_on_create_and_mutations() {
        let mut record = type_record(
            "game::ChildOf",
            MutationKind::Component,
            vec![(".parent", mutable_path(json!("$entity")))],
        );
        record.spawn_format = Some(json!({"parent": "$entity"}));
        let ops = sequence_operations(&record);
        assert_eq!(ops[0].entity_placeholders, vec!["/parent"]);
        assert_eq!(ops[2].entity_placeholders, vec![String::new()]);
    }

    /// Every leaf mutation that declares a root is preceded by that exact root value.
    #[test]
    fn leaf_mutations_follow_their_required_root() {
        let record = type_record(
            "game::Shape",
            MutationKind::Resource,
            vec![
                (".A.x", rooted_path(json!({"A": {"x": 0}}), json!(1))),
                (".B", mutable_path(json!(3))),
                (".A.y", rooted_path(json!({"A": {"x": 0}}), json!(2))),
                (".C.z", rooted_path(json!({"C": {"z": 0}}), json!(4))),
            ],
        );
        let ops = sequence_operations(&record);
        for (index, op) in ops.iter().enumerate() {
            let Some(path) = op.path() else { continue };
            let Some(spec) = record.mutation_paths.get(path) else {
                continue;
            };
            if let Some(root) = &spec.root_example {
                let applied = ops[..index]
                    .iter()
                    .rev()
                    .find(|prev| prev.is_root_setter())
                    .and_then(|prev| prev.value());
                assert_eq!(applied, Some(root), "path {path} missing its root");
            }
        }
    }
}
