//! Test-only builders for catalogs, plan packets and run workspaces.

use std::cell::Cell;
use std::path::Path;

use chrono::{NaiveDateTime, TimeDelta};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Value, json};

use crate::core::log_event::parse_timestamp;
use crate::core::operation::{EntityRef, Operation, OperationKind, Part, WorkPacket};
use crate::core::packing::assign_operation_ids;
use crate::core::types::{Catalog, Mutability, MutationKind, PathSpec, TypeRecord};
use crate::io::catalog_store::{load_catalog, write_catalog};
use crate::io::clock::Clock;
use crate::io::config::{RunConfig, write_config};
use crate::io::init::{InitOptions, RunPaths, init_run};

pub use crate::io::exec_log::MemoryLog;

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp.
pub fn ts(raw: &str) -> NaiveDateTime {
    parse_timestamp(raw).expect("timestamp")
}

/// Create an untested type record with paths in the given order.
pub fn type_record(name: &str, kind: MutationKind, paths: Vec<(&str, PathSpec)>) -> TypeRecord {
    TypeRecord {
        type_name: name.to_string(),
        mutation_kind: kind,
        spawn_format: None,
        mutation_paths: paths
            .into_iter()
            .map(|(path, spec)| (path.to_string(), spec))
            .collect(),
        test_status: Default::default(),
        batch_number: None,
        fail_reason: None,
        mutations_passed: Vec::new(),
        operations_attempted: 0,
    }
}

/// Mutable path with a single example.
pub fn mutable_path(example: Value) -> PathSpec {
    PathSpec {
        example: Some(example),
        ..PathSpec::default()
    }
}

pub fn not_mutable_path() -> PathSpec {
    PathSpec {
        mutability: Mutability::NotMutable,
        ..PathSpec::default()
    }
}

/// Mutable path that needs `root` applied first.
pub fn rooted_path(root: Value, example: Value) -> PathSpec {
    PathSpec {
        root_example: Some(root),
        ..mutable_path(example)
    }
}

/// Mutable path whose value is of nested type `type_name`.
pub fn typed_path(type_name: &str, example: Value) -> PathSpec {
    PathSpec {
        type_name: Some(type_name.to_string()),
        ..mutable_path(example)
    }
}

/// Component type with a spawn format and `mutations` plain leaf paths `.f0..`.
pub fn component_type(name: &str, mutations: usize) -> TypeRecord {
    let paths: Vec<(String, PathSpec)> = (0..mutations)
        .map(|i| (format!(".f{i}"), mutable_path(json!(i))))
        .collect();
    let mut record = type_record(
        name,
        MutationKind::Component,
        paths.iter().map(|(p, s)| (p.as_str(), s.clone())).collect(),
    );
    record.spawn_format = Some(json!({ "f0": 0 }));
    record
}

/// Catalog holding one resource type per name, all in `batch`.
pub fn catalog_with(names: &[&str], batch: Option<u32>) -> Catalog {
    let mut type_guide = IndexMap::new();
    for name in names {
        let mut record = type_record(
            name,
            MutationKind::Resource,
            vec![(".value", mutable_path(json!(1)))],
        );
        record.batch_number = batch;
        type_guide.insert(name.to_string(), record);
    }
    let mut catalog = Catalog {
        type_guide,
        ..Catalog::default()
    };
    catalog.refresh_counts();
    catalog
}

fn query(type_name: &str) -> Operation {
    Operation::new(type_name, MutationKind::Component, OperationKind::Query)
}

fn mutate(type_name: &str, path: &str, value: Value) -> Operation {
    let mut op = Operation::new(
        type_name,
        MutationKind::Component,
        OperationKind::Mutate {
            path: path.to_string(),
            value,
            variants: Vec::new(),
        },
    );
    op.entity = Some(EntityRef::PENDING);
    op
}

fn packet(port: u16, tests: Vec<Part>) -> WorkPacket {
    let mut packet = WorkPacket {
        batch_number: 1,
        worker_port: port,
        tests,
    };
    assign_operation_ids(&mut packet);
    packet
}

/// One single-part component type `game::T<i>` per entry, each part being a
/// query followed by that many mutations.
pub fn component_packet(port: u16, mutations_per_part: &[usize]) -> WorkPacket {
    let tests = mutations_per_part
        .iter()
        .enumerate()
        .map(|(index, count)| {
            let type_name = format!("game::T{index}");
            let mut operations = vec![query(&type_name)];
            operations.extend((0..*count).map(|j| mutate(&type_name, &format!(".f{j}"), json!(j))));
            Part {
                type_name,
                mutation_kind: MutationKind::Component,
                part_number: 1,
                total_parts: 1,
                operations,
            }
        })
        .collect();
    packet(port, tests)
}

/// One type split into `total` parts, part `k` being a query plus mutation `.f<k-1>`.
pub fn split_packet(type_name: &str, port: u16, total: u32) -> WorkPacket {
    let tests = (1..=total)
        .map(|part_number| Part {
            type_name: type_name.to_string(),
            mutation_kind: MutationKind::Component,
            part_number,
            total_parts: total,
            operations: vec![
                query(type_name),
                mutate(type_name, &format!(".f{}", part_number - 1), json!(part_number)),
            ],
        })
        .collect();
    packet(port, tests)
}

/// Default fatal error regexes.
pub fn fatal_patterns() -> Vec<Regex> {
    RunConfig::default().fatal_patterns().expect("default patterns")
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<NaiveDateTime>,
}

impl ManualClock {
    pub fn at(raw: &str) -> Self {
        Self {
            now: Cell::new(ts(raw)),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now.set(self.now.get() + TimeDelta::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }
}

/// Initialized `.mutation/` directory inside a temp dir.
pub struct TestWorkspace {
    _dir: tempfile::TempDir,
    pub paths: RunPaths,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self::with_config(&RunConfig::default())
    }

    pub fn with_config(config: &RunConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = init_run(dir.path(), &InitOptions { force: false }).expect("init");
        write_config(&paths.config_path, config).expect("write config");
        Self { _dir: dir, paths }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn write_catalog(&self, catalog: &Catalog) {
        write_catalog(&self.paths.catalog_path, catalog).expect("write catalog");
    }

    pub fn catalog(&self) -> Catalog {
        load_catalog(&self.paths.catalog_path).expect("load catalog")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
