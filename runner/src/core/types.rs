//! Catalog data model shared by the pure core.
//!
//! These types mirror `.mutation/catalog.json`. They carry no I/O and stay
//! deterministic: ordered maps preserve the declaration order that the
//! sequencer and the dedupe pass rely on.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path string addressing the whole value (root-setter target).
pub const ROOT_PATH: &str = "";

/// How a type is addressed in the tested process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Attached to an entity; mutations need an entity handle.
    Component,
    /// Singleton addressed by type name.
    Resource,
}

/// Verdict recorded in the catalog for a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Untested,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    #[default]
    Mutable,
    NotMutable,
}

/// Dedupe marker attached to a path that is not tested on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateRef {
    /// Same nested type as the representative at `(parent, path)`.
    Representative { parent: String, path: String },
    /// Descendant of a path that is itself a duplicate.
    ChildOfDuplicate,
}

/// One example value for a path.
///
/// Variant (enum) paths declare several examples, each applicable to a subset
/// of variants. An example without a payload is metadata only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathExample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applicable_variants: Vec<String>,
    /// Overrides [`PathSpec::root_example`] for this example only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_example: Option<Value>,
}

/// Mutation metadata for a single path of a type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathSpec {
    #[serde(default)]
    pub mutability: Mutability,
    /// Nested type found at this path, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Root value that must be in place before this path can be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_example: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<PathExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<DuplicateRef>,
}

impl PathSpec {
    /// All declared examples in order: the single `example` first, then `examples`.
    pub fn all_examples(&self) -> Vec<PathExample> {
        let mut out = Vec::with_capacity(self.examples.len() + 1);
        if let Some(value) = &self.example {
            out.push(PathExample {
                example: Some(value.clone()),
                applicable_variants: Vec::new(),
                root_example: None,
            });
        }
        out.extend(self.examples.iter().cloned());
        out
    }

    pub fn has_example(&self) -> bool {
        self.example.is_some() || self.examples.iter().any(|ex| ex.example.is_some())
    }

    pub fn is_mutable(&self) -> bool {
        self.mutability == Mutability::Mutable
    }
}

/// A type under test, keyed by name in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub type_name: String,
    pub mutation_kind: MutationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_format: Option<Value>,
    #[serde(default)]
    pub mutation_paths: IndexMap<String, PathSpec>,
    #[serde(default)]
    pub test_status: TestStatus,
    #[serde(default)]
    pub batch_number: Option<u32>,
    #[serde(default)]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations_passed: Vec<String>,
    #[serde(default)]
    pub operations_attempted: u32,
}

impl TypeRecord {
    /// Paths the sequencer may emit operations for (dedupe-excluded paths removed).
    pub fn testable_paths(&self) -> impl Iterator<Item = (&String, &PathSpec)> {
        self.mutation_paths
            .iter()
            .filter(|(_, spec)| spec.duplicate_of.is_none())
    }

    /// True when the type has nothing to mutate and passes without operations.
    ///
    /// Zero declared paths, or exactly one root path that is either not
    /// mutable or carries no example.
    pub fn auto_passes(&self) -> bool {
        if self.mutation_paths.is_empty() {
            return true;
        }
        if self.mutation_paths.len() != 1 {
            return false;
        }
        match self.mutation_paths.get(ROOT_PATH) {
            Some(spec) => !spec.is_mutable() || !spec.has_example(),
            None => false,
        }
    }
}

/// The master catalog (`.mutation/catalog.json`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub type_guide: IndexMap<String, TypeRecord>,
    #[serde(default)]
    pub total_types: usize,
    #[serde(default)]
    pub tested_count: usize,
    #[serde(default)]
    pub last_batch_number: u32,
}

impl Catalog {
    /// Recompute the summary counters from `type_guide`.
    pub fn refresh_counts(&mut self) {
        self.total_types = self.type_guide.len();
        self.tested_count = self
            .type_guide
            .values()
            .filter(|record| record.test_status != TestStatus::Untested)
            .count();
    }

    pub fn types_in_batch(&self, batch: u32) -> Vec<&TypeRecord> {
        self.type_guide
            .values()
            .filter(|record| record.batch_number == Some(batch))
            .collect()
    }
}
