//! Operations, parts and work packets (the Plan File model).
//!
//! Plan Files are camelCase JSON consumed by worker processes. Operation
//! parameters are a tagged union per kind; tracking fields sit beside them
//! and are stripped before delivery (see [`ExecutionParams`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::MutationKind;

pub const TOOL_SPAWN: &str = "world.spawn_entity";
pub const TOOL_INSERT_RESOURCE: &str = "world.insert_resources";
pub const TOOL_QUERY: &str = "world.query";
pub const TOOL_MUTATE_COMPONENT: &str = "world.mutate_components";
pub const TOOL_MUTATE_RESOURCE: &str = "world.mutate_resources";

/// Recorded outcome of an operation. Absent means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Success,
    Fail,
}

impl OperationStatus {
    pub fn label(self) -> &'static str {
        match self {
            OperationStatus::Success => "SUCCESS",
            OperationStatus::Fail => "FAIL",
        }
    }
}

/// Entity handle marker serialized as the `"$entity"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityPlaceholder {
    #[serde(rename = "$entity")]
    Entity,
}

/// Entity addressed by a component operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Resolved(u64),
    Pending(EntityPlaceholder),
}

impl EntityRef {
    pub const PENDING: EntityRef = EntityRef::Pending(EntityPlaceholder::Entity);

    pub fn is_pending(self) -> bool {
        matches!(self, EntityRef::Pending(_))
    }
}

/// Kind-specific operation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Spawn the component on a new entity, or insert the resource.
    Create { value: Value },
    /// Look up an entity holding the component.
    Query,
    /// Set `value` at `path` (`""` is a root-setter).
    Mutate {
        path: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        variants: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_id: u32,
    pub type_name: String,
    pub mutation_kind: MutationKind,
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    /// JSON pointers into the value that hold the entity placeholder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_placeholders: Vec<String>,
    #[serde(default)]
    pub status: Option<OperationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub call_count: u32,
    #[serde(default)]
    pub times_provided: u32,
    /// Set when skip-remainder failed this operation without running it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl Operation {
    pub fn new(type_name: &str, mutation_kind: MutationKind, kind: OperationKind) -> Self {
        Self {
            operation_id: 0,
            type_name: type_name.to_string(),
            mutation_kind,
            kind,
            entity: None,
            entity_placeholders: Vec::new(),
            status: None,
            error: None,
            call_count: 0,
            times_provided: 0,
            skipped: false,
        }
    }

    /// Tool the worker must call to execute this operation.
    pub fn tool(&self) -> &'static str {
        match (&self.kind, self.mutation_kind) {
            (OperationKind::Create { .. }, MutationKind::Component) => TOOL_SPAWN,
            (OperationKind::Create { .. }, MutationKind::Resource) => TOOL_INSERT_RESOURCE,
            (OperationKind::Query, _) => TOOL_QUERY,
            (OperationKind::Mutate { .. }, MutationKind::Component) => TOOL_MUTATE_COMPONENT,
            (OperationKind::Mutate { .. }, MutationKind::Resource) => TOOL_MUTATE_RESOURCE,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::Mutate { path, .. } => Some(path),
            OperationKind::Create { .. } | OperationKind::Query => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            OperationKind::Create { value } | OperationKind::Mutate { value, .. } => Some(value),
            OperationKind::Query => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        match &mut self.kind {
            OperationKind::Create { value } | OperationKind::Mutate { value, .. } => Some(value),
            OperationKind::Query => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self.kind, OperationKind::Mutate { .. })
    }

    pub fn is_root_setter(&self) -> bool {
        self.path() == Some(crate::core::types::ROOT_PATH)
    }

    pub fn is_query(&self) -> bool {
        matches!(self.kind, OperationKind::Query)
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(OperationStatus::Success)
    }

    /// Eligible for (re)delivery: unset, or failed but not skipped.
    pub fn is_pending(&self) -> bool {
        match self.status {
            None => true,
            Some(OperationStatus::Fail) => !self.skipped,
            Some(OperationStatus::Success) => false,
        }
    }

    /// Short human label used in log lines and reasons.
    pub fn describe(&self) -> String {
        match &self.kind {
            OperationKind::Create { .. } => format!("{} {}", self.tool(), self.type_name),
            OperationKind::Query => format!("{} {}", self.tool(), self.type_name),
            OperationKind::Mutate { path, .. } => {
                format!("{} {} path '{}'", self.tool(), self.type_name, path)
            }
        }
    }
}

/// A contiguous slice of one type's operation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub type_name: String,
    pub mutation_kind: MutationKind,
    pub part_number: u32,
    pub total_parts: u32,
    pub operations: Vec<Operation>,
}

impl Part {
    pub fn label(&self) -> String {
        format!("part {}/{}", self.part_number, self.total_parts)
    }
}

/// Plan File contents for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkPacket {
    pub batch_number: u32,
    pub worker_port: u16,
    pub tests: Vec<Part>,
}

impl WorkPacket {
    pub fn operation_count(&self) -> usize {
        self.tests.iter().map(|part| part.operations.len()).sum()
    }
}

/// What a worker receives from `get-next`: the operation without tracking fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionParams {
    pub operation_id: u32,
    pub tool: String,
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Pointers the tested process must resolve to a real entity.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entity_placeholders: Vec<String>,
    pub part_number: u32,
    pub total_parts: u32,
}

impl ExecutionParams {
    pub fn from_operation(operation: &Operation, part: &Part) -> Self {
        Self {
            operation_id: operation.operation_id,
            tool: operation.tool().to_string(),
            type_name: operation.type_name.clone(),
            entity: operation.entity,
            path: operation.path().map(str::to_string),
            value: operation.value().cloned(),
            entity_placeholders: operation.entity_placeholders.clone(),
            part_number: part.part_number,
            total_parts: part.total_parts,
        }
    }
}
