//! Plan File load/save helpers with schema + invariant validation.
//!
//! Each Plan File is owned by one worker port and only ever replaced whole.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_plan;
use crate::core::operation::WorkPacket;

pub const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan_file.v1.schema.json"
));

const PLAN_PREFIX: &str = "batch_plan_";
const PLAN_SUFFIX: &str = ".json";

/// Load and validate a Plan File (schema + invariants).
pub fn load_plan(path: &Path) -> Result<WorkPacket> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate plan {}", path.display()))?;
    let packet: WorkPacket = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    let errors = validate_plan(&packet);
    if !errors.is_empty() {
        return Err(anyhow!(
            "plan invariants failed for {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    debug!(path = %path.display(), parts = packet.tests.len(), "plan loaded");
    Ok(packet)
}

/// Atomically write a Plan File (temp file + rename).
pub fn write_plan(path: &Path, packet: &WorkPacket) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(packet).context("serialize plan")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

pub fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Worker port encoded in a Plan File name, if `path` is one.
pub fn plan_port(path: &Path) -> Option<u16> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PLAN_PREFIX)?
        .strip_suffix(PLAN_SUFFIX)?
        .parse()
        .ok()
}

/// Plan Files in `dir`, sorted by port. A missing directory has none.
pub fn list_plans(dir: &Path) -> Result<Vec<(u16, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut plans = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read dir entry in {}", dir.display()))?
            .path();
        if let Some(port) = plan_port(&path) {
            plans.push((port, path));
        }
    }
    plans.sort();
    Ok(plans)
}

/// Load every Plan File in `dir`, in port order.
pub fn load_all_plans(dir: &Path) -> Result<Vec<WorkPacket>> {
    list_plans(dir)?
        .iter()
        .map(|(_, path)| load_plan(path))
        .collect()
}

/// Remove every Plan File in `dir`; returns how many were removed.
pub fn clear_plans(dir: &Path) -> Result<usize> {
    let plans = list_plans(dir)?;
    for (_, path) in &plans {
        fs::remove_file(path).with_context(|| format!("remove plan {}", path.display()))?;
    }
    Ok(plans.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::OperationStatus;
    use crate::test_support::component_packet;
    use serde_json::json;

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("batch_plan_30001.json");
        let mut packet = component_packet(30001, &[2, 1]);
        packet.tests[0].operations[0].status = Some(OperationStatus::Fail);
        packet.tests[0].operations[0].error = Some("boom".to_string());

        write_plan(&path, &packet).expect("write");
        assert_eq!(load_plan(&path).expect("load"), packet);
    }

    #[test]
    fn schema_rejects_unknown_status() {
        let mut value = serde_json::to_value(component_packet(30001, &[1])).expect("value");
        value["tests"][0]["operations"][0]["status"] = json!("DONE");
        let err = validate_schema(&value).expect_err("schema");
        assert!(err.to_string().contains("plan schema validation failed"));
    }

    #[test]
    fn load_rejects_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("batch_plan_30001.json");
        let mut packet = component_packet(30001, &[1]);
        packet.tests[0].operations[1].status = Some(OperationStatus::Fail);
        write_plan(&path, &packet).expect("write");
        let err = load_plan(&path).expect_err("invariants");
        assert!(err.to_string().contains("FAIL without error"));
    }

    #[test]
    fn lists_and_clears_only_plan_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        for port in [30003, 30001] {
            write_plan(
                &dir.join(format!("batch_plan_{port}.json")),
                &component_packet(port, &[1]),
            )
            .expect("write");
        }
        fs::write(dir.join("notes.txt"), "keep").expect("write");

        let ports: Vec<u16> = list_plans(dir)
            .expect("list")
            .into_iter()
            .map(|(port, _)| port)
            .collect();
        assert_eq!(ports, vec![30001, 30003]);
        assert_eq!(load_all_plans(dir).expect("load all").len(), 2);

        assert_eq!(clear_plans(dir).expect("clear"), 2);
        assert!(list_plans(dir).expect("list").is_empty());
        assert!(dir.join("notes.txt").exists());
    }

    #[test]
    fn missing_directory_has_no_plans() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(list_plans(&temp.path().join("absent")).expect("list").is_empty());
    }
}
