//! Validation for the `.mutation/` layout: config, catalog markers and plans.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::debug;

use crate::core::dedupe::validate_dedupe;
use crate::io::catalog_store::load_catalog;
use crate::io::config::load_config;
use crate::io::init::RunPaths;
use crate::io::plan_store::{list_plans, load_plan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub types: usize,
    pub plans: usize,
}

/// Validate everything under `.mutation/`, reporting all problems at once.
///
/// A missing config stops validation immediately; other problems are collected.
pub fn validate_run(root: &Path) -> Result<ValidateOutcome> {
    let paths = RunPaths::new(root);
    if !paths.state_dir.is_dir() {
        bail!(
            "missing {} (run `mutation-runner init`)",
            paths.state_dir.display()
        );
    }
    load_config(&paths.config_path)?;

    let mut errors: Vec<String> = Vec::new();
    let mut types = 0;
    match load_catalog(&paths.catalog_path) {
        Ok(catalog) => {
            types = catalog.total_types;
            errors.extend(
                validate_dedupe(&catalog.type_guide)
                    .into_iter()
                    .map(|err| format!("catalog: {err}")),
            );
        }
        Err(err) => errors.push(format!("{err:#}")),
    }

    let plans = list_plans(&paths.plans_dir)?;
    for (port, path) in &plans {
        if let Err(err) = load_plan(path) {
            errors.push(format!("port {port}: {err:#}"));
        }
    }

    if !errors.is_empty() {
        bail!("validation failed:\n- {}", errors.join("\n- "));
    }
    debug!(types, plans = plans.len(), "run directory valid");
    Ok(ValidateOutcome {
        types,
        plans: plans.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::OperationStatus;
    use crate::core::types::DuplicateRef;
    use crate::io::plan_store::write_plan;
    use crate::test_support::{TestWorkspace, catalog_with, component_packet};
    use std::fs;

    #[test]
    fn fresh_workspace_is_valid() {
        let workspace = TestWorkspace::new();
        let outcome = validate_run(workspace.root()).expect("valid");
        assert_eq!(outcome, ValidateOutcome { types: 0, plans: 0 });
    }

    #[test]
    fn uninitialized_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_run(temp.path()).expect_err("missing");
        assert!(err.to_string().contains("mutation-runner init"));
    }

    #[test]
    fn reports_catalog_and_plan_errors_together() {
        let workspace = TestWorkspace::new();
        let mut catalog = catalog_with(&["game::A"], None);
        catalog.type_guide["game::A"].mutation_paths[".value"].duplicate_of =
            Some(DuplicateRef::Representative {
                parent: "game::Missing".to_string(),
                path: ".x".to_string(),
            });
        workspace.write_catalog(&catalog);

        let mut packet = component_packet(30002, &[1]);
        packet.tests[0].operations[0].status = Some(OperationStatus::Fail);
        write_plan(&workspace.paths.plan_path(30002), &packet).expect("plan");
        write_plan(
            &workspace.paths.plan_path(30001),
            &component_packet(30001, &[1]),
        )
        .expect("plan");

        let err = validate_run(workspace.root()).expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("catalog: "), "{message}");
        assert!(message.contains("port 30002: "), "{message}");
        assert!(!message.contains("port 30001"), "{message}");
    }

    #[test]
    fn missing_config_stops_validation() {
        let workspace = TestWorkspace::new();
        fs::remove_file(&workspace.paths.config_path).expect("remove");
        let err = validate_run(workspace.root()).expect_err("config");
        assert!(format!("{err:#}").contains("config"));
    }
}
