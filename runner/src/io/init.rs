//! Initialization helpers for `.mutation/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::catalog_store::write_catalog;
use super::config::{RunConfig, write_config};
use crate::core::types::Catalog;

/// All canonical paths within `.mutation/` for a project root.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub plans_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub catalog_path: PathBuf,
    pub log_path: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".mutation");
        Self {
            root,
            plans_dir: state_dir.join("plans"),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            catalog_path: state_dir.join("catalog.json"),
            log_path: state_dir.join("execution.log"),
            state_dir,
        }
    }

    /// Plan File for the worker on `port`.
    pub fn plan_path(&self, port: u16) -> PathBuf {
        self.plans_dir.join(format!("batch_plan_{port}.json"))
    }

    /// Where the log of `batch` is kept once a newer batch starts.
    pub fn archived_log_path(&self, batch: u32) -> PathBuf {
        self.state_dir.join(format!("execution.batch{batch}.log"))
    }
}

/// Options for `init_run`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config (the catalog is never overwritten).
    pub force: bool,
}

/// Create `.mutation/` scaffolding in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_run(root: &Path, options: &InitOptions) -> Result<RunPaths> {
    let paths = RunPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .mutation exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.plans_dir)?;
    fs::write(&paths.gitignore_path, MUTATION_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &RunConfig::default())?;
    if !paths.catalog_path.exists() {
        write_catalog(&paths.catalog_path, &Catalog::default())?;
    }

    info!(root = %root.display(), "initialized .mutation");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const MUTATION_GITIGNORE: &str = "plans/\n*.log\n*.tmp\n";
