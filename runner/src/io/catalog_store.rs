//! Catalog Store (`.mutation/catalog.json`) load/save.
//!
//! Only controller commands (`dedupe`, `prepare`, `process-results`) write it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::types::Catalog;

/// Load the catalog. Summary counters are recomputed from `type_guide`.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read catalog {}", path.display()))?;
    let mut catalog: Catalog = serde_json::from_str(&contents)
        .with_context(|| format!("parse catalog {}", path.display()))?;
    for (key, record) in &catalog.type_guide {
        if key != &record.type_name {
            bail!(
                "catalog {}: key '{key}' does not match type_name '{}'",
                path.display(),
                record.type_name
            );
        }
    }
    catalog.refresh_counts();
    debug!(
        path = %path.display(),
        types = catalog.total_types,
        tested = catalog.tested_count,
        "catalog loaded"
    );
    Ok(catalog)
}

/// Atomically write the catalog (temp file + rename).
pub fn write_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    debug!(path = %path.display(), types = catalog.type_guide.len(), "writing catalog");
    let mut buf = serde_json::to_string_pretty(catalog).context("serialize catalog")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
