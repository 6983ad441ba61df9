use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;
use vsolve_core::variables::{Registry, WorkspaceRecord};
use vsolve_core::EngineConfig;

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    EngineConfig::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
}

pub fn load_workspace(path: &Path, config: EngineConfig) -> Result<Registry> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading workspace {}", path.display()))?;
    let record = WorkspaceRecord::from_json(&text)
        .with_context(|| format!("parsing workspace {}", path.display()))?;
    let registry = Registry::from_record(&record, config)?;
    info!("Loaded {} solutions from {}", registry.len(), path.display());
    Ok(registry)
}

pub fn save_workspace(registry: &Registry, path: &Path) -> Result<()> {
    let json = registry.to_record().to_json()?;
    fs::write(path, json).with_context(|| format!("writing workspace {}", path.display()))?;
    info!("Saved {} solutions to {}", registry.len(), path.display());
    Ok(())
}
