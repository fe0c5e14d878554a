//! Atomic JSON state files.
//!
//! Every persisted map (assets, build jobs, pipelines) is one JSON file
//! holding `id -> record`. Writes go to a temp file first and are renamed
//! into place so a crash never leaves a half-written state file behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Write a map to `path` atomically (write temp + rename).
pub fn save_map<T: Serialize>(path: &Path, map: &BTreeMap<String, T>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state dir {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");

    let json =
        serde_json::to_string_pretty(map).context("failed to serialize state map to JSON")?;

    fs::write(&tmp_path, json)
        .with_context(|| format!("failed to write state file {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename state file to {}", path.display()))?;

    Ok(())
}

/// Load a map from `path`. A missing file is an empty map; a corrupt file
/// is an error (restart replay is the authoritative recovery path, so we
/// refuse to silently drop state).
pub fn load_map<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state JSON from {}", path.display()))
}
