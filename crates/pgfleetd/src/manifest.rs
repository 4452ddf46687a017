//! Cluster manifests and the standalone secrets file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use pgfleet_infra::sim::StaticCredentials;
use pgfleet_state::ClusterSpec;

/// Read and validate one TOML cluster manifest.
pub fn load_manifest(path: &Path) -> anyhow::Result<ClusterSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let spec: ClusterSpec =
        toml::from_str(&content).with_context(|| format!("parsing manifest {}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

/// Every `*.toml` manifest in `dir`, in file name order.
pub fn load_manifests(dir: &Path) -> anyhow::Result<Vec<ClusterSpec>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(|p| load_manifest(p)).collect()
}

/// Secrets file: one table per secret name, one string per key.
///
/// ```toml
/// [orders-app]
/// password = "…"
/// ```
pub fn load_secrets(path: &Path) -> anyhow::Result<StaticCredentials> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading secrets {}", path.display()))?;
    let tables: BTreeMap<String, BTreeMap<String, String>> =
        toml::from_str(&content).with_context(|| format!("parsing secrets {}", path.display()))?;

    let mut credentials = StaticCredentials::new();
    for (name, keys) in &tables {
        for (key, value) in keys {
            credentials.insert(name, key, value);
        }
    }
    Ok(credentials)
}
