//! Cluster description: types, loading, hostname derivation and validation
//!
//! Loading is parse → default → derive hostnames → validate; a spec returned by
//! [`load_from_str`] or [`load_from_file`] is ready for the sequencer.

mod types;
mod validation;

use std::collections::HashSet;
use std::path::Path;

pub use types::*;
pub use validation::{check_pool_entry, cidrs_overlap, validate};

use crate::{Error, Result};

/// Parse, derive hostnames and validate a cluster document
pub fn load_from_str(content: &str) -> Result<ClusterConfig> {
    let mut config: ClusterConfig = serde_yaml::from_str(content)
        .map_err(|e| Error::validation(format!("failed to parse cluster YAML: {e}")))?;
    assign_hostnames(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Read and load a cluster document from disk
pub fn load_from_file(path: &Path) -> Result<ClusterConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!("failed to read {}: {e}", path.display()))
    })?;
    load_from_str(&content)
}

/// Fill in hostnames for nodes that have none.
///
/// Masters become `{cluster}-master-NN`, GPU workers `{cluster}-gpu-node-NN` and
/// other workers `{cluster}-node-NN`. Each partition counts from 01 in spec order.
/// Explicit hostnames are kept, and a derived name that would collide with one
/// is skipped.
pub fn assign_hostnames(config: &mut ClusterConfig) {
    let cluster = config.metadata.name.clone();
    let taken: HashSet<String> = config
        .spec
        .nodes
        .iter()
        .filter(|n| !n.hostname.is_empty())
        .map(|n| n.hostname.clone())
        .collect();

    let mut masters = 0u32;
    let mut workers = 0u32;
    let mut gpu_workers = 0u32;

    for node in config.spec.nodes.iter_mut() {
        if !node.hostname.is_empty() {
            continue;
        }

        let (tag, counter) = match (node.role, node.gpu) {
            (NodeRole::Master, _) => ("master", &mut masters),
            (NodeRole::Worker, true) => ("gpu-node", &mut gpu_workers),
            (NodeRole::Worker, false) => ("node", &mut workers),
        };

        node.hostname = loop {
            *counter += 1;
            let candidate = format!("{cluster}-{tag}-{:02}", *counter);
            if !taken.contains(&candidate) {
                break candidate;
            }
        };
    }
}
