//! Flattened parameter views of a model tree.

use serde::Serialize;
use sp_core::Array;
use sp_nn::{Module, NnError, walk_modules};

use crate::HarnessError;

/// One declared parameter at its structural position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub name: String,
    pub shape: Vec<usize>,
    pub fingerprint: u64,
}

/// Every parameter in pre-order walk order, each ravelled, concatenated into
/// one flat array. Fails on the first uninitialised parameter.
pub fn snapshot(root: &dyn Module) -> Result<Array, HarnessError> {
    let mut parts = Vec::new();
    for (path, node) in walk_modules(root) {
        for (name, value) in node.parameters() {
            let value = value.ok_or_else(|| uninitialized(&path, node.name(), name))?;
            parts.push(value.ravel());
        }
    }
    Ok(Array::concatenate(&parts))
}

/// Per-parameter diagnostics in the same order as [`snapshot`].
pub fn snapshot_entries(root: &dyn Module) -> Result<Vec<SnapshotEntry>, HarnessError> {
    let mut entries = Vec::new();
    for (path, node) in walk_modules(root) {
        for (name, value) in node.parameters() {
            let value = value.ok_or_else(|| uninitialized(&path, node.name(), name))?;
            entries.push(SnapshotEntry {
                path: path.clone(),
                name: name.to_string(),
                shape: value.shape().to_vec(),
                fingerprint: value.fingerprint64(),
            });
        }
    }
    Ok(entries)
}

fn uninitialized(path: &str, node: &str, param: &str) -> HarnessError {
    HarnessError::Model(NnError::Uninitialized {
        node: format!("{node}@{path}/{param}"),
    })
}
