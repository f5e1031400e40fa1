// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sync manifests: sorted (path, mtime, size) snapshots of the project
//! tree, diffed against the last persisted snapshot to compute deltas.
//!
//! The delta is computed purely from local state — no remote listing —
//! which keeps incremental sync O(changed files).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the project root (rodata entries are prefixed
    /// `rodata/<label>/`).
    pub path: String,
    /// Opaque modification stamp; only compared for equality.
    pub mtime: i64,
    pub size: u64,
}

/// Sorted collection of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

/// Result of diffing a current manifest against a prior one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDelta {
    /// Paths that are new or whose (mtime, size) changed.
    pub changed: Vec<String>,
    /// Paths present only in the prior manifest.
    pub deleted: Vec<String>,
}

impl ManifestDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl Manifest {
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Diff self (current) against `prior`.
    pub fn diff(&self, prior: &Manifest) -> ManifestDelta {
        let prior_map: BTreeMap<&str, (i64, u64)> = prior
            .entries
            .iter()
            .map(|e| (e.path.as_str(), (e.mtime, e.size)))
            .collect();

        let mut changed = Vec::new();
        for e in &self.entries {
            match prior_map.get(e.path.as_str()) {
                Some(&(mtime, size)) if mtime == e.mtime && size == e.size => {}
                _ => changed.push(e.path.clone()),
            }
        }

        let current: BTreeMap<&str, ()> =
            self.entries.iter().map(|e| (e.path.as_str(), ())).collect();
        let deleted = prior
            .entries
            .iter()
            .filter(|e| !current.contains_key(e.path.as_str()))
            .map(|e| e.path.clone())
            .collect();

        ManifestDelta { changed, deleted }
    }
}

impl From<Vec<ManifestEntry>> for Manifest {
    fn from(entries: Vec<ManifestEntry>) -> Self {
        Self::new(entries)
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
