// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote cache budget enforcement.
//!
//! Container images and project virtual envs accumulate under the tool
//! home; before provisioning anything new, usage is discovered in one
//! round-trip and the oldest items are evicted until the projected
//! total fits the soft cap. The current project's env and image are
//! never candidates.

use crate::paths::RemotePaths;
use std::sync::Arc;
use tccp_core::StatusCallback;
use tccp_ssh::Remote;
use tracing::info;

/// Policy value, not a measured constant.
pub const CACHE_SOFT_CAP_BYTES: i64 = 20 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheItemKind {
    Container,
    Venv,
}

impl std::fmt::Display for CacheItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheItemKind::Container => write!(f, "container"),
            CacheItemKind::Venv => write!(f, "venv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub kind: CacheItemKind,
    pub size_bytes: i64,
    pub mtime_epoch: i64,
    pub path: String,
}

/// Parsed discovery output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub total_bytes: i64,
    pub containers: Vec<CacheItem>,
    pub venvs: Vec<CacheItem>,
}

/// Parse the sectioned discovery script output.
pub fn parse_discovery(output: &str) -> CacheUsage {
    #[derive(PartialEq)]
    enum Section {
        None,
        Total,
        Containers,
        Venvs,
    }

    let mut usage = CacheUsage::default();
    let mut section = Section::None;

    for line in output.lines() {
        let line = line.trim();
        match line {
            "===TOTAL===" => {
                section = Section::Total;
                continue;
            }
            "===CONTAINERS===" => {
                section = Section::Containers;
                continue;
            }
            "===VENVS===" => {
                section = Section::Venvs;
                continue;
            }
            "===END===" => break,
            "" => continue,
            _ => {}
        }

        match section {
            Section::Total => {
                usage.total_bytes = line.parse().unwrap_or(0);
            }
            Section::Containers | Section::Venvs => {
                let mut parts = line.splitn(3, ' ');
                let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let mtime = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let Some(path) = parts.next().map(str::trim) else {
                    continue;
                };
                if path.is_empty() {
                    continue;
                }
                let item = CacheItem {
                    kind: if section == Section::Containers {
                        CacheItemKind::Container
                    } else {
                        CacheItemKind::Venv
                    },
                    size_bytes: size,
                    mtime_epoch: mtime,
                    path: path.to_string(),
                };
                if item.kind == CacheItemKind::Container {
                    usage.containers.push(item);
                } else {
                    usage.venvs.push(item);
                }
            }
            Section::None => {}
        }
    }
    usage
}

/// Decide what to delete: venvs first (cheap to recreate), then
/// containers, each oldest-first, excluding the current project's env
/// and image, until projected usage fits the cap.
pub fn plan_evictions(
    usage: &CacheUsage,
    cap_bytes: i64,
    current_env_dir: &str,
    current_sif: &str,
) -> Vec<CacheItem> {
    if usage.total_bytes <= cap_bytes {
        return Vec::new();
    }

    let mut venvs = usage.venvs.clone();
    venvs.sort_by_key(|v| v.mtime_epoch);
    let mut containers = usage.containers.clone();
    containers.sort_by_key(|c| c.mtime_epoch);

    let candidates = venvs
        .into_iter()
        .filter(|v| v.path != current_env_dir)
        .chain(
            containers
                .into_iter()
                .filter(|c| current_sif.is_empty() || !c.path.contains(current_sif)),
        );

    let mut to_delete = Vec::new();
    let mut projected = usage.total_bytes;
    for item in candidates {
        if projected <= cap_bytes {
            break;
        }
        projected -= item.size_bytes;
        to_delete.push(item);
    }
    to_delete
}

pub struct CacheManager {
    dtn: Arc<dyn Remote>,
    paths: RemotePaths,
}

impl CacheManager {
    pub fn new(dtn: Arc<dyn Remote>, paths: RemotePaths) -> Self {
        Self { dtn, paths }
    }

    /// Evict least-recently-used cache items until usage fits the cap.
    /// Nothing evictable is a soft failure: provisioning proceeds.
    pub async fn ensure_within_cap(
        &self,
        current_project: &str,
        current_sif: &str,
        status: Option<StatusCallback>,
    ) {
        let home = self.paths.tccp_home();
        let user = self.paths.username();

        // Stale temp from interrupted pulls/venv builds goes first
        self.dtn
            .run(&format!(
                "rm -rf {home}/container-cache/cache/* {home}/container-cache/tmp/* \
                 /tmp/{user}/tccp-pip-tmp 2>/dev/null; true"
            ))
            .await;

        let discovery = format!(
            "echo '===TOTAL==='; \
             du -sb {home} 2>/dev/null | cut -f1; \
             echo '===CONTAINERS==='; \
             for f in {home}/container-cache/images/*.sif; do \
               [ -f \"$f\" ] && stat -c '%s %Y %n' \"$f\" 2>/dev/null; \
             done; \
             echo '===VENVS==='; \
             for d in {home}/projects/*/env; do \
               [ -d \"$d\" ] && {{ \
                 sz=$(du -sb \"$d\" 2>/dev/null | cut -f1); \
                 if [ -f \"$d/.last_used\" ]; then \
                   mt=$(stat -c '%Y' \"$d/.last_used\" 2>/dev/null); \
                 else \
                   mt=0; \
                 fi; \
                 echo \"$sz $mt $d\"; \
               }}; \
             done; \
             echo '===END==='"
        );

        let result = self.dtn.run(&discovery).await;
        if result.failed() {
            // Can't discover: skip eviction
            return;
        }

        let usage = parse_discovery(&result.stdout);
        if usage.total_bytes <= CACHE_SOFT_CAP_BYTES {
            return;
        }

        if let Some(cb) = &status {
            cb(&format!(
                "Storage usage {:.1}GB exceeds {:.0}GB cap, checking for evictable items...",
                gb(usage.total_bytes),
                gb(CACHE_SOFT_CAP_BYTES)
            ));
        }

        let current_env = format!("{home}/projects/{current_project}/env");
        let plan = plan_evictions(&usage, CACHE_SOFT_CAP_BYTES, &current_env, current_sif);

        if plan.is_empty() {
            if let Some(cb) = &status {
                cb("No evictable items found — proceeding anyway");
            }
            return;
        }

        let mut projected = usage.total_bytes;
        let mut rm = String::from("rm -rf");
        for item in &plan {
            projected -= item.size_bytes;
            rm.push(' ');
            rm.push_str(&item.path);
            info!(kind = %item.kind, size = item.size_bytes, path = %item.path, "evicting cache item");
            if let Some(cb) = &status {
                cb(&format!(
                    "  Evicting {} ({:.1}GB): {}",
                    item.kind,
                    gb(item.size_bytes),
                    item.path
                ));
            }
        }
        self.dtn.run(&rm).await;

        if let Some(cb) = &status {
            cb(&format!(
                "Evicted {} item(s), projected usage: {:.1}GB",
                plan.len(),
                gb(projected)
            ));
        }
    }

    /// Record most-recent use for LRU ordering.
    pub async fn touch_used(&self, sif_path: &str, project_env_dir: &str) {
        self.dtn
            .run(&format!("touch {sif_path} {project_env_dir}/.last_used"))
            .await;
    }
}

fn gb(bytes: i64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
