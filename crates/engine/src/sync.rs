// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental project sync to compute-node scratch.
//!
//! The current tree is snapshotted into a manifest (path, mtime, size)
//! and diffed against the last persisted manifest — no per-run remote
//! listing, so sync is O(changed files) after the first. When the prior
//! scratch still exists on the same node it is carried forward with
//! `cp -a` and only the delta is transferred.

use crate::config::ProjectConfig;
use crate::error::EngineError;
use crate::paths::SSH_OPTS;
use crate::state::StateHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tccp_core::{Manifest, ManifestDelta, ManifestEntry, StatusCallback};
use tccp_ssh::Remote;

/// Patterns always excluded from sync, ahead of any ignore file.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git/",
    ".gitignore",
    ".tccpignore",
    "__pycache__/",
    "*.pyc",
    "*.pyo",
    ".venv/",
    "venv/",
    ".idea/",
    ".vscode/",
    ".claude/",
    ".DS_Store",
    "*.swp",
    "*.swo",
    "*~",
    ".cache/",
    "build/",
    "dist/",
    "*.egg-info/",
    ".pytest_cache/",
    ".mypy_cache/",
    "node_modules/",
    ".env",
    // tccp's own artifacts never go up
    "output/",
    "tccp-output/",
    "tccp_run.sh",
];

/// Simplified ignore rules: the default exclude list plus the project's
/// `.tccpignore` (preferred) or `.gitignore`. Later patterns override
/// earlier ones; `!` negates.
pub struct IgnoreRules {
    patterns: Vec<(String, bool)>,
}

impl IgnoreRules {
    pub fn for_project(project_dir: &Path) -> Self {
        let mut patterns: Vec<(String, bool)> = DEFAULT_EXCLUDES
            .iter()
            .map(|p| (p.to_string(), false))
            .collect();

        let ignore_file = [".tccpignore", ".gitignore"]
            .iter()
            .map(|f| project_dir.join(f))
            .find(|p| p.exists());

        if let Some(path) = ignore_file {
            if let Ok(content) = std::fs::read_to_string(&path) {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match line.strip_prefix('!') {
                        Some(rest) => patterns.push((rest.to_string(), true)),
                        None => patterns.push((line.to_string(), false)),
                    }
                }
            }
        }

        Self { patterns }
    }

    #[cfg(test)]
    pub fn from_patterns(patterns: &[&str]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| match p.strip_prefix('!') {
                    Some(rest) => (rest.to_string(), true),
                    None => (p.to_string(), false),
                })
                .collect(),
        }
    }

    /// Is a (slash-separated, relative) path ignored?
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let mut ignored = false;
        for (pattern, negation) in &self.patterns {
            if pattern_matches(rel_path, pattern) {
                ignored = !negation;
            }
        }
        ignored
    }
}

fn pattern_matches(path: &str, pattern: &str) -> bool {
    let dir_pattern = pattern.ends_with('/');
    let pattern = pattern.trim_end_matches('/');

    if pattern.contains('*') || pattern.contains('?') {
        let Ok(compiled) = glob::Pattern::new(pattern) else {
            return false;
        };
        // Match against the full path and each component
        return compiled.matches(path)
            || path.split('/').any(|component| compiled.matches(component));
    }

    if dir_pattern {
        return path == pattern
            || path.starts_with(&format!("{pattern}/"))
            || path.contains(&format!("/{pattern}/"));
    }

    path == pattern || path.ends_with(&format!("/{pattern}"))
}

pub struct SyncManager {
    project_dir: PathBuf,
    config: Arc<ProjectConfig>,
    dtn: Arc<dyn Remote>,
}

impl SyncManager {
    pub fn new(project_dir: PathBuf, config: Arc<ProjectConfig>, dtn: Arc<dyn Remote>) -> Self {
        Self {
            project_dir,
            config,
            dtn,
        }
    }

    /// Snapshot the project tree plus rodata directories.
    pub fn build_local_manifest(&self) -> Manifest {
        let rules = IgnoreRules::for_project(&self.project_dir);
        let mut entries = Vec::new();

        collect_files(&self.project_dir, &self.project_dir, &rules, &mut |rel, meta| {
            // rodata/ in the tree is handled by its own walk below
            if rel == "rodata" || rel.starts_with("rodata/") {
                return;
            }
            entries.push(manifest_entry(rel.to_string(), meta));
        });

        for (label, dir) in self.config.rodata_entries() {
            let src = if dir.is_relative() {
                self.project_dir.join(&dir)
            } else {
                dir
            };
            if !src.is_dir() {
                continue;
            }
            collect_files(&src, &src, &IgnoreRules { patterns: Vec::new() }, &mut |rel, meta| {
                entries.push(manifest_entry(format!("rodata/{label}/{rel}"), meta));
            });
        }

        Manifest::new(entries)
    }

    /// Sync the project to `scratch_path` on `compute_node`, reusing a
    /// prior sync on the same node when its scratch still exists.
    pub async fn sync_to_scratch(
        &self,
        compute_node: &str,
        scratch_path: &str,
        state: &Arc<StateHandle>,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        let local = self.build_local_manifest();

        let (prior, prior_node, prior_scratch) = state.with(|s| {
            (
                s.last_sync_manifest.clone(),
                s.last_sync_node.clone(),
                s.last_sync_scratch.clone(),
            )
        });

        let mut can_reuse = !prior_node.is_empty()
            && prior_node == compute_node
            && !prior_scratch.is_empty()
            && !prior.is_empty();

        if can_reuse {
            let check = self
                .dtn
                .run(&format!(
                    "ssh {SSH_OPTS} {compute_node} 'test -d {prior_scratch} && echo YES || echo NO'"
                ))
                .await;
            if !check.stdout.contains("YES") {
                can_reuse = false;
            }
        }

        if can_reuse {
            if scratch_path != prior_scratch {
                if let Some(cb) = &status {
                    cb("Reusing files from previous sync...");
                }
                self.dtn
                    .run(&format!(
                        "ssh {SSH_OPTS} {compute_node} 'mkdir -p {scratch_path} && \
                         cp -a {prior_scratch}/. {scratch_path}/'"
                    ))
                    .await;
            }

            let delta = local.diff(&prior);
            if delta.is_empty() {
                if let Some(cb) = &status {
                    cb("All files up to date");
                }
            } else {
                self.incremental_sync(compute_node, scratch_path, &delta, status)
                    .await?;
            }
        } else {
            self.full_sync(compute_node, scratch_path, &local, status)
                .await?;
        }

        state.update(|s| {
            s.last_sync_manifest = local;
            s.last_sync_node = compute_node.to_string();
            s.last_sync_scratch = scratch_path.to_string();
        });
        Ok(())
    }

    /// Upload everything: stage on the gateway, tar-pipe to the node.
    pub async fn full_sync(
        &self,
        compute_node: &str,
        scratch_path: &str,
        manifest: &Manifest,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        if let Some(cb) = &status {
            cb("Creating scratch directory...");
        }
        self.dtn
            .run(&format!(
                "ssh {SSH_OPTS} {compute_node} 'mkdir -p {scratch_path}'"
            ))
            .await;

        let stage = format!("/tmp/tccp_sync_{}", chrono::Local::now().timestamp());

        let code_paths: Vec<&str> = manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .filter(|p| !p.starts_with("rodata/"))
            .collect();
        if let Some(cb) = &status {
            cb(&format!("Staging {} code files...", code_paths.len()));
        }
        self.stage_files(&stage, &code_paths).await?;

        if let Some(cb) = &status {
            cb("Transferring code to compute node...");
        }
        self.dtn
            .run(&format!(
                "cd {stage} && tar cf - . | ssh {SSH_OPTS} {compute_node} 'cd {scratch_path} && tar xf -'"
            ))
            .await;

        let rodata_paths: Vec<&str> = manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .filter(|p| p.starts_with("rodata/"))
            .collect();
        if !rodata_paths.is_empty() {
            if let Some(cb) = &status {
                cb("Staging rodata...");
            }
            let rodata_stage = format!("{stage}-rodata");
            self.stage_files(&rodata_stage, &rodata_paths).await?;
            if let Some(cb) = &status {
                cb("Transferring rodata to compute node...");
            }
            self.dtn
                .run(&format!(
                    "cd {rodata_stage} && tar cf - . | ssh {SSH_OPTS} {compute_node} 'cd {scratch_path} && tar xf -'"
                ))
                .await;
            self.dtn.run(&format!("rm -rf {rodata_stage}")).await;
        }

        self.dtn.run(&format!("rm -rf {stage}")).await;
        if let Some(cb) = &status {
            cb("Full sync complete");
        }
        Ok(())
    }

    /// Apply a delta: delete removed files, stage and tar-pipe changed
    /// ones.
    pub async fn incremental_sync(
        &self,
        compute_node: &str,
        scratch_path: &str,
        delta: &ManifestDelta,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        for path in &delta.deleted {
            self.dtn
                .run(&format!(
                    "ssh {SSH_OPTS} {compute_node} 'rm -f {scratch_path}/{path}'"
                ))
                .await;
        }

        if delta.changed.is_empty() {
            if let Some(cb) = &status {
                cb("No files changed");
            }
            return Ok(());
        }
        if let Some(cb) = &status {
            cb(&format!("Uploading {} changed files...", delta.changed.len()));
        }

        let stage = format!("/tmp/tccp_delta_{}", chrono::Local::now().timestamp());
        let paths: Vec<&str> = delta.changed.iter().map(String::as_str).collect();
        self.stage_files(&stage, &paths).await?;

        self.dtn
            .run(&format!(
                "cd {stage} && tar cf - . | ssh {SSH_OPTS} {compute_node} 'cd {scratch_path} && tar xf -'"
            ))
            .await;
        self.dtn.run(&format!("rm -rf {stage}")).await;

        if let Some(cb) = &status {
            cb(&format!(
                "Incremental sync: {} files updated",
                delta.changed.len()
            ));
        }
        Ok(())
    }

    /// Upload a set of manifest paths into a gateway staging directory,
    /// creating parent directories in one batched mkdir.
    async fn stage_files(&self, stage: &str, rel_paths: &[&str]) -> Result<(), EngineError> {
        let mut dirs: Vec<String> = rel_paths
            .iter()
            .filter_map(|p| {
                Path::new(p)
                    .parent()
                    .filter(|parent| !parent.as_os_str().is_empty())
                    .map(|parent| format!("{stage}/{}", parent.display()))
            })
            .collect();
        dirs.sort();
        dirs.dedup();

        let mut mkdir = format!("mkdir -p {stage}");
        for d in &dirs {
            mkdir.push(' ');
            mkdir.push_str(d);
        }
        self.dtn.run(&mkdir).await;

        for rel in rel_paths {
            let Some(local) = self.local_path_for(rel) else {
                continue;
            };
            if !local.exists() {
                continue;
            }
            let result = self.dtn.upload(&local, &format!("{stage}/{rel}")).await;
            if result.failed() {
                return Err(EngineError::Sync(format!(
                    "failed to stage {rel}: {}",
                    result.output()
                )));
            }
        }
        Ok(())
    }

    /// Map a manifest path back to the local filesystem.
    fn local_path_for(&self, rel: &str) -> Option<PathBuf> {
        match rel.strip_prefix("rodata/") {
            Some(rest) => {
                let (label, path) = rest.split_once('/')?;
                let (_, dir) = self
                    .config
                    .rodata_entries()
                    .into_iter()
                    .find(|(l, _)| l == label)?;
                let base = if dir.is_relative() {
                    self.project_dir.join(dir)
                } else {
                    dir
                };
                Some(base.join(path))
            }
            None => Some(self.project_dir.join(rel)),
        }
    }
}

fn manifest_entry(path: String, meta: &std::fs::Metadata) -> ManifestEntry {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    ManifestEntry {
        path,
        mtime,
        size: meta.len(),
    }
}

/// Walk a directory recursively, invoking `visit` for each non-ignored
/// regular file with its root-relative slash path.
fn collect_files(
    root: &Path,
    dir: &Path,
    rules: &IgnoreRules,
    visit: &mut impl FnMut(&str, &std::fs::Metadata),
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rules.is_ignored(&rel_str) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            collect_files(root, &path, rules, visit);
        } else if meta.is_file() {
            visit(&rel_str, &meta);
        }
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
