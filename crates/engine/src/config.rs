// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Project configuration (`tccp.yaml`) schema.
//!
//! Elaborate validation, templating, and interactive setup live
//! outside the core; this is the typed schema the engine consumes.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tccp_core::SlurmProfile;

/// One job definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Python script to run (e.g. "train.py").
    #[serde(default)]
    pub script: String,
    /// Python package to run with `-m` (alternative to `script`).
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub args: String,
    /// Job time limit; defaults to five minutes.
    #[serde(default)]
    pub time: String,
    /// Localhost ports forwarded to the compute node.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Per-job SLURM overrides.
    #[serde(default)]
    pub slurm: Option<SlurmProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    /// Environment id, e.g. "python", "python-pytorch".
    #[serde(rename = "type", default = "default_type")]
    pub env_type: String,
    /// GPU id, e.g. "a100", "a100-40gb", "v100".
    #[serde(default)]
    pub gpu: String,
    /// Project-level SLURM defaults.
    #[serde(default)]
    pub slurm: Option<SlurmProfile>,
    /// Read-only data directories, synced once per allocation.
    #[serde(default)]
    pub rodata: Vec<PathBuf>,
    /// Dotenv file uploaded with the job (bypasses ignore rules).
    #[serde(default)]
    pub env: String,
    /// Local directory auto-downloaded after completion.
    #[serde(default)]
    pub output: String,
    /// Per-allocation persistent cache directory.
    #[serde(default)]
    pub cache: String,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
}

fn default_type() -> String {
    "python".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            env_type: default_type(),
            gpu: String::new(),
            slurm: None,
            rodata: Vec::new(),
            env: String::new(),
            output: String::new(),
            cache: String::new(),
            jobs: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Load `tccp.yaml` from a project directory, normalizing defaults:
    /// missing name → directory name; no jobs → implicit `main` running
    /// `main.py`.
    pub fn load(project_dir: &Path) -> Result<Self, EngineError> {
        let path = project_dir.join("tccp.yaml");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: ProjectConfig = serde_yaml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("invalid {}: {e}", path.display())))?;
        config.normalize(project_dir);
        Ok(config)
    }

    pub fn normalize(&mut self, project_dir: &Path) {
        if self.name.is_empty() {
            self.name = project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string());
        }
        if self.jobs.is_empty() {
            self.jobs.insert(
                "main".to_string(),
                JobSpec {
                    script: "main.py".to_string(),
                    ..Default::default()
                },
            );
        }
        // A bare `gpu:` id becomes the default gpu_type for all jobs
        if !self.gpu.is_empty() {
            let slurm = self.slurm.get_or_insert_with(SlurmProfile::default);
            if slurm.gpu_type.is_empty() {
                slurm.gpu_type = self.gpu.clone();
            }
            if slurm.gpu_count == 0 {
                slurm.gpu_count = 1;
            }
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.get(name)
    }

    /// Rodata directories as (label, path) pairs; the label is the last
    /// path component.
    pub fn rodata_entries(&self) -> Vec<(String, PathBuf)> {
        self.rodata
            .iter()
            .map(|p| {
                let label = p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "data".to_string());
                (label, p.clone())
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
