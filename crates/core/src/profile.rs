// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SLURM resource profiles: merge layers, parse units, check compatibility.

use serde::{Deserialize, Serialize};

/// Default allocation lifetime when no time is configured anywhere.
pub const DEFAULT_ALLOC_TIME: &str = "4:00:00";

/// Default job time limit when a job omits `time`.
pub const DEFAULT_JOB_TIME: &str = "0:05:00";

/// A resource profile: global defaults, project overrides, and per-job
/// overrides all use this shape. Empty string / zero means "unset" so
/// layers can be merged field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmProfile {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub nodes: u32,
    #[serde(default)]
    pub cpus_per_task: u32,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub gpu_type: String,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub mail_type: String,
    /// Node hostname prefix for `--nodelist` (e.g. "cc1gpu").
    #[serde(default)]
    pub node_constraint: String,
    /// Nodes to exclude (e.g. "s1cmp003,s1cmp004").
    #[serde(default)]
    pub exclude_nodes: String,
}

impl SlurmProfile {
    /// Overlay `over` on top of self: each non-empty field of `over` wins.
    pub fn merged_with(&self, over: &SlurmProfile) -> SlurmProfile {
        let mut out = self.clone();
        if !over.partition.is_empty() {
            out.partition = over.partition.clone();
        }
        if !over.time.is_empty() {
            out.time = over.time.clone();
        }
        if over.nodes > 0 {
            out.nodes = over.nodes;
        }
        if over.cpus_per_task > 0 {
            out.cpus_per_task = over.cpus_per_task;
        }
        if !over.memory.is_empty() {
            out.memory = over.memory.clone();
        }
        if !over.gpu_type.is_empty() {
            out.gpu_type = over.gpu_type.clone();
        }
        if over.gpu_count > 0 {
            out.gpu_count = over.gpu_count;
        }
        if !over.mail_type.is_empty() {
            out.mail_type = over.mail_type.clone();
        }
        if !over.node_constraint.is_empty() {
            out.node_constraint = over.node_constraint.clone();
        }
        if !over.exclude_nodes.is_empty() {
            out.exclude_nodes = over.exclude_nodes.clone();
        }
        out
    }

    pub fn wants_gpu(&self) -> bool {
        self.gpu_count > 0 || !self.gpu_type.is_empty()
    }
}

/// Parse "H:MM:SS" (or "H:MM") into whole minutes, rounding seconds up.
/// Unparseable input falls back to the 4-hour default.
pub fn parse_time_minutes(time_str: &str) -> u32 {
    if time_str.is_empty() {
        return 240;
    }
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() < 2 {
        return 240;
    }
    let h: u32 = match parts[0].trim().parse() {
        Ok(v) => v,
        Err(_) => return 240,
    };
    let m: u32 = match parts[1].trim().parse() {
        Ok(v) => v,
        Err(_) => return 240,
    };
    let s: u32 = parts
        .get(2)
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    h * 60 + m + if s > 0 { 1 } else { 0 }
}

/// Parse a memory string like "16G", "500M", "1.5TB" into MB.
/// Bare integers are MB. Unknown suffixes are treated as MB.
pub fn parse_memory_mb(mem_str: &str) -> u64 {
    let trimmed = mem_str.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (num, suffix) = trimmed.split_at(split);
    let value: f64 = match num.parse() {
        Ok(v) => v,
        Err(_) => return 0,
    };

    match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "M" | "MB" => value as u64,
        "G" | "GB" => (value * 1024.0) as u64,
        "T" | "TB" => (value * 1024.0 * 1024.0) as u64,
        _ => value as u64,
    }
}

/// Can an allocation with resources `alloc` host a job requiring `job`?
///
/// Partition must match when the job names one; CPUs, memory, and nodes
/// must cover the requirement; GPU count must cover, and the GPU type must
/// match when the job pins one. Unset fields fall back to the 1-CPU /
/// 4G / 1-node defaults an allocation is actually submitted with.
pub fn resources_compatible(alloc: &SlurmProfile, job: &SlurmProfile) -> bool {
    if !job.partition.is_empty() && alloc.partition != job.partition {
        return false;
    }

    let alloc_cpus = alloc.cpus_per_task.max(1);
    let job_cpus = job.cpus_per_task.max(1);
    if alloc_cpus < job_cpus {
        return false;
    }

    let alloc_mem = parse_memory_mb(if alloc.memory.is_empty() { "4G" } else { &alloc.memory });
    let job_mem = parse_memory_mb(if job.memory.is_empty() { "4G" } else { &job.memory });
    if alloc_mem < job_mem {
        return false;
    }

    if alloc.nodes.max(1) < job.nodes.max(1) {
        return false;
    }

    if job.gpu_count > 0 {
        if alloc.gpu_count < job.gpu_count {
            return false;
        }
        if !job.gpu_type.is_empty() && alloc.gpu_type != job.gpu_type {
            return false;
        }
    }

    true
}

#[cfg(test)]
#[path = "profile_tests.rs"]
mod tests;
