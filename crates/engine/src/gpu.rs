// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! GPU discovery and partition selection.
//!
//! The scheduler only knows GRES base types (`a100`), but clusters
//! often carry multiple physical variants of the same base type that
//! differ by node class. The variant catalog maps user-facing ids
//! (`a100-40gb`) to (base type, node-hostname prefix, tier) so requests
//! can be routed to the right nodes.

use crate::error::EngineError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tccp_ssh::Remote;

/// One GPU variant. Add a row for each new node class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuVariant {
    /// User-facing id, used in `gpu_type` config ("a100-40gb").
    pub id: &'static str,
    /// GRES type as sinfo reports it ("a100").
    pub base_type: &'static str,
    /// Node hostname prefix ("cc1gpu").
    pub node_prefix: &'static str,
    pub mem_gb: u32,
    /// 1 = cheapest, preferred by default.
    pub tier: u32,
}

pub const GPU_VARIANTS: &[GpuVariant] = &[
    GpuVariant {
        id: "a100-40gb",
        base_type: "a100",
        node_prefix: "cc1gpu",
        mem_gb: 40,
        tier: 1,
    },
    GpuVariant {
        id: "a100-80gb",
        base_type: "a100",
        node_prefix: "s1cmp",
        mem_gb: 80,
        tier: 2,
    },
];

pub fn find_variant_by_id(id: &str) -> Option<&'static GpuVariant> {
    GPU_VARIANTS.iter().find(|v| v.id.eq_ignore_ascii_case(id))
}

pub fn find_variants_by_base(base_type: &str) -> Vec<&'static GpuVariant> {
    GPU_VARIANTS
        .iter()
        .filter(|v| v.base_type.eq_ignore_ascii_case(base_type))
        .collect()
}

/// GRES base type for a gpu id: `a100-40gb` → `a100`; unknown ids are
/// returned unchanged.
pub fn base_type_for(gpu_type: &str) -> &str {
    find_variant_by_id(gpu_type)
        .map(|v| v.base_type)
        .unwrap_or(gpu_type)
}

/// `--gres` value for sbatch; variant ids collapse to their base type.
pub fn format_gpu_gres(gpu_type: &str, gpu_count: u32) -> String {
    if gpu_count == 0 || gpu_type.is_empty() {
        return String::new();
    }
    format!("gpu:{}:{}", base_type_for(gpu_type), gpu_count)
}

/// One GPU resource row (per partition + gpu type).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuResource {
    pub partition: String,
    /// Variant id when node names matched a variant, else the raw GRES
    /// type.
    pub gpu_type: String,
    pub gpu_per_node: u32,
    /// Nodes in idle/mix state (can accept work).
    pub avail_nodes: u32,
    pub total_nodes: u32,
    pub mem_mb: u64,
    pub cpus_per_node: u32,
    /// Variant node prefix; empty when no variant matched.
    pub node_prefix: String,
}

/// Result of partition selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMatch {
    pub partition: String,
    /// Resolved type (may be more specific than the request).
    pub gpu_type: String,
    pub gpu_per_node: u32,
    pub node_prefix: String,
}

/// Parse a GRES string like "gpu:a100:4" or "gpu:4" into (type, count).
pub fn parse_gres(gres: &str) -> (String, u32) {
    let lower = gres.to_ascii_lowercase();
    let Some(pos) = lower.find("gpu:") else {
        return (String::new(), 0);
    };
    let rest = &gres[pos + 4..];

    match rest.split_once(':') {
        Some((ty, count)) => {
            let count = count
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            (ty.to_ascii_lowercase(), count)
        }
        None => match rest.parse::<u32>() {
            Ok(count) => (String::new(), count),
            Err(_) => (rest.to_ascii_lowercase(), 1),
        },
    }
}

fn is_boundary(c: char) -> bool {
    matches!(c, '-' | '_' | '.' | ':')
}

/// Case-insensitive type match with word-boundary awareness.
///
/// "a100" matches "a100", "a100-sxm4-80gb", "nvidia_a100"; "a10" does
/// NOT match "a100". A specific variant request only matches exactly.
pub fn type_matches(resource_type: &str, requested_type: &str) -> bool {
    if requested_type.is_empty() {
        return true;
    }
    let r = resource_type.to_ascii_lowercase();
    let q = requested_type.to_ascii_lowercase();

    if r == q {
        return true;
    }

    // A variant request (q differs from its base) requires exact match
    let q_base = base_type_for(&q).to_ascii_lowercase();
    if q != q_base {
        return false;
    }
    // Bare base type matches any variant sharing the base
    if base_type_for(&r).to_ascii_lowercase() == q {
        return true;
    }

    // Substring match bounded by separators or string edges
    let rb = r.as_bytes();
    let mut search_from = 0;
    while let Some(rel) = r[search_from..].find(&q) {
        let pos = search_from + rel;
        let end = pos + q.len();
        let boundary_before = pos == 0 || is_boundary(rb[pos - 1] as char);
        let boundary_after = end == r.len() || is_boundary(rb[end] as char);
        if boundary_before && boundary_after {
            return true;
        }
        search_from = pos + 1;
    }
    false
}

/// Does any node name in a nodelist carry the given prefix?
/// Nodelists look like "cc1gpu001,cc1gpu002" or "cc1gpu[001-006]".
fn nodes_have_prefix(nodelist: &str, prefix: &str) -> bool {
    nodelist
        .to_ascii_lowercase()
        .contains(&prefix.to_ascii_lowercase())
}

/// Split one sinfo row into per-variant resources. When no variant's
/// node prefix appears in the nodelist, one raw entry is kept.
fn split_by_variant(
    partition: &str,
    raw_gpu_type: &str,
    gpu_count: u32,
    nodes: u32,
    available: bool,
    mem_mb: u64,
    cpus_per_node: u32,
    nodelist: &str,
) -> Vec<GpuResource> {
    let raw_entry = || GpuResource {
        partition: partition.to_string(),
        gpu_type: raw_gpu_type.to_string(),
        gpu_per_node: gpu_count,
        avail_nodes: if available { nodes } else { 0 },
        total_nodes: nodes,
        mem_mb,
        cpus_per_node,
        node_prefix: String::new(),
    };

    let variants = find_variants_by_base(raw_gpu_type);
    if variants.is_empty() || nodelist.is_empty() {
        return vec![raw_entry()];
    }

    let mut out: Vec<GpuResource> = variants
        .into_iter()
        .filter(|v| nodes_have_prefix(nodelist, v.node_prefix))
        .map(|v| GpuResource {
            gpu_type: v.id.to_string(),
            node_prefix: v.node_prefix.to_string(),
            ..raw_entry()
        })
        .collect();

    if out.is_empty() {
        out.push(raw_entry());
    }
    out
}

/// Parse `sinfo -h -o '%P|%G|%D|%m|%c|%T|%N'` output.
pub fn parse_sinfo_gpu_rows(output: &str) -> Vec<GpuResource> {
    let mut resources: Vec<GpuResource> = Vec::new();

    for line in output.lines() {
        let line = line.trim().trim_matches(['\'', '"']);
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 6 {
            continue;
        }

        let gres = fields[1];
        if !gres.to_ascii_lowercase().contains("gpu") {
            continue;
        }
        let (gpu_type, gpu_count) = parse_gres(gres);
        if gpu_count == 0 {
            continue;
        }

        let partition = fields[0].trim_end_matches('*');
        let nodes: u32 = fields[2].parse().unwrap_or(0);
        let mem_mb: u64 = fields[3].parse().unwrap_or(0);
        let cpus: u32 = fields[4].parse().unwrap_or(0);
        let state = fields[5].to_ascii_lowercase();
        let available = state.contains("idle") || state.contains("mix");
        let nodelist = fields.get(6).copied().unwrap_or("");

        for entry in split_by_variant(
            partition, &gpu_type, gpu_count, nodes, available, mem_mb, cpus, nodelist,
        ) {
            match resources
                .iter_mut()
                .find(|r| r.partition == entry.partition && r.gpu_type == entry.gpu_type)
            {
                Some(existing) => {
                    existing.total_nodes += entry.total_nodes;
                    existing.avail_nodes += entry.avail_nodes;
                }
                None => resources.push(entry),
            }
        }
    }
    resources
}

/// Parse `sacctmgr show assoc ... -n -p` output. `None` means the user
/// has a wildcard association (access to every partition).
pub fn parse_user_partitions(output: &str) -> Option<Vec<String>> {
    let mut partitions = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim().trim_end_matches('|').trim();
        if line.is_empty() {
            // Empty partition field = wildcard association
            return None;
        }
        partitions.insert(line.to_string());
    }
    Some(partitions.into_iter().collect())
}

/// Discover GPU resources via sinfo over the login hop.
pub async fn discover_gpu_resources(login: &Arc<dyn Remote>) -> Vec<GpuResource> {
    let result = login
        .run("sinfo -h -o '%P|%G|%D|%m|%c|%T|%N' 2>/dev/null")
        .await;
    if result.failed() {
        tracing::debug!(stderr = %result.stderr, "sinfo query failed");
        return Vec::new();
    }
    parse_sinfo_gpu_rows(&result.stdout)
}

/// Partitions the user may submit to. Empty = no filter.
pub async fn discover_user_partitions(login: &Arc<dyn Remote>, username: &str) -> Vec<String> {
    let result = login
        .run(&format!(
            "sacctmgr show assoc where user={username} format=partition -n -p 2>/dev/null"
        ))
        .await;

    if result.success() && !result.stdout.trim().is_empty() {
        match parse_user_partitions(&result.stdout) {
            // Wildcard access: no filtering
            None => return Vec::new(),
            Some(parts) if !parts.is_empty() => return parts,
            Some(_) => {}
        }
    }

    // Fallback: every partition sinfo reports
    let result = login.run("sinfo -h -o '%P' 2>/dev/null").await;
    if result.failed() {
        return Vec::new();
    }
    result
        .stdout
        .lines()
        .map(|l| l.trim().trim_end_matches('*'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Pick the best partition for a GPU request.
///
/// Filters to user-permitted partitions with a matching type and enough
/// GPUs per node, then scores: +1000 for available nodes, −10 per
/// surplus GPU slot, +total nodes, −5·tier (prefer cheap variants).
pub fn find_gpu_partition(
    resources: &[GpuResource],
    gpu_type: &str,
    gpu_count: u32,
    user_partitions: &[String],
) -> Result<PartitionMatch, EngineError> {
    if resources.is_empty() {
        return Err(EngineError::GpuResolve(
            "No GPU resources found on this cluster".into(),
        ));
    }

    let filter_by_user = !user_partitions.is_empty();
    let mut candidates: Vec<(&GpuResource, i64)> = Vec::new();

    for r in resources {
        if filter_by_user && !user_partitions.contains(&r.partition) {
            continue;
        }
        if !type_matches(&r.gpu_type, gpu_type) {
            continue;
        }
        if r.gpu_per_node < gpu_count {
            continue;
        }

        let mut score: i64 = 0;
        if r.avail_nodes > 0 {
            score += 1000;
        }
        score -= i64::from(r.gpu_per_node - gpu_count) * 10;
        score += i64::from(r.total_nodes);
        if let Some(variant) = find_variant_by_id(&r.gpu_type) {
            score -= i64::from(variant.tier) * 5;
        }
        candidates.push((r, score));
    }

    if candidates.is_empty() {
        let available: Vec<String> = resources
            .iter()
            .map(|r| format!("{}:{}:{}", r.partition, r.gpu_type, r.gpu_per_node))
            .collect();
        let qualifier = if filter_by_user { "accessible " } else { "" };
        return Err(EngineError::GpuResolve(format!(
            "No {qualifier}partition has gpu:{gpu_type}:{gpu_count}. \
             Available GPU resources: [{}]",
            available.join(", ")
        )));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    let best = candidates[0].0;
    Ok(PartitionMatch {
        partition: best.partition.clone(),
        gpu_type: best.gpu_type.clone(),
        gpu_per_node: best.gpu_per_node,
        node_prefix: best.node_prefix.clone(),
    })
}

/// Full discovery + selection.
///
/// A partition the user explicitly set (anything but the "batch"
/// default) is trusted unchanged.
pub async fn resolve_gpu_partition(
    login: &Arc<dyn Remote>,
    username: &str,
    current_partition: &str,
    gpu_type: &str,
    gpu_count: u32,
) -> Result<PartitionMatch, EngineError> {
    if gpu_count == 0 && gpu_type.is_empty() {
        return Ok(PartitionMatch {
            partition: current_partition.to_string(),
            ..Default::default()
        });
    }

    if !current_partition.is_empty() && current_partition != "batch" {
        return Ok(PartitionMatch {
            partition: current_partition.to_string(),
            gpu_type: gpu_type.to_string(),
            ..Default::default()
        });
    }

    let resources = discover_gpu_resources(login).await;
    let user_parts = discover_user_partitions(login, username).await;
    find_gpu_partition(&resources, gpu_type, gpu_count.max(1), &user_parts)
}

#[cfg(test)]
#[path = "gpu_tests.rs"]
mod tests;
