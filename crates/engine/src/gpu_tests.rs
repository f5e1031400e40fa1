// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    typed = { "gpu:a100:4", "a100", 4 },
    count_only = { "gpu:4", "", 4 },
    type_only = { "gpu:v100", "v100", 1 },
    mixed_case = { "GPU:A100:2", "a100", 2 },
    no_gpu = { "mps:400", "", 0 },
)]
fn gres_parsing(input: &str, ty: &str, count: u32) {
    assert_eq!(parse_gres(input), (ty.to_string(), count));
}

#[parameterized(
    exact = { "a100", "a100", true },
    variant_to_base = { "a100-40gb", "a100", true },
    sxm_suffix = { "a100-sxm4-80gb", "a100", true },
    underscore = { "nvidia_a100", "a100", true },
    no_false_prefix = { "a100", "a10", false },
    variant_request_exact = { "a100-40gb", "a100-40gb", true },
    variant_request_mismatch = { "a100-80gb", "a100-40gb", false },
    variant_request_vs_base = { "a100", "a100-40gb", false },
    empty_request = { "anything", "", true },
)]
fn type_matching(resource: &str, request: &str, expected: bool) {
    assert_eq!(type_matches(resource, request), expected);
}

#[test]
fn gres_formatting_collapses_variants() {
    assert_eq!(format_gpu_gres("a100-40gb", 2), "gpu:a100:2");
    assert_eq!(format_gpu_gres("v100", 1), "gpu:v100:1");
    assert_eq!(format_gpu_gres("", 2), "");
    assert_eq!(format_gpu_gres("a100", 0), "");
}

const SINFO_TWO_VARIANTS: &str = "\
gpu*|gpu:a100:4|6|512000|64|idle|cc1gpu[001-006]
gpu|gpu:a100:4|4|1024000|128|mix|s1cmp[001-004]
batch|(null)|100|256000|64|idle|c[001-100]
";

#[test]
fn sinfo_rows_split_by_variant() {
    let resources = parse_sinfo_gpu_rows(SINFO_TWO_VARIANTS);
    assert_eq!(resources.len(), 2);

    let r40 = resources.iter().find(|r| r.gpu_type == "a100-40gb").unwrap();
    assert_eq!(r40.partition, "gpu");
    assert_eq!(r40.node_prefix, "cc1gpu");
    assert_eq!(r40.total_nodes, 6);
    assert_eq!(r40.avail_nodes, 6);

    let r80 = resources.iter().find(|r| r.gpu_type == "a100-80gb").unwrap();
    assert_eq!(r80.node_prefix, "s1cmp");
    assert_eq!(r80.avail_nodes, 4);
}

#[test]
fn sinfo_unknown_type_kept_raw() {
    let resources = parse_sinfo_gpu_rows("ml|gpu:v100:8|2|512000|40|alloc|ml[01-02]\n");
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].gpu_type, "v100");
    assert_eq!(resources[0].node_prefix, "");
    assert_eq!(resources[0].avail_nodes, 0); // allocated, not idle/mix
}

#[test]
fn sinfo_merges_duplicate_rows() {
    let out = "gpu|gpu:a100:4|2|0|0|idle|cc1gpu[001-002]\ngpu|gpu:a100:4|3|0|0|alloc|cc1gpu[003-005]\n";
    let resources = parse_sinfo_gpu_rows(out);
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].total_nodes, 5);
    assert_eq!(resources[0].avail_nodes, 2);
}

#[test]
fn user_partition_parsing() {
    assert_eq!(
        parse_user_partitions("gpu|\nbatch|\n"),
        Some(vec!["batch".to_string(), "gpu".to_string()])
    );
    // Blank line = wildcard association = access to everything
    assert_eq!(parse_user_partitions("gpu|\n|\n"), None);
}

#[test]
fn bare_base_request_resolves_to_tier1_variant() {
    // A bare `gpu: a100` request with two variant rows: tier 1 wins
    let resources = parse_sinfo_gpu_rows(SINFO_TWO_VARIANTS);
    let m = find_gpu_partition(&resources, "a100", 1, &[]).unwrap();
    assert_eq!(m.gpu_type, "a100-40gb");
    assert_eq!(m.partition, "gpu");
    assert_eq!(m.node_prefix, "cc1gpu");
}

#[test]
fn surplus_gpu_slots_are_penalized() {
    let resources = vec![
        GpuResource {
            partition: "big".into(),
            gpu_type: "v100".into(),
            gpu_per_node: 8,
            avail_nodes: 1,
            total_nodes: 1,
            ..Default::default()
        },
        GpuResource {
            partition: "small".into(),
            gpu_type: "v100".into(),
            gpu_per_node: 2,
            avail_nodes: 1,
            total_nodes: 1,
            ..Default::default()
        },
    ];
    let m = find_gpu_partition(&resources, "v100", 1, &[]).unwrap();
    assert_eq!(m.partition, "small");
}

#[test]
fn availability_dominates_scoring() {
    let resources = vec![
        GpuResource {
            partition: "busy".into(),
            gpu_type: "v100".into(),
            gpu_per_node: 1,
            avail_nodes: 0,
            total_nodes: 50,
            ..Default::default()
        },
        GpuResource {
            partition: "free".into(),
            gpu_type: "v100".into(),
            gpu_per_node: 4,
            avail_nodes: 2,
            total_nodes: 2,
            ..Default::default()
        },
    ];
    let m = find_gpu_partition(&resources, "v100", 1, &[]).unwrap();
    assert_eq!(m.partition, "free");
}

#[test]
fn user_partition_filter_applies() {
    let resources = parse_sinfo_gpu_rows(SINFO_TWO_VARIANTS);
    let err = find_gpu_partition(&resources, "a100", 1, &["batch".to_string()]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("No accessible partition"));
    // The error enumerates what WAS available
    assert!(msg.contains("a100-40gb"));
}

#[test]
fn no_match_error_lists_resources() {
    let resources = parse_sinfo_gpu_rows(SINFO_TWO_VARIANTS);
    let err = find_gpu_partition(&resources, "h100", 1, &[]).unwrap_err();
    assert!(err.to_string().contains("gpu:a100-40gb:4"));
}

#[tokio::test]
async fn resolve_trusts_explicit_partition() {
    let fake: std::sync::Arc<dyn Remote> = std::sync::Arc::new(tccp_ssh::FakeRemote::new());
    let m = resolve_gpu_partition(&fake, "alice", "ml-reserved", "a100", 1)
        .await
        .unwrap();
    assert_eq!(m.partition, "ml-reserved");
    assert_eq!(m.gpu_type, "a100");
}

#[tokio::test]
async fn resolve_discovers_when_partition_defaulted() {
    let fake = tccp_ssh::FakeRemote::new();
    fake.on("sinfo -h -o '%P|%G|", tccp_core::SshResult::ok(SINFO_TWO_VARIANTS));
    fake.on("sacctmgr show assoc", tccp_core::SshResult::ok("|\n"));
    let remote: std::sync::Arc<dyn Remote> = std::sync::Arc::new(fake);

    let m = resolve_gpu_partition(&remote, "alice", "batch", "a100", 1)
        .await
        .unwrap();
    assert_eq!(m.gpu_type, "a100-40gb");
}
