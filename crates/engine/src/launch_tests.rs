// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tccp_ssh::FakeRemote;
use yare::parameterized;

fn context() -> LaunchContext {
    LaunchContext {
        job_id: "2025-01-15T10-30-00-123__train".into(),
        job_name: "train".into(),
        scratch: "/tmp/alice/proj/2025-01-15T10-30-00-123__train".into(),
        output_dir: "/cluster/home/alice/tccp/projects/proj/output/2025-01-15T10-30-00-123__train"
            .into(),
        cache_dir: String::new(),
        log_path: "/tmp/tccp_2025-01-15T10-30-00-123__train.log".into(),
        env_file_content: String::new(),
        ports: vec![],
        image: "/cluster/home/alice/tccp/container-cache/images/python_3.11-slim.sif".into(),
        venv: "/cluster/home/alice/tccp/projects/proj/env/default/venv".into(),
        gpu: false,
        payload: "python main.py".into(),
    }
}

#[parameterized(
    script = { JobSpec { script: "train.py".into(), ..Default::default() }, "python train.py" },
    script_with_args = {
        JobSpec { script: "train.py".into(), args: "--epochs 10".into(), ..Default::default() },
        "python train.py --epochs 10"
    },
    package = {
        JobSpec { package: "myproj.eval".into(), ..Default::default() },
        "python -m myproj.eval"
    },
    default_script = { JobSpec::default(), "python main.py" },
)]
fn payload_forms(spec: JobSpec, expected: &str) {
    assert_eq!(LaunchContext::payload_for(&spec), expected);
}

#[test]
fn run_script_shape() {
    let mut ctx = context();
    ctx.ports = vec![8888, 6006];
    ctx.env_file_content = "WANDB_API_KEY=secret\n# comment\n\nHF_HOME=/x\n".into();

    let script = build_run_script(&ctx);
    let lines: Vec<&str> = script.lines().collect();

    assert_eq!(lines[0], "#!/bin/bash");
    // Everything the job prints is mirrored into the viewer's log
    assert_eq!(
        lines[1],
        "exec > >(tee -a /tmp/tccp_2025-01-15T10-30-00-123__train.log) 2>&1"
    );
    assert!(script.contains("export TCCP_JOB_ID=2025-01-15T10-30-00-123__train\n"));
    assert!(script.contains("export TCCP_PORTS=\"8888 6006\"\n"));
    // Dotenv lines exported verbatim, comments and blanks dropped
    assert!(script.contains("export WANDB_API_KEY=secret\n"));
    assert!(script.contains("export HF_HOME=/x\n"));
    assert!(!script.contains("# comment"));

    // Sentinel comes right before the exec line
    let sentinel_pos = lines.iter().position(|l| *l == "echo __TCCP_JOB_START__").unwrap();
    assert!(lines[sentinel_pos + 1].starts_with("singularity exec"));

    // Venv activated inside the container, payload last
    assert!(lines[sentinel_pos + 1].contains("source"));
    assert!(lines[sentinel_pos + 1].ends_with("&& python main.py'"));
    // CPU environment: no --nv
    assert!(!script.contains("--nv"));
}

#[test]
fn gpu_run_script_uses_nv() {
    let mut ctx = context();
    ctx.gpu = true;
    assert!(build_run_script(&ctx).contains("singularity exec --nv "));
}

#[tokio::test]
async fn launch_stages_copies_links_and_detaches() {
    let fake = FakeRemote::new();
    let remote: Arc<dyn Remote> = Arc::new(fake.clone());
    let paths = RemotePaths::new("alice", "proj");
    let config = ProjectConfig {
        name: "proj".into(),
        ..Default::default()
    };
    let ctx = context();

    launch_on_node(&remote, &paths, &config, &ctx, "c042", None)
        .await
        .unwrap();

    let calls = fake.calls();
    let stage_idx = calls
        .iter()
        .position(|c| c.contains("TCCP_RUN_EOF"))
        .unwrap();
    assert!(calls[stage_idx].contains("cat > /tmp/tccp_run_2025-01-15T10-30-00-123__train.sh"));

    let scp_idx = calls.iter().position(|c| c.starts_with("scp ")).unwrap();
    assert!(calls[scp_idx].contains("c042:/tmp/alice/proj/2025-01-15T10-30-00-123__train/tccp_run.sh"));
    assert!(stage_idx < scp_idx);

    // Output symlink into the persistent tree
    assert!(calls.iter().any(|c| c.contains("ln -sfn") && c.contains("/output'")));

    // dtach launch with the job socket
    let launch = calls
        .iter()
        .find(|c| c.contains("dtach -n"))
        .unwrap();
    assert!(launch.contains("/tmp/tccp_2025-01-15T10-30-00-123__train.sock"));
    assert!(launch.contains("tccp_run.sh"));

    // Gateway staging file removed
    assert!(calls.iter().any(|c| c.starts_with("rm -f /tmp/tccp_run_")));
}

#[tokio::test]
async fn launch_creates_shared_cache_when_configured() {
    let fake = FakeRemote::new();
    let remote: Arc<dyn Remote> = Arc::new(fake.clone());
    let paths = RemotePaths::new("alice", "proj");
    let config = ProjectConfig {
        name: "proj".into(),
        cache: "./weights".into(),
        ..Default::default()
    };

    launch_on_node(&remote, &paths, &config, &context(), "c042", None)
        .await
        .unwrap();

    assert!(!fake
        .calls_matching("mkdir -p /tmp/alice/proj/.tccp-cache")
        .is_empty());
}

#[tokio::test]
async fn failed_dtach_launch_is_an_error() {
    let fake = FakeRemote::new();
    fake.on("dtach -n", tccp_core::SshResult::err("dtach: no such file"));
    let remote: Arc<dyn Remote> = Arc::new(fake.clone());
    let paths = RemotePaths::new("alice", "proj");
    let config = ProjectConfig::default();

    let err = launch_on_node(&remote, &paths, &config, &context(), "c042", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Launch(_)));
}
