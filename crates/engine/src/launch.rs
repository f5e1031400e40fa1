// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job launch on the compute node.
//!
//! A generated run script is staged on the gateway, copied to the
//! node's scratch, and started under the detach helper:
//! `dtach -n <sock> <scratch>/tccp_run.sh`. The socket file's existence
//! is the job's liveness signal.

use crate::config::{JobSpec, ProjectConfig};
use crate::error::EngineError;
use crate::paths::{RemotePaths, SSH_OPTS};
use std::sync::Arc;
use tccp_core::StatusCallback;
use tccp_ssh::Remote;

/// Printed on its own line immediately before the user program starts;
/// viewers use it to separate init output from job output.
pub const JOB_START_SENTINEL: &str = "__TCCP_JOB_START__";

/// Everything the run script needs to know.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub job_id: String,
    pub job_name: String,
    pub scratch: String,
    pub output_dir: String,
    pub cache_dir: String,
    /// Log file the viewer tails; all script output is mirrored here.
    pub log_path: String,
    /// Contents of the project's dotenv file (may be empty).
    pub env_file_content: String,
    pub ports: Vec<u16>,
    pub image: String,
    pub venv: String,
    pub gpu: bool,
    /// `python <script> <args>` or `python -m <package> <args>`.
    pub payload: String,
}

impl LaunchContext {
    pub fn payload_for(spec: &JobSpec) -> String {
        let args = if spec.args.is_empty() {
            String::new()
        } else {
            format!(" {}", spec.args)
        };
        if !spec.package.is_empty() {
            format!("python -m {}{args}", spec.package)
        } else {
            let script = if spec.script.is_empty() {
                "main.py"
            } else {
                &spec.script
            };
            format!("python {script}{args}")
        }
    }
}

/// Generate the run script executed under dtach on the compute node.
pub fn build_run_script(ctx: &LaunchContext) -> String {
    let mut s = String::from("#!/bin/bash\n");
    if !ctx.log_path.is_empty() {
        s.push_str(&format!("exec > >(tee -a {}) 2>&1\n", ctx.log_path));
    }

    s.push_str(&format!("export TCCP_JOB_ID={}\n", ctx.job_id));
    s.push_str(&format!("export TCCP_JOB_NAME={}\n", ctx.job_name));
    s.push_str(&format!("export TCCP_SCRATCH={}\n", ctx.scratch));
    s.push_str("export TCCP_OUTPUT_DIR=output\n");
    if !ctx.cache_dir.is_empty() {
        s.push_str(&format!("export TCCP_CACHE_DIR={}\n", ctx.cache_dir));
    }
    if !ctx.ports.is_empty() {
        let ports: Vec<String> = ctx.ports.iter().map(u16::to_string).collect();
        s.push_str(&format!("export TCCP_PORTS=\"{}\"\n", ports.join(" ")));
    }

    // Dotenv passthrough: exported verbatim, bypassing ignore rules
    for line in ctx.env_file_content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        s.push_str(&format!("export {line}\n"));
    }

    s.push_str("module load singularity 2>/dev/null || module load apptainer 2>/dev/null || true\n");
    s.push_str(&format!("cd {}\n", ctx.scratch));
    s.push_str(&format!("echo {JOB_START_SENTINEL}\n"));

    let nv = if ctx.gpu { "--nv " } else { "" };
    s.push_str(&format!(
        "singularity exec {nv}--bind {scratch}:{scratch} {image} \
         bash -c 'source {venv}/bin/activate && {payload}'\n",
        scratch = ctx.scratch,
        image = ctx.image,
        venv = ctx.venv,
        payload = ctx.payload,
    ));
    s
}

/// Stage the script and start it under dtach. The script goes to the
/// gateway first (heredoc), then scp to the node.
pub async fn launch_on_node(
    dtn: &Arc<dyn Remote>,
    paths: &RemotePaths,
    config: &ProjectConfig,
    ctx: &LaunchContext,
    compute_node: &str,
    status: Option<StatusCallback>,
) -> Result<(), EngineError> {
    if let Some(cb) = &status {
        cb("Launching job on compute node...");
    }

    let script = build_run_script(ctx);
    let gateway_script = format!("/tmp/tccp_run_{}.sh", ctx.job_id);

    let write = dtn
        .run(&format!(
            "cat > {gateway_script} << 'TCCP_RUN_EOF'\n{script}\nTCCP_RUN_EOF"
        ))
        .await;
    if write.failed() {
        return Err(EngineError::Launch(format!(
            "failed to stage run script: {}",
            write.output()
        )));
    }
    dtn.run(&format!("chmod +x {gateway_script}")).await;

    let scp = dtn
        .run(&format!(
            "scp {SSH_OPTS} {gateway_script} {compute_node}:{}/tccp_run.sh",
            ctx.scratch
        ))
        .await;
    dtn.run(&format!("rm -f {gateway_script}")).await;
    if scp.failed() {
        return Err(EngineError::Launch(format!(
            "failed to copy run script: {}",
            scp.output()
        )));
    }

    // Jobs write to ./output; the symlink points it at the persistent
    // output tree so retrieval works after scratch is wiped
    dtn.run(&format!(
        "ssh {SSH_OPTS} {compute_node} 'ln -sfn {} {}/output'",
        ctx.output_dir, ctx.scratch
    ))
    .await;

    if !config.cache.is_empty() {
        dtn.run(&format!(
            "ssh {SSH_OPTS} {compute_node} 'mkdir -p {}'",
            paths.shared_cache_dir()
        ))
        .await;
    }

    let sock = paths.dtach_sock(&ctx.job_id);
    let launch = dtn
        .run(&format!(
            "ssh {SSH_OPTS} {compute_node} '{} -n {sock} {}/tccp_run.sh'",
            paths.dtach_bin(),
            ctx.scratch
        ))
        .await;
    if launch.failed() {
        return Err(EngineError::Launch(format!(
            "failed to launch dtach: {}",
            launch.output()
        )));
    }

    if let Some(cb) = &status {
        cb(&format!("Job launched on {compute_node}"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "launch_tests.rs"]
mod tests;
