// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote environment provisioning: container image, virtual env,
//! detach helper.
//!
//! One probe command reports all three components; only missing pieces
//! are built. Container pulls run on the compute node via an SSH hop —
//! its /tmp is large and not quota-limited, unlike the gateway's.

use crate::cache::CacheManager;
use crate::error::EngineError;
use crate::paths::{RemotePaths, SSH_OPTS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tccp_core::{elapsed_label, StatusCallback};
use tccp_ssh::Remote;

/// Container pulls are slow; give them half an hour.
const CONTAINER_PULL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Environment definition for a project type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub type_name: &'static str,
    pub docker_uri: &'static str,
    pub sif_filename: &'static str,
    /// GPU environments get `--nv` at launch and a
    /// `--system-site-packages` venv.
    pub gpu: bool,
}

const ENVIRONMENTS: &[EnvironmentSpec] = &[
    EnvironmentSpec {
        type_name: "python",
        docker_uri: "docker://python:3.11-slim",
        sif_filename: "python_3.11-slim.sif",
        gpu: false,
    },
    EnvironmentSpec {
        type_name: "python-pytorch",
        docker_uri: "docker://pytorch/pytorch:2.3.1-cuda12.1-cudnn8-runtime",
        sif_filename: "pytorch_2.3.1-cuda12.1.sif",
        gpu: true,
    },
];

pub fn environment_for(project_type: &str) -> Result<&'static EnvironmentSpec, EngineError> {
    ENVIRONMENTS
        .iter()
        .find(|e| e.type_name == project_type)
        .ok_or_else(|| EngineError::Environment(format!("unknown project type '{project_type}'")))
}

/// Parsed result of the three-component probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvProbe {
    pub need_image: bool,
    pub need_venv: bool,
    pub need_dtach: bool,
}

pub fn parse_env_probe(output: &str) -> EnvProbe {
    EnvProbe {
        need_image: output.contains("IMAGE_MISSING"),
        need_venv: output.contains("VENV_MISSING"),
        need_dtach: output.contains("DTACH_MISSING"),
    }
}

pub struct EnvManager {
    dtn: Arc<dyn Remote>,
    paths: RemotePaths,
    cache: Arc<CacheManager>,
    project_name: String,
    /// The probe runs once per process unless something was missing.
    checked: AtomicBool,
}

impl EnvManager {
    pub fn new(
        dtn: Arc<dyn Remote>,
        paths: RemotePaths,
        cache: Arc<CacheManager>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            dtn,
            paths,
            cache,
            project_name: project_name.into(),
            checked: AtomicBool::new(false),
        }
    }

    /// Reset the per-process memoization (after `clear`-style flows).
    pub fn reset_checked(&self) {
        self.checked.store(false, Ordering::SeqCst);
    }

    /// Ensure image + venv + detach helper exist, evicting stale cache
    /// items first. Idempotent; memoized per process.
    pub async fn ensure_environment(
        &self,
        spec: &EnvironmentSpec,
        compute_node: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        if self.checked.load(Ordering::SeqCst) {
            return Ok(());
        }

        let t0 = std::time::Instant::now();
        let say = |msg: String| {
            if let Some(cb) = &status {
                cb(&format!("[{}] {msg}", elapsed_label(t0.elapsed())));
            }
        };

        let image = self.paths.image_path(spec.sif_filename);
        let venv = self.paths.venv_dir();
        let dtach = self.paths.dtach_bin();

        say("Checking cluster storage usage...".into());
        self.cache
            .ensure_within_cap(&self.project_name, spec.sif_filename, status.clone())
            .await;

        say("Checking environment components...".into());
        let probe_cmd = format!(
            "test -f {image} && echo IMAGE_OK || echo IMAGE_MISSING; \
             ( test -f {venv}/bin/python || test -L {venv}/bin/python ) && echo VENV_OK || echo VENV_MISSING; \
             test -x {dtach} && echo DTACH_OK || echo DTACH_MISSING"
        );
        let probe = parse_env_probe(&self.dtn.run(&probe_cmd).await.stdout);

        say(format!(
            "Container image ({}): {}",
            spec.sif_filename,
            if probe.need_image { "MISSING — will pull" } else { "found" }
        ));
        say(format!(
            "Python venv: {}",
            if probe.need_venv { "MISSING — will create" } else { "found" }
        ));
        say(format!(
            "dtach binary: {}",
            if probe.need_dtach { "MISSING — will build" } else { "found" }
        ));

        if probe.need_image || probe.need_venv {
            say("Loading Singularity/Apptainer module...".into());
            self.dtn
                .run("module load singularity 2>/dev/null || module load apptainer 2>/dev/null || true")
                .await;
        }

        if probe.need_image {
            self.pull_image(spec, compute_node, &image, &say).await?;
        }
        if probe.need_venv {
            self.create_venv(spec, &image, &venv, &say).await?;
        }
        if probe.need_dtach {
            say("Building dtach...".into());
            self.ensure_dtach(status.clone()).await?;
            say("dtach ready".into());
        }

        self.checked.store(true, Ordering::SeqCst);
        self.cache.touch_used(&image, &self.paths.env_dir()).await;
        say("Environment ready".into());
        Ok(())
    }

    async fn pull_image(
        &self,
        spec: &EnvironmentSpec,
        compute_node: &str,
        image: &str,
        say: &impl Fn(String),
    ) -> Result<(), EngineError> {
        say(format!(
            "Pulling container on {compute_node}: {} (this may take 5-15 min)...",
            spec.docker_uri
        ));
        let cc = self.paths.container_cache();
        self.dtn.run(&format!("mkdir -p {cc}/images")).await;

        let user = self.paths.username();
        let pull_cache = format!("/tmp/{user}/singularity-cache");
        let pull_tmp = format!("/tmp/{user}/singularity-tmp");
        let pull_cmd = format!(
            "ssh {SSH_OPTS} {compute_node} '\
             module load singularity 2>/dev/null || module load apptainer 2>/dev/null || true; \
             mkdir -p {pull_cache} {pull_tmp}; \
             SINGULARITY_CACHEDIR={pull_cache} SINGULARITY_TMPDIR={pull_tmp} \
             singularity pull {image} {}; \
             rm -rf {pull_cache} {pull_tmp}'",
            spec.docker_uri
        );
        let pull = self
            .dtn
            .run_with_timeout(&pull_cmd, CONTAINER_PULL_TIMEOUT)
            .await;
        if pull.failed() && !pull.stderr.is_empty() {
            return Err(EngineError::Environment(format!(
                "container pull failed ({}): {}",
                pull.stderr,
                pull.output()
            )));
        }

        say("Container pull finished, verifying...".into());
        // The pull ran on the node; verify on the NFS-visible side
        let check = self
            .dtn
            .run(&format!("test -f {image} && echo IMG_OK || echo IMG_FAIL"))
            .await;
        if check.stdout.contains("IMG_FAIL") {
            return Err(EngineError::Environment(format!(
                "container pull failed: {}",
                pull.output()
            )));
        }

        let size = self
            .dtn
            .run(&format!("du -sh {image} 2>/dev/null | cut -f1"))
            .await;
        let size = size.stdout.trim();
        say(format!(
            "Container image ready ({})",
            if size.is_empty() { "?" } else { size }
        ));
        Ok(())
    }

    async fn create_venv(
        &self,
        spec: &EnvironmentSpec,
        image: &str,
        venv: &str,
        say: &impl Fn(String),
    ) -> Result<(), EngineError> {
        say(format!(
            "Creating Python venv ({}site-packages)...",
            if spec.gpu { "with system " } else { "" }
        ));
        let base = self.paths.project_base();
        let user = self.paths.username();
        let pip_tmp = format!("/tmp/{user}/tccp-pip-tmp");
        self.dtn.run(&format!("mkdir -p {pip_tmp}")).await;

        // No --nv here: this runs on the gateway, which has no GPU
        // driver, and CUDA is not needed just to create a venv.
        let flags = if spec.gpu { "--system-site-packages " } else { "" };
        let venv_cmd = format!(
            "TMPDIR={pip_tmp} singularity exec --bind {base}:{base} {image} \
             python -m venv {flags}{venv}"
        );
        let result = self.dtn.run(&venv_cmd).await;
        if result.failed() {
            return Err(EngineError::Environment(format!(
                "failed to create venv: {}",
                result.output()
            )));
        }
        self.dtn
            .run(&format!("rm -rf {pip_tmp} 2>/dev/null; true"))
            .await;
        say("Python venv created".into());
        Ok(())
    }

    /// Ensure the dtach binary: copy a system install if present, else
    /// fetch sources (git, falling back to curl|tar) and compile.
    pub async fn ensure_dtach(&self, status: Option<StatusCallback>) -> Result<(), EngineError> {
        let home = self.paths.tccp_home();
        let bin = self.paths.dtach_bin();

        let check = self
            .dtn
            .run(&format!("test -x {bin} && echo DTACH_OK || echo DTACH_MISSING"))
            .await;
        if check.stdout.contains("DTACH_OK") {
            return Ok(());
        }

        let sys = self.dtn.run("which dtach 2>/dev/null").await;
        if sys.success() && !sys.stdout.trim().is_empty() {
            let sys_path = sys.stdout.trim();
            self.dtn.run(&format!("mkdir -p {home}/bin")).await;
            self.dtn
                .run(&format!("cp {sys_path} {bin} && chmod +x {bin}"))
                .await;
            let verify = self.dtn.run(&format!("test -x {bin} && echo OK")).await;
            if verify.stdout.contains("OK") {
                if let Some(cb) = &status {
                    cb("dtach: copied from system");
                }
                return Ok(());
            }
        }

        if let Some(cb) = &status {
            cb("Downloading dtach source...");
        }
        let build_dir = format!("{home}/dtach-build");
        self.dtn.run(&format!("mkdir -p {home}/bin")).await;
        self.dtn.run(&format!("rm -rf {build_dir}")).await;

        let clone = self
            .dtn
            .run(&format!(
                "git clone https://github.com/crigler/dtach.git {build_dir} 2>&1"
            ))
            .await;
        if clone.failed() {
            if let Some(cb) = &status {
                cb("git not available, trying curl...");
            }
            self.dtn.run(&format!("mkdir -p {build_dir}")).await;
            let dl = self
                .dtn
                .run(&format!(
                    "curl -sL https://github.com/crigler/dtach/archive/refs/heads/master.tar.gz \
                     | tar xz -C {build_dir} --strip-components=1 2>&1"
                ))
                .await;
            if dl.failed() {
                return Err(EngineError::Environment(format!(
                    "cannot download dtach source (no git or curl?): {}",
                    dl.output()
                )));
            }
        }

        if let Some(cb) = &status {
            cb("Compiling dtach...");
        }
        let build = self
            .dtn
            .run(&format!(
                "cd {build_dir} && cc -o dtach dtach.c master.c attach.c -lutil 2>&1"
            ))
            .await;
        if build.failed() {
            if let Some(cb) = &status {
                cb("Direct compile failed, trying configure/make...");
            }
            let fallback = self
                .dtn
                .run(&format!("cd {build_dir} && ./configure && make 2>&1"))
                .await;
            if fallback.failed() {
                return Err(EngineError::Environment(format!(
                    "failed to compile dtach: {}",
                    fallback.output()
                )));
            }
        }

        if let Some(cb) = &status {
            cb("Installing dtach binary...");
        }
        self.dtn
            .run(&format!("cp {build_dir}/dtach {bin} && chmod +x {bin}"))
            .await;
        self.dtn.run(&format!("rm -rf {build_dir}")).await;

        let verify = self
            .dtn
            .run(&format!("test -x {bin} && echo DTACH_OK || echo DTACH_FAIL"))
            .await;
        if verify.stdout.contains("DTACH_OK") {
            if let Some(cb) = &status {
                cb("dtach compiled and installed");
            }
            Ok(())
        } else {
            Err(EngineError::Environment(
                "failed to install dtach binary".into(),
            ))
        }
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
