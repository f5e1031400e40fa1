// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote filesystem layout.
//!
//! Persistent per-project tree under the cluster home, shared container
//! cache, and per-job scratch on compute-node /tmp.

/// SSH options for hops through the gateway to compute nodes.
pub const SSH_OPTS: &str = "-o StrictHostKeyChecking=no -o BatchMode=yes";
/// Same, with a short connect timeout for liveness probes.
pub const SSH_OPTS_FAST: &str =
    "-o StrictHostKeyChecking=no -o BatchMode=yes -o ConnectTimeout=3";

#[derive(Debug, Clone)]
pub struct RemotePaths {
    username: String,
    project: String,
}

impl RemotePaths {
    pub fn new(username: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            project: project.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn tccp_home(&self) -> String {
        format!("/cluster/home/{}/tccp", self.username)
    }

    pub fn project_base(&self) -> String {
        format!("{}/projects/{}", self.tccp_home(), self.project)
    }

    pub fn env_dir(&self) -> String {
        format!("{}/env", self.project_base())
    }

    pub fn venv_dir(&self) -> String {
        format!("{}/default/venv", self.env_dir())
    }

    pub fn container_cache(&self) -> String {
        format!("{}/container-cache", self.tccp_home())
    }

    pub fn images_dir(&self) -> String {
        format!("{}/images", self.container_cache())
    }

    pub fn image_path(&self, sif_filename: &str) -> String {
        format!("{}/{}", self.images_dir(), sif_filename)
    }

    pub fn dtach_bin(&self) -> String {
        format!("{}/bin/dtach", self.tccp_home())
    }

    pub fn job_output_dir(&self, job_id: &str) -> String {
        format!("{}/output/{}", self.project_base(), job_id)
    }

    pub fn scratch_dir(&self, job_id: &str) -> String {
        format!("/tmp/{}/{}/{}", self.username, self.project, job_id)
    }

    pub fn dtach_sock(&self, job_id: &str) -> String {
        format!("/tmp/tccp_{job_id}.sock")
    }

    /// Job output mirror the viewer tails (socket path with `.log`).
    pub fn dtach_log(&self, job_id: &str) -> String {
        format!("/tmp/tccp_{job_id}.log")
    }

    /// Per-allocation shared cache on the compute node (weights etc.).
    pub fn shared_cache_dir(&self) -> String {
        format!("/tmp/{}/{}/.tccp-cache", self.username, self.project)
    }
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
