// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allocation manager: submit, track, reuse, and evict cluster
//! allocations.
//!
//! An allocation is a `sleep infinity` sbatch job; jobs attach to one
//! allocation at a time via `active_job_id`. The claim path holds the
//! claim lock across scan-and-assign so two init tasks can never
//! double-book the same allocation.

use crate::config::ProjectConfig;
use crate::error::EngineError;
use crate::gpu::format_gpu_gres;
use crate::paths::RemotePaths;
use crate::state::StateHandle;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tccp_core::{
    now_iso, parse_time_minutes, resources_compatible, Allocation, SlurmProfile, SshResult,
    StatusCallback,
};
use tccp_ssh::Remote;
use tracing::info;

/// Poll cadence and budget while waiting for a pending allocation
/// (120 × 5s = 10 minutes).
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_MAX_ITERS: u32 = 120;

/// Transient scheduler-query failures are retried this many times with
/// a 5s backoff before being reported.
const QUERY_RETRIES: u32 = 2;

pub struct AllocationManager {
    config: Arc<ProjectConfig>,
    paths: RemotePaths,
    dtn: Arc<dyn Remote>,
    login: Arc<dyn Remote>,
    state: Arc<StateHandle>,
    /// Held across find-idle + assign so claims are atomic.
    claim_lock: Mutex<()>,
    /// Global defaults under the project/job override layers.
    defaults: SlurmProfile,
}

impl AllocationManager {
    pub fn new(
        config: Arc<ProjectConfig>,
        paths: RemotePaths,
        dtn: Arc<dyn Remote>,
        login: Arc<dyn Remote>,
        state: Arc<StateHandle>,
    ) -> Self {
        Self {
            config,
            paths,
            dtn,
            login,
            state,
            claim_lock: Mutex::new(()),
            defaults: SlurmProfile::default(),
        }
    }

    pub fn state(&self) -> &Arc<StateHandle> {
        &self.state
    }

    /// The login-hop connection (shared with GPU discovery and job
    /// listings).
    pub fn login_connection(&self) -> Arc<dyn Remote> {
        Arc::clone(&self.login)
    }

    /// Merge global defaults → project overrides → job overrides, then
    /// fill the 4-hour default time.
    pub fn resolve_profile(&self, job_name: &str) -> SlurmProfile {
        let mut profile = self.defaults.clone();
        if let Some(project_slurm) = &self.config.slurm {
            profile = profile.merged_with(project_slurm);
        }
        if let Some(job_slurm) = self
            .config
            .job(job_name)
            .and_then(|j| j.slurm.as_ref())
        {
            profile = profile.merged_with(job_slurm);
        }
        if profile.time.is_empty() {
            profile.time = tccp_core::profile::DEFAULT_ALLOC_TIME.to_string();
        }
        profile
    }

    /// Query `{state, node}` for one SLURM job id, retrying transient
    /// failures. `Ok((String::new(), _))` means the job is unknown to
    /// the scheduler; `Err` means the query itself kept failing.
    pub async fn query_slurm_state(&self, slurm_id: &str) -> Result<(String, String), EngineError> {
        let cmd = format!("squeue -j {slurm_id} -h -o \"%T %N\"");
        let mut attempt = 0;
        loop {
            let result = self.login.run(&cmd).await;
            if result.success() {
                let mut parts = result.stdout.split_whitespace();
                let state = parts.next().unwrap_or("").to_string();
                let node = parts.next().unwrap_or("").to_string();
                return Ok((state, node));
            }
            if attempt >= QUERY_RETRIES {
                return Err(EngineError::AllocationQueryLost(slurm_id.to_string()));
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Reconcile persisted allocations against the scheduler: fill in
    /// nodes for RUNNING ones, keep PENDING ones, drop the rest. One
    /// batched squeue when possible.
    pub async fn reconcile(&self, status: Option<StatusCallback>) {
        self.state.reload();
        let allocations = self.state.with(|s| s.allocations.clone());
        if allocations.is_empty() {
            if let Some(cb) = &status {
                cb("No previous allocations found");
            }
            return;
        }
        if let Some(cb) = &status {
            cb(&format!(
                "Reconciling {} allocation(s) with SLURM...",
                allocations.len()
            ));
        }

        let ids: Vec<&str> = allocations.iter().map(|a| a.slurm_id.as_str()).collect();
        let result = self
            .login
            .run(&format!(
                "squeue -j {} -h -o \"%i %T %N\"",
                ids.join(",")
            ))
            .await;
        if result.failed() {
            // Connection hiccup: keep everything rather than orphan
            // live reservations
            tracing::debug!(stderr = %result.stderr, "reconcile query failed, keeping state");
            return;
        }

        let mut live = Vec::new();
        for mut alloc in allocations {
            let line = result
                .stdout
                .lines()
                .find(|l| l.split_whitespace().next() == Some(alloc.slurm_id.as_str()));
            let (job_state, node) = match line {
                Some(l) => {
                    let mut parts = l.split_whitespace().skip(1);
                    (
                        parts.next().unwrap_or("").to_string(),
                        parts.next().unwrap_or("").to_string(),
                    )
                }
                None => (String::new(), String::new()),
            };

            match job_state.as_str() {
                "RUNNING" => {
                    if !node.is_empty() {
                        alloc.node = node;
                    }
                    if let Some(cb) = &status {
                        cb(&format!("  Allocation {} RUNNING on {}", alloc.slurm_id, alloc.node));
                    }
                    live.push(alloc);
                }
                "PENDING" => {
                    if let Some(cb) = &status {
                        cb(&format!("  Allocation {} PENDING", alloc.slurm_id));
                    }
                    live.push(alloc);
                }
                other => {
                    if let Some(cb) = &status {
                        let label = if other.is_empty() { "not found" } else { other };
                        cb(&format!("  Allocation {} gone ({})", alloc.slurm_id, label));
                    }
                }
            }
        }

        self.state.update(|s| s.allocations = live);
    }

    /// Atomically claim an idle allocation that can host the job.
    ///
    /// Scans for allocations with a known node, compatible resources,
    /// and enough remaining time; sets `active_job_id` and persists
    /// under the claim lock.
    pub fn claim_free(
        &self,
        required_minutes: u32,
        required: &SlurmProfile,
        job_id: &str,
    ) -> Option<Allocation> {
        let _guard = self.claim_lock.lock();
        let now = chrono::Local::now().timestamp();
        self.state.update(|s| {
            for alloc in &mut s.allocations {
                if !alloc.is_idle() || alloc.is_pending() {
                    continue;
                }
                if !resources_compatible(&alloc.resources, required) {
                    continue;
                }
                if alloc.remaining_minutes(now) < required_minutes {
                    continue;
                }
                alloc.active_job_id = job_id.to_string();
                return Some(alloc.clone());
            }
            None
        })
    }

    /// A pending allocation with compatible resources that a job can
    /// wait on instead of submitting afresh.
    pub fn find_pending(&self, required: &SlurmProfile) -> Option<Allocation> {
        self.state.with(|s| {
            s.allocations
                .iter()
                .find(|a| {
                    a.is_idle() && a.is_pending() && resources_compatible(&a.resources, required)
                })
                .cloned()
        })
    }

    pub fn find_by_id(&self, slurm_id: &str) -> Option<Allocation> {
        self.state.with(|s| s.allocation(slurm_id).cloned())
    }

    /// Poll the scheduler until the allocation is RUNNING with a node.
    ///
    /// Terminal states remove the allocation and error; a failing query
    /// (connection loss) errors without touching state; a timeout
    /// cancels the submission and removes it.
    pub async fn wait_for_allocation(
        &self,
        slurm_id: &str,
        status: Option<StatusCallback>,
    ) -> Result<Allocation, EngineError> {
        for i in 0..WAIT_MAX_ITERS {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;

            let (job_state, node) = self.query_slurm_state(slurm_id).await?;

            if job_state == "RUNNING" && !node.is_empty() {
                let updated = self.state.update(|s| {
                    s.allocation_mut(slurm_id).map(|a| {
                        a.node = node.clone();
                        a.start_time = now_iso();
                        a.clone()
                    })
                });
                if let Some(alloc) = updated {
                    if let Some(cb) = &status {
                        cb(&format!("Allocation {slurm_id} running on {node}"));
                    }
                    return Ok(alloc);
                }
                return Err(EngineError::Allocation(format!(
                    "allocation {slurm_id} vanished from state"
                )));
            }

            if matches!(job_state.as_str(), "COMPLETED" | "FAILED" | "CANCELLED") {
                self.state.update(|s| s.remove_allocation(slurm_id));
                return Err(EngineError::AllocationDied {
                    slurm_id: slurm_id.to_string(),
                    state: job_state,
                });
            }

            // Unknown to the scheduler usually means a dropped hop;
            // report without killing the reservation
            if job_state.is_empty() {
                return Err(EngineError::AllocationQueryLost(slurm_id.to_string()));
            }

            if i % 6 == 0 {
                if let Some(cb) = &status {
                    cb(&format!(
                        "Still waiting for allocation {slurm_id}... ({}s)",
                        (i + 1) * 5
                    ));
                }
            }
        }

        let _ = self.login.run(&format!("scancel {slurm_id}")).await;
        self.state.update(|s| s.remove_allocation(slurm_id));
        Err(EngineError::AllocationTimeout(slurm_id.to_string()))
    }

    /// Submit a new allocation and wait for it to run.
    ///
    /// The pending record is persisted before waiting so a crash still
    /// knows about the reservation.
    pub async fn allocate(
        &self,
        profile: &SlurmProfile,
        status: Option<StatusCallback>,
    ) -> Result<Allocation, EngineError> {
        if let Some(cb) = &status {
            cb("Requesting compute allocation...");
        }

        let base = self.paths.project_base();
        let cc = self.paths.container_cache();
        self.dtn
            .run(&format!(
                "mkdir -p {base} {base}/env {cc}/images {cc}/cache {cc}/tmp"
            ))
            .await;

        let script = self.generate_alloc_script(profile);
        let submit = format!("sbatch << 'TCCP_ALLOC_EOF'\n{script}\nTCCP_ALLOC_EOF");
        let result = self.login.run(&submit).await;

        let slurm_id = parse_sbatch_job_id(&result).ok_or_else(|| {
            EngineError::Allocation(format!(
                "failed to submit allocation: {}",
                result.output()
            ))
        })?;

        if let Some(cb) = &status {
            cb(&format!("Allocation {slurm_id} submitted, waiting for node..."));
        }
        info!(slurm_id = %slurm_id, "allocation submitted");

        let alloc = Allocation {
            slurm_id: slurm_id.clone(),
            duration_minutes: parse_time_minutes(&profile.time),
            resources: profile.clone(),
            ..Default::default()
        };
        self.state.update(|s| s.allocations.push(alloc));

        self.wait_for_allocation(&slurm_id, status).await
    }

    /// Full sbatch script for an allocation: resource directives per
    /// the profile, body `sleep infinity`.
    pub fn generate_alloc_script(&self, profile: &SlurmProfile) -> String {
        let base = self.paths.project_base();
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&format!("#SBATCH --job-name=tccp-{}\n", self.config.name));
        let time = if profile.time.is_empty() {
            tccp_core::profile::DEFAULT_ALLOC_TIME
        } else {
            &profile.time
        };
        s.push_str(&format!("#SBATCH --time={time}\n"));
        s.push_str(&generate_sbatch_resources(profile));
        s.push_str(&format!("#SBATCH --output={base}/alloc-%j.out\n"));
        s.push_str(&format!("#SBATCH --error={base}/alloc-%j.err\n"));
        s.push_str("\nsleep infinity\n");
        s
    }

    pub fn assign_job(&self, slurm_id: &str, job_id: &str) {
        self.state.update(|s| {
            if let Some(alloc) = s.allocation_mut(slurm_id) {
                alloc.active_job_id = job_id.to_string();
            }
        });
    }

    pub fn release_job(&self, slurm_id: &str) {
        self.state.update(|s| {
            if let Some(alloc) = s.allocation_mut(slurm_id) {
                alloc.active_job_id.clear();
            }
        });
    }

    pub async fn deallocate(&self, slurm_id: &str, status: Option<StatusCallback>) {
        let _ = self.login.run(&format!("scancel {slurm_id}")).await;
        if let Some(cb) = &status {
            cb(&format!("Cancelled allocation {slurm_id}"));
        }
        self.state.update(|s| s.remove_allocation(slurm_id));
    }

    pub async fn deallocate_all_idle(&self, status: Option<StatusCallback>) {
        let idle: Vec<String> = self.state.with(|s| {
            s.allocations
                .iter()
                .filter(|a| a.is_idle())
                .map(|a| a.slurm_id.clone())
                .collect()
        });

        if idle.is_empty() {
            if let Some(cb) = &status {
                cb("No idle allocations to cancel");
            }
            return;
        }
        for slurm_id in idle {
            self.deallocate(&slurm_id, status.clone()).await;
        }
    }

    /// Drop idle allocations whose remaining time can no longer fit any
    /// configured job.
    pub async fn reap_expired_idle(&self, status: Option<StatusCallback>) {
        let shortest_job_minutes = self
            .config
            .jobs
            .values()
            .map(|j| {
                parse_time_minutes(if j.time.is_empty() {
                    tccp_core::profile::DEFAULT_JOB_TIME
                } else {
                    &j.time
                })
            })
            .min()
            .unwrap_or(5);

        let now = chrono::Local::now().timestamp();
        let expired: Vec<String> = self.state.with(|s| {
            s.allocations
                .iter()
                .filter(|a| {
                    a.is_idle() && !a.is_pending() && a.remaining_minutes(now) < shortest_job_minutes
                })
                .map(|a| a.slurm_id.clone())
                .collect()
        });

        for slurm_id in expired {
            if let Some(cb) = &status {
                cb(&format!(
                    "Allocation {slurm_id} too short for any job, releasing"
                ));
            }
            self.deallocate(&slurm_id, None).await;
        }
    }
}

/// Resource directives per the profile. Partition defaults to "gpu"
/// when GPUs are requested, "batch" otherwise; memory defaults to 4G.
pub fn generate_sbatch_resources(profile: &SlurmProfile) -> String {
    let mut s = String::new();

    let partition = if profile.partition.is_empty() {
        if profile.wants_gpu() {
            "gpu"
        } else {
            "batch"
        }
    } else {
        &profile.partition
    };
    s.push_str(&format!("#SBATCH --partition={partition}\n"));
    s.push_str(&format!("#SBATCH --nodes={}\n", profile.nodes.max(1)));
    s.push_str(&format!(
        "#SBATCH --cpus-per-task={}\n",
        profile.cpus_per_task.max(1)
    ));
    let mem = if profile.memory.is_empty() {
        "4G"
    } else {
        &profile.memory
    };
    s.push_str(&format!("#SBATCH --mem={mem}\n"));

    let gres = format_gpu_gres(&profile.gpu_type, profile.gpu_count);
    if !gres.is_empty() {
        s.push_str(&format!("#SBATCH --gres={gres}\n"));
    }
    if !profile.node_constraint.is_empty() {
        s.push_str(&format!("#SBATCH -w {}[001-999]\n", profile.node_constraint));
    }
    if !profile.exclude_nodes.is_empty() {
        s.push_str(&format!("#SBATCH --exclude={}\n", profile.exclude_nodes));
    }
    if !profile.mail_type.is_empty() && profile.mail_type != "NONE" {
        s.push_str(&format!("#SBATCH --mail-type={}\n", profile.mail_type));
    }
    s
}

/// Extract the job id from `Submitted batch job <id>` output.
pub fn parse_sbatch_job_id(result: &SshResult) -> Option<String> {
    let pos = result.stdout.find("Submitted batch job ")?;
    let id: String = result.stdout[pos + "Submitted batch job ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
#[path = "alloc_tests.rs"]
mod tests;
