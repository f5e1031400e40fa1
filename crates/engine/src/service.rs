// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service wiring: one connected session, one set of managers.
//!
//! Construction order matters: singleton lock → transport (the one
//! 2FA) → multiplexer → facade → state → managers → reconcile →
//! restore. Teardown runs in reverse.

use crate::alloc::AllocationManager;
use crate::cache::CacheManager;
use crate::config::ProjectConfig;
use crate::env::EnvManager;
use crate::error::EngineError;
use crate::forward::PortForwarder;
use crate::jobs::{JobCallback, JobManager, ViewerContext};
use crate::paths::RemotePaths;
use crate::state::StateHandle;
use crate::sync::SyncManager;
use std::path::PathBuf;
use std::sync::Arc;
use tccp_core::{parse_iso, SshResult, StatusCallback, TrackedJob};
use tccp_ssh::{ChannelMultiplexer, Connections, SessionTarget, SessionTransport, ShellSession};
use tccp_storage::{SingletonLock, StateStore};
use tracing::info;

/// Row for the jobs listing.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: String,
    pub job_name: String,
    pub slurm_id: String,
    pub compute_node: String,
    pub status: String,
    pub ports: String,
    pub submit_time: String,
}

/// Row for the allocations listing.
#[derive(Debug, Clone)]
pub struct AllocationSummary {
    pub slurm_id: String,
    pub node: String,
    pub partition: String,
    pub gpu: String,
    pub status: String,
    pub remaining: String,
}

pub struct TccpService {
    config: Arc<ProjectConfig>,
    conns: Arc<Connections>,
    allocs: Arc<AllocationManager>,
    jobs: Arc<JobManager>,
    _lock: SingletonLock,
}

impl TccpService {
    /// Connect and assemble the managers. `username` is the cluster
    /// account (it shapes every remote path).
    pub async fn connect(
        project_dir: PathBuf,
        config: ProjectConfig,
        target: SessionTarget,
        login_host: String,
        username: String,
        status: StatusCallback,
    ) -> Result<Self, EngineError> {
        let lock = SingletonLock::acquire()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let gateway_host = target.host.clone();
        let transport = Arc::new(SessionTransport::establish(&target, status.clone()).await?);
        let mux = ChannelMultiplexer::start(&transport).await?;
        let conns = Arc::new(Connections::new(
            Arc::clone(&transport),
            mux,
            login_host,
        ));
        status("[cluster] DTN + Login hop connections established (single auth)");

        let config = Arc::new(config);
        let paths = RemotePaths::new(&username, &config.name);
        let dtn = conns.dtn();
        let login = conns.login();

        let store = StateStore::for_project(&config.name)?;
        let state = Arc::new(StateHandle::load(store));

        let allocs = Arc::new(AllocationManager::new(
            Arc::clone(&config),
            paths.clone(),
            Arc::clone(&dtn),
            Arc::clone(&login),
            Arc::clone(&state),
        ));
        allocs.reconcile(Some(status.clone())).await;

        let sync = Arc::new(SyncManager::new(
            project_dir.clone(),
            Arc::clone(&config),
            Arc::clone(&dtn),
        ));
        let cache = Arc::new(CacheManager::new(Arc::clone(&dtn), paths.clone()));
        let envs = Arc::new(EnvManager::new(
            Arc::clone(&dtn),
            paths.clone(),
            cache,
            config.name.clone(),
        ));
        let forwarder = Arc::new(PortForwarder::new(Arc::clone(&conns), Arc::clone(&dtn)));

        let log_dir = dirs::home_dir()
            .map(|h| h.join(".tccp").join("logs"))
            .unwrap_or_else(|| PathBuf::from("/tmp/tccp-logs"));

        let jobs = JobManager::new(
            Arc::clone(&config),
            paths,
            project_dir,
            log_dir,
            gateway_host,
            dtn,
            Arc::clone(&allocs),
            sync,
            envs,
            Some(forwarder),
            state,
        );
        jobs.restore_tunnels().await;

        info!(project = %config.name, "service connected");
        Ok(Self {
            config,
            conns,
            allocs,
            jobs,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &Arc<ProjectConfig> {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.conns.is_connected()
    }

    pub fn check_alive(&self) -> bool {
        self.conns.check_alive()
    }

    /// Does the login node answer scheduler queries?
    pub async fn check_slurm_health(&self) -> bool {
        self.conns.login().run("sinfo -h 2>&1").await.success()
    }

    // ── Jobs ───────────────────────────────────────────────────

    pub fn run_job(
        &self,
        job_name: &str,
        status: Option<StatusCallback>,
    ) -> Result<TrackedJob, EngineError> {
        self.jobs.run(job_name, status)
    }

    pub async fn cancel_job(
        &self,
        job_name: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        self.jobs.cancel_job(job_name, status).await
    }

    pub async fn cancel_job_by_id(
        &self,
        job_id: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        self.jobs.cancel_job_by_id(job_id, status).await
    }

    pub async fn return_output(
        &self,
        job_id: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        self.jobs.return_output(job_id, status).await
    }

    pub fn find_job_by_name(&self, job_name: &str) -> Option<TrackedJob> {
        self.jobs.find_by_name(job_name)
    }

    pub fn viewer_context(&self, job_name: &str) -> Option<ViewerContext> {
        self.jobs.viewer_context(job_name)
    }

    pub fn init_log_path(&self, job_id: &str) -> PathBuf {
        self.jobs.init_log_path(job_id)
    }

    /// Poll tracked jobs for completion and release allocations that
    /// can no longer host any configured job.
    pub async fn poll_jobs(&self, on_complete: Option<JobCallback>) {
        self.jobs.poll(on_complete).await;
        self.allocs.reap_expired_idle(None).await;
    }

    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.jobs
            .tracked_jobs()
            .iter()
            .map(|job| JobSummary {
                job_id: job.job_id.clone(),
                job_name: job.job_name.clone(),
                slurm_id: job.alloc_slurm_id.clone(),
                compute_node: job.compute_node.clone(),
                status: job.status().to_string(),
                ports: job
                    .forwarded_ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                submit_time: job.submit_time.clone(),
            })
            .collect()
    }

    /// Raw squeue listing of the user's jobs.
    pub async fn list_scheduler_jobs(&self, status: Option<StatusCallback>) -> SshResult {
        self.jobs.list(status).await
    }

    // ── Allocations ────────────────────────────────────────────

    pub fn list_allocations(&self) -> Vec<AllocationSummary> {
        let now = chrono::Local::now().timestamp();
        self.allocs.state().with(|s| {
            s.allocations
                .iter()
                .map(|a| {
                    let status = if a.is_pending() {
                        "PENDING"
                    } else if a.is_idle() {
                        "IDLE"
                    } else {
                        "BUSY"
                    };
                    let gpu = if a.resources.gpu_type.is_empty() && a.resources.gpu_count == 0 {
                        "-".to_string()
                    } else {
                        format!(
                            "{}:{}",
                            if a.resources.gpu_type.is_empty() {
                                "gpu"
                            } else {
                                &a.resources.gpu_type
                            },
                            a.resources.gpu_count.max(1)
                        )
                    };
                    let remaining = if parse_iso(&a.start_time).is_some() {
                        let rem = a.remaining_minutes(now);
                        format!("{}h {:02}m", rem / 60, rem % 60)
                    } else {
                        "-".to_string()
                    };
                    AllocationSummary {
                        slurm_id: a.slurm_id.clone(),
                        node: if a.node.is_empty() {
                            "(waiting)".to_string()
                        } else {
                            a.node.clone()
                        },
                        partition: if a.resources.partition.is_empty() {
                            "batch".to_string()
                        } else {
                            a.resources.partition.clone()
                        },
                        gpu,
                        status: status.to_string(),
                        remaining,
                    }
                })
                .collect()
        })
    }

    pub async fn reconcile_allocations(&self, status: Option<StatusCallback>) {
        self.allocs.reconcile(status).await;
    }

    /// Deallocate one reservation, or all idle ones when no id given.
    pub async fn deallocate(&self, slurm_id: Option<&str>, status: Option<StatusCallback>) {
        match slurm_id {
            Some(id) => self.allocs.deallocate(id, status).await,
            None => self.allocs.deallocate_all_idle(status).await,
        }
    }

    // ── Shell / exec ───────────────────────────────────────────

    /// Ad-hoc command on the login node.
    pub async fn exec_remote(&self, command: &str) -> SshResult {
        if !self.is_connected() {
            return SshResult::err("Not connected");
        }
        self.conns.login().run(command).await
    }

    /// Ad-hoc command on the gateway.
    pub async fn exec_gateway(&self, command: &str) -> SshResult {
        if !self.is_connected() {
            return SshResult::err("Not connected");
        }
        self.conns.dtn().run(command).await
    }

    /// Interactive relay running `command` on a fresh channel.
    pub async fn open_shell(&self, command: &str) -> Result<ShellSession, EngineError> {
        Ok(self.conns.open_shell(command).await?)
    }

    // ── Shutdown ───────────────────────────────────────────────

    pub fn initializing_job_count(&self) -> usize {
        self.jobs.initializing_count()
    }

    /// Cancel initializing jobs (deallocating their reservations) and
    /// disconnect.
    pub async fn graceful_shutdown(&self, status: Option<StatusCallback>) {
        let alloc_ids = self.jobs.cancel_initializing_jobs(status.clone()).await;
        for slurm_id in alloc_ids {
            if let Some(cb) = &status {
                cb(&format!("Releasing allocation {slurm_id}"));
            }
            self.allocs.deallocate(&slurm_id, None).await;
        }
        self.disconnect().await;
    }

    pub async fn disconnect(&self) {
        self.jobs.shutdown();
        self.conns.disconnect().await;
    }
}
