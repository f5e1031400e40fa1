// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job orchestrator: one background init task per submission, a poll
//! loop for completion, cancellation, pruning, and output retrieval.
//!
//! Submission returns immediately with a persisted record; the init
//! task drives profile resolution → allocation → environment → sync →
//! launch → tunnels, appending progress to a per-job init log. The
//! dtach socket on the compute node is the liveness signal: socket
//! gone means job done.

use crate::alloc::AllocationManager;
use crate::config::ProjectConfig;
use crate::env::{environment_for, EnvManager};
use crate::error::EngineError;
use crate::forward::{ensure_hop_keys, PortForwarder, TunnelHandle};
use crate::gpu::resolve_gpu_partition;
use crate::launch::{launch_on_node, LaunchContext};
use crate::paths::{RemotePaths, SSH_OPTS, SSH_OPTS_FAST};
use crate::state::StateHandle;
use crate::sync::SyncManager;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tccp_core::{
    now_iso, parse_time_minutes, profile::DEFAULT_JOB_TIME, JobId, SshResult, StatusCallback,
    TrackedJob,
};
use tccp_ssh::Remote;
use tracing::{debug, info, warn};

/// Callback invoked for each newly completed job.
pub type JobCallback = Arc<dyn Fn(&TrackedJob) + Send + Sync>;

/// Everything a viewer needs to attach to a job's remote log and dtach
/// socket. The remote paths are deterministic under the scratch tree.
#[derive(Debug, Clone)]
pub struct ViewerContext {
    pub job_id: String,
    pub job_name: String,
    pub alloc_slurm_id: String,
    pub compute_node: String,
    pub scratch_path: String,
    pub sock_path: String,
    pub user: String,
    pub gateway_host: String,
    pub canceled: bool,
}

pub struct JobManager {
    config: Arc<ProjectConfig>,
    paths: RemotePaths,
    project_dir: PathBuf,
    /// Local directory for init logs.
    log_dir: PathBuf,
    gateway_host: String,
    dtn: Arc<dyn Remote>,
    allocs: Arc<AllocationManager>,
    sync: Arc<SyncManager>,
    envs: Arc<EnvManager>,
    forwarder: Option<Arc<PortForwarder>>,
    state: Arc<StateHandle>,
    tracked: Mutex<Vec<TrackedJob>>,
    tunnels: Mutex<HashMap<String, Vec<TunnelHandle>>>,
    cancel_requested: Mutex<HashSet<String>>,
    shutdown: Arc<AtomicBool>,
}

enum PollDecision {
    Complete { job_id: String, exit_code: i32 },
    FillNode { job_id: String, node: String },
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProjectConfig>,
        paths: RemotePaths,
        project_dir: PathBuf,
        log_dir: PathBuf,
        gateway_host: String,
        dtn: Arc<dyn Remote>,
        allocs: Arc<AllocationManager>,
        sync: Arc<SyncManager>,
        envs: Arc<EnvManager>,
        forwarder: Option<Arc<PortForwarder>>,
        state: Arc<StateHandle>,
    ) -> Arc<Self> {
        // Restore tracked jobs from persistent state
        let tracked = state.with(|s| s.jobs.clone());
        Arc::new(Self {
            config,
            paths,
            project_dir,
            log_dir,
            gateway_host,
            dtn,
            allocs,
            sync,
            envs,
            forwarder,
            state,
            tracked: Mutex::new(tracked),
            tunnels: Mutex::new(HashMap::new()),
            cancel_requested: Mutex::new(HashSet::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Re-establish port tunnels for running jobs after a restart.
    pub async fn restore_tunnels(&self) {
        let Some(forwarder) = &self.forwarder else {
            return;
        };
        let targets: Vec<(String, String, Vec<u16>)> = {
            let tracked = self.tracked.lock();
            tracked
                .iter()
                .filter(|j| {
                    !j.completed
                        && j.init_complete
                        && !j.compute_node.is_empty()
                        && !j.forwarded_ports.is_empty()
                })
                .map(|j| {
                    (
                        j.job_id.clone(),
                        j.compute_node.clone(),
                        j.forwarded_ports.clone(),
                    )
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        if !forwarder.ensure_keys(None).await {
            return;
        }
        for (job_id, node, ports) in targets {
            let handles = forwarder.start(&node, &ports, None).await;
            self.tunnels.lock().insert(job_id, handles);
        }
    }

    pub fn tracked_jobs(&self) -> Vec<TrackedJob> {
        self.tracked.lock().clone()
    }

    pub fn allocs(&self) -> &Arc<AllocationManager> {
        &self.allocs
    }

    pub fn state_handle(&self) -> &Arc<StateHandle> {
        &self.state
    }

    /// Most recent job with the given name.
    pub fn find_by_name(&self, job_name: &str) -> Option<TrackedJob> {
        self.tracked
            .lock()
            .iter()
            .rev()
            .find(|j| j.job_name == job_name)
            .cloned()
    }

    pub fn initializing_count(&self) -> usize {
        self.tracked
            .lock()
            .iter()
            .filter(|j| !j.init_complete && !j.completed)
            .count()
    }

    pub fn viewer_context(&self, job_name: &str) -> Option<ViewerContext> {
        let job = self.find_by_name(job_name)?;
        if job.completed {
            return None;
        }
        Some(ViewerContext {
            sock_path: self.paths.dtach_sock(&job.job_id),
            user: self.paths.username().to_string(),
            gateway_host: self.gateway_host.clone(),
            job_id: job.job_id,
            job_name: job.job_name,
            alloc_slurm_id: job.alloc_slurm_id,
            compute_node: job.compute_node,
            scratch_path: job.scratch_path,
            canceled: job.canceled,
        })
    }

    pub fn init_log_path(&self, job_id: &str) -> PathBuf {
        self.log_dir.join(format!("init_{job_id}.log"))
    }

    /// `squeue` listing over the login hop.
    pub async fn list(&self, status: Option<StatusCallback>) -> SshResult {
        if let Some(cb) = &status {
            cb("Querying job status...");
        }
        self.allocs
            .login_connection()
            .run(&format!(
                "squeue -u {} -o \"%.8i %.20j %.10T %.6M %.4D %R\" -h",
                self.paths.username()
            ))
            .await
    }

    // ── Submission ─────────────────────────────────────────────

    /// Submit a job: persist the record, spawn the init task, return
    /// immediately so the UI can attach to the init log.
    pub fn run(
        self: &Arc<Self>,
        job_name: &str,
        status: Option<StatusCallback>,
    ) -> Result<TrackedJob, EngineError> {
        if self.config.job(job_name).is_none() {
            return Err(EngineError::JobNotDefined(job_name.to_string()));
        }

        let job_id = JobId::generate(job_name);
        info!(job_id = %job_id, job_name, "submitting job");

        let job = TrackedJob::new(job_id.as_str(), job_name, now_iso());
        self.tracked.lock().push(job.clone());
        self.state.update(|s| s.jobs.push(job.clone()));

        if let Some(cb) = &status {
            cb("Starting initialization in background...");
        }

        let manager = Arc::clone(self);
        let id = job_id.as_str().to_string();
        let name = job_name.to_string();
        tokio::spawn(async move {
            manager.background_init(id, name).await;
        });

        Ok(job)
    }

    // ── Init pipeline ──────────────────────────────────────────

    fn check_canceled(&self, job_id: &str) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.cancel_requested.lock().contains(job_id)
    }

    fn append_init_log(&self, job_id: &str, started: std::time::Instant, msg: &str) {
        let stamped = format!("[{}] {msg}\n", tccp_core::elapsed_label(started.elapsed()));
        let path = self.init_log_path(job_id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = f.write_all(stamped.as_bytes());
        }
        debug!(job_id = %job_id, "init: {}", msg.trim());
    }

    async fn background_init(self: Arc<Self>, job_id: String, job_name: String) {
        let started = std::time::Instant::now();
        let result = self
            .init_pipeline(&job_id, &job_name, started)
            .await;

        match result {
            Ok(()) => {
                self.cancel_requested.lock().remove(&job_id);
                info!(job_id = %job_id, "initialization complete");
            }
            Err(e) => {
                let was_canceled = self.check_canceled(&job_id);
                let error = format!("Init failed: {e}");
                self.append_init_log(&job_id, started, &error);
                if !was_canceled {
                    warn!(job_id = %job_id, error = %e, "initialization failed");
                }

                {
                    let mut tracked = self.tracked.lock();
                    if let Some(job) = tracked.iter_mut().find(|j| j.job_id == job_id) {
                        if !was_canceled {
                            job.init_error = error.clone();
                        }
                        job.init_complete = true;
                    }
                }
                self.cancel_requested.lock().remove(&job_id);
                self.state.update(|s| {
                    if let Some(job) = s.job_mut(&job_id) {
                        if !was_canceled {
                            job.init_error = error.clone();
                        }
                        job.init_complete = true;
                    }
                });
            }
        }
    }

    async fn init_pipeline(
        self: &Arc<Self>,
        job_id: &str,
        job_name: &str,
        started: std::time::Instant,
    ) -> Result<(), EngineError> {
        let log = |msg: &str| self.append_init_log(job_id, started, msg);
        let ensure_not_canceled = |step: &str| -> Result<(), EngineError> {
            if self.check_canceled(job_id) {
                self.append_init_log(job_id, started, &format!("Canceled {step}"));
                return Err(EngineError::Canceled);
            }
            Ok(())
        };

        ensure_not_canceled("before initialization started")?;

        // 1. Resolve the resource profile (GPU partition early, so the
        //    allocation is submitted to the right place)
        let mut profile = self.allocs.resolve_profile(job_name);
        let spec = self
            .config
            .job(job_name)
            .ok_or_else(|| EngineError::JobNotDefined(job_name.to_string()))?
            .clone();
        let job_time = if spec.time.is_empty() {
            DEFAULT_JOB_TIME
        } else {
            &spec.time
        };
        let job_minutes = parse_time_minutes(job_time);

        if profile.wants_gpu() {
            log("Resolving GPU partition...");
            let login = self.allocs_login();
            let resolved = resolve_gpu_partition(
                &login,
                self.paths.username(),
                &profile.partition,
                &profile.gpu_type,
                profile.gpu_count,
            )
            .await?;
            profile.partition = resolved.partition.clone();
            if !resolved.gpu_type.is_empty() {
                profile.gpu_type = resolved.gpu_type.clone();
            }
            if !resolved.node_prefix.is_empty() {
                profile.node_constraint = resolved.node_prefix.clone();
            }
            log(&format!(
                "GPU partition: {} ({})",
                resolved.partition, resolved.gpu_type
            ));
        }

        // 2. Let just-finished jobs release their allocations first
        self.poll(None).await;

        // 3. Claim, wait on a pending one, or allocate fresh
        let mut claimed_existing = true;
        let alloc = match self.allocs.claim_free(job_minutes, &profile, job_id) {
            Some(alloc) => {
                log(&format!("Reusing allocation {} on {}", alloc.slurm_id, alloc.node));
                alloc
            }
            None => {
                claimed_existing = false;
                let waited = match self.allocs.find_pending(&profile) {
                    Some(pending) => {
                        log(&format!(
                            "Found pending allocation {}, waiting for node...",
                            pending.slurm_id
                        ));
                        self.allocs
                            .wait_for_allocation(&pending.slurm_id, None)
                            .await
                            .ok()
                    }
                    None => None,
                };
                match waited {
                    Some(alloc) => alloc,
                    None => {
                        log("No free allocation, requesting new one...");
                        self.allocs.allocate(&profile, None).await?
                    }
                }
            }
        };
        log(&format!("Using allocation {} on node {}", alloc.slurm_id, alloc.node));

        ensure_not_canceled("after allocation acquired (keeping allocation)")?;

        // 4. Directories on the gateway and the local output dir
        log("Setting up directories...");
        self.ensure_dirs(job_id, job_name).await;

        ensure_not_canceled("during setup")?;

        // 5. Environment (image + venv + dtach), with cache eviction
        let env_spec = environment_for(&self.config.env_type)?;
        self.envs
            .ensure_environment(env_spec, &alloc.node, None)
            .await?;

        ensure_not_canceled("during environment setup")?;

        // 6. Keys for ssh/scp hops and tunnels
        ensure_hop_keys(&self.dtn, None).await;

        // 7. Sync code to the compute-node scratch
        let scratch = self.paths.scratch_dir(job_id);
        log(&format!("Syncing code to {}...", alloc.node));
        self.sync
            .sync_to_scratch(&alloc.node, &scratch, &self.state, None)
            .await?;

        ensure_not_canceled("after sync")?;

        // 8. Launch under dtach
        log("Launching job on compute node...");
        let env_file_content = self.read_env_file();
        let ctx = LaunchContext {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            scratch: scratch.clone(),
            output_dir: self.paths.job_output_dir(job_id),
            cache_dir: if self.config.cache.is_empty() {
                String::new()
            } else {
                self.paths.shared_cache_dir()
            },
            log_path: self.paths.dtach_log(job_id),
            env_file_content,
            ports: spec.ports.clone(),
            image: self.paths.image_path(env_spec.sif_filename),
            venv: self.paths.venv_dir(),
            gpu: env_spec.gpu,
            payload: LaunchContext::payload_for(&spec),
        };
        launch_on_node(&self.dtn, &self.paths, &self.config, &ctx, &alloc.node, None).await?;
        log(&format!("Job launched successfully on {}", alloc.node));

        // 9. Port tunnels
        let mut tunnel_handles = Vec::new();
        if !spec.ports.is_empty() {
            if let Some(forwarder) = &self.forwarder {
                tunnel_handles = forwarder.start(&alloc.node, &spec.ports, None).await;
            }
        }
        if !tunnel_handles.is_empty() {
            self.tunnels
                .lock()
                .insert(job_id.to_string(), tunnel_handles);
        }

        // 10. Commit
        let start_time = now_iso();
        {
            let mut tracked = self.tracked.lock();
            if let Some(job) = tracked.iter_mut().find(|j| j.job_id == job_id) {
                job.alloc_slurm_id = alloc.slurm_id.clone();
                job.compute_node = alloc.node.clone();
                job.scratch_path = scratch.clone();
                job.init_complete = true;
                job.start_time = start_time.clone();
                job.forwarded_ports = spec.ports.clone();
            }
        }
        self.state.update(|s| {
            if let Some(job) = s.job_mut(job_id) {
                job.alloc_slurm_id = alloc.slurm_id.clone();
                job.compute_node = alloc.node.clone();
                job.scratch_path = scratch.clone();
                job.init_complete = true;
                job.start_time = start_time.clone();
                job.forwarded_ports = spec.ports.clone();
            }
        });
        if !claimed_existing {
            self.allocs.assign_job(&alloc.slurm_id, job_id);
        }

        Ok(())
    }

    /// The login connection the allocation manager uses (shared for GPU
    /// discovery).
    fn allocs_login(&self) -> Arc<dyn Remote> {
        self.allocs.login_connection()
    }

    async fn ensure_dirs(&self, job_id: &str, job_name: &str) {
        let base = self.paths.project_base();
        let env = self.paths.env_dir();
        let cc = self.paths.container_cache();
        let out = self.paths.job_output_dir(job_id);
        self.dtn
            .run(&format!(
                "mkdir -p {base} {env}/default/venv {cc}/images {cc}/cache {cc}/tmp {out}"
            ))
            .await;

        let local_output = self.project_dir.join("output").join(job_name);
        let _ = std::fs::create_dir_all(local_output);
    }

    fn read_env_file(&self) -> String {
        if self.config.env.is_empty() {
            return String::new();
        }
        std::fs::read_to_string(self.project_dir.join(&self.config.env)).unwrap_or_default()
    }

    // ── Polling ────────────────────────────────────────────────

    /// Detect completed jobs and process them.
    ///
    /// The tracked-jobs lock is held only to snapshot candidates and to
    /// apply decisions; all remote probes happen without it.
    pub async fn poll(&self, on_complete: Option<JobCallback>) {
        let candidates: Vec<TrackedJob> = {
            let tracked = self.tracked.lock();
            tracked
                .iter()
                .filter(|j| j.init_complete && !j.completed)
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let mut decisions = Vec::new();
        for job in &candidates {
            if !job.compute_node.is_empty() {
                let sock = self.paths.dtach_sock(&job.job_id);
                let check = self
                    .dtn
                    .run(&format!(
                        "ssh {SSH_OPTS_FAST} {} 'test -e {sock} && echo RUNNING || echo DONE'",
                        job.compute_node
                    ))
                    .await;

                if check.stdout.contains("DONE") {
                    // Socket gone = job done; the helper socket is the
                    // liveness signal, definitive exit codes are the
                    // viewer's job
                    decisions.push(PollDecision::Complete {
                        job_id: job.job_id.clone(),
                        exit_code: 0,
                    });
                } else if !check.stdout.contains("RUNNING") {
                    // Probe inconclusive: ask the scheduler about the
                    // allocation instead
                    if let Ok((state, _)) =
                        self.allocs.query_slurm_state(&job.alloc_slurm_id).await
                    {
                        if state.is_empty()
                            || matches!(state.as_str(), "COMPLETED" | "FAILED" | "CANCELLED")
                        {
                            debug!(
                                job_id = %job.job_id,
                                alloc = %job.alloc_slurm_id,
                                state,
                                "allocation gone, marking job complete"
                            );
                            decisions.push(PollDecision::Complete {
                                job_id: job.job_id.clone(),
                                exit_code: -1,
                            });
                        }
                    }
                }
            } else {
                match self.allocs.query_slurm_state(&job.alloc_slurm_id).await {
                    Ok((state, node)) if state == "RUNNING" && !node.is_empty() => {
                        decisions.push(PollDecision::FillNode {
                            job_id: job.job_id.clone(),
                            node,
                        });
                    }
                    Ok((state, _))
                        if state.is_empty()
                            || matches!(state.as_str(), "COMPLETED" | "FAILED" | "CANCELLED") =>
                    {
                        decisions.push(PollDecision::Complete {
                            job_id: job.job_id.clone(),
                            exit_code: -1,
                        });
                    }
                    _ => {}
                }
            }
        }

        let mut newly_completed = Vec::new();
        {
            let mut tracked = self.tracked.lock();
            for decision in decisions {
                match decision {
                    PollDecision::Complete { job_id, exit_code } => {
                        if let Some(job) = tracked.iter_mut().find(|j| j.job_id == job_id) {
                            if job.completed {
                                continue;
                            }
                            job.completed = true;
                            job.exit_code = exit_code;
                            job.end_time = now_iso();
                            newly_completed.push(job.clone());
                        }
                    }
                    PollDecision::FillNode { job_id, node } => {
                        if let Some(job) = tracked.iter_mut().find(|j| j.job_id == job_id) {
                            job.compute_node = node;
                        }
                    }
                }
            }
        }

        for job in &newly_completed {
            info!(job_id = %job.job_id, exit_code = job.exit_code, "job completed");
            self.allocs.release_job(&job.alloc_slurm_id);
            self.tunnels.lock().remove(&job.job_id);
            self.cleanup_compute_node(job).await;
            self.persist_job(job);
            self.try_return_output(job).await;
        }

        if !newly_completed.is_empty() {
            self.prune_completed_jobs();
        }

        if let Some(cb) = on_complete {
            for job in &newly_completed {
                cb(job);
            }
        }
    }

    async fn cleanup_compute_node(&self, job: &TrackedJob) {
        if job.compute_node.is_empty() {
            return;
        }
        let sock = self.paths.dtach_sock(&job.job_id);
        let log = self.paths.dtach_log(&job.job_id);
        self.dtn
            .run(&format!(
                "ssh {SSH_OPTS} {} 'rm -rf {} {sock} {log}'",
                job.compute_node, job.scratch_path
            ))
            .await;
    }

    /// Copy a tracked job's terminal fields into persistent state.
    fn persist_job(&self, job: &TrackedJob) {
        self.state.update(|s| {
            if let Some(stored) = s.job_mut(&job.job_id) {
                stored.completed = job.completed;
                stored.canceled = job.canceled;
                stored.exit_code = job.exit_code;
                stored.output_file = job.output_file.clone();
                stored.output_returned = job.output_returned;
                stored.end_time = job.end_time.clone();
            }
        });
    }

    /// Keep the latest terminal record per job name; drop older ones
    /// from both tracked jobs and state.
    pub fn prune_completed_jobs(&self) {
        let kept_ids: HashSet<String> = self.state.update(|s| {
            let mut latest_by_name: HashMap<&str, usize> = HashMap::new();
            let mut keep = vec![false; s.jobs.len()];

            for (i, job) in s.jobs.iter().enumerate() {
                if !job.is_terminal() {
                    keep[i] = true;
                    continue;
                }
                match latest_by_name.get(job.job_name.as_str()) {
                    Some(&prev) if s.jobs[prev].submit_time >= job.submit_time => {}
                    _ => {
                        latest_by_name.insert(&job.job_name, i);
                    }
                }
            }
            for (_, i) in latest_by_name {
                keep[i] = true;
            }

            let mut kept_ids = HashSet::new();
            let mut index = 0;
            s.jobs.retain(|job| {
                let k = keep[index];
                index += 1;
                if k {
                    kept_ids.insert(job.job_id.clone());
                }
                k
            });
            kept_ids
        });

        self.tracked
            .lock()
            .retain(|job| kept_ids.contains(&job.job_id));
    }

    // ── Cancellation ───────────────────────────────────────────

    pub async fn cancel_job(
        &self,
        job_name: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        let job = self
            .find_by_name(job_name)
            .ok_or_else(|| EngineError::JobNotFound(job_name.to_string()))?;
        if let Some(cb) = &status {
            cb(&format!("Canceling job '{job_name}'..."));
        }
        self.do_cancel(&job).await?;
        if let Some(cb) = &status {
            if job.alloc_slurm_id.is_empty() {
                cb(&format!("Job '{job_name}' canceled during initialization"));
            } else {
                cb(&format!(
                    "Job '{job_name}' canceled (allocation {} kept alive)",
                    job.alloc_slurm_id
                ));
            }
        }
        Ok(())
    }

    pub async fn cancel_job_by_id(
        &self,
        job_id: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        let job = self
            .tracked
            .lock()
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if let Some(cb) = &status {
            cb(&format!("Canceling job '{}'...", job.job_name));
        }
        self.do_cancel(&job).await
    }

    async fn do_cancel(&self, job: &TrackedJob) -> Result<(), EngineError> {
        // Still initializing: set the marker, the init task aborts at
        // its next checkpoint. The allocation being prepared stays.
        if !job.init_complete {
            self.cancel_requested.lock().insert(job.job_id.clone());
            self.mark_canceled(&job.job_id);
            return Ok(());
        }

        // Verify remote state first so we don't re-cancel a job that
        // already finished on its own
        let sock = self.paths.dtach_sock(&job.job_id);
        let check = self
            .dtn
            .run(&format!(
                "ssh {SSH_OPTS_FAST} {} 'test -e {sock} && echo RUNNING || echo DONE'",
                job.compute_node
            ))
            .await;

        if check.stdout.contains("DONE") {
            {
                let mut tracked = self.tracked.lock();
                if let Some(stored) = tracked.iter_mut().find(|j| j.job_id == job.job_id) {
                    stored.completed = true;
                }
            }
            self.state.update(|s| {
                if let Some(stored) = s.job_mut(&job.job_id) {
                    stored.completed = true;
                }
            });
            if job.canceled {
                return Err(EngineError::AlreadyCanceled(job.job_name.clone()));
            }
            return Err(EngineError::AlreadyCompleted {
                name: job.job_name.clone(),
                exit_code: job.exit_code,
            });
        }

        // Kill the dtach process via its socket
        self.dtn
            .run(&format!(
                "ssh {SSH_OPTS_FAST} {} 'fuser -k -9 {sock} 2>/dev/null'",
                job.compute_node
            ))
            .await;

        let canceled = self.mark_canceled(&job.job_id);
        self.tunnels.lock().remove(&job.job_id);
        if let Some(canceled) = canceled {
            self.cleanup_compute_node(&canceled).await;
        }
        if !job.alloc_slurm_id.is_empty() {
            self.allocs.release_job(&job.alloc_slurm_id);
        }
        Ok(())
    }

    /// Mark a job canceled + completed with exit 130 (128 + SIGINT) in
    /// both tracked state and persistent state.
    fn mark_canceled(&self, job_id: &str) -> Option<TrackedJob> {
        let end_time = now_iso();
        let updated = {
            let mut tracked = self.tracked.lock();
            tracked.iter_mut().find(|j| j.job_id == job_id).map(|job| {
                job.canceled = true;
                job.completed = true;
                job.exit_code = 130;
                job.end_time = end_time.clone();
                job.clone()
            })
        };
        self.state.update(|s| {
            if let Some(job) = s.job_mut(job_id) {
                job.canceled = true;
                job.completed = true;
                job.exit_code = 130;
                job.end_time = end_time.clone();
            }
        });
        updated
    }

    // ── Output retrieval ───────────────────────────────────────

    /// Download a job's persistent output tree into
    /// `<project>/tccp-output/<job_id>/`, then remove the remote copy.
    pub async fn return_output(
        &self,
        job_id: &str,
        status: Option<StatusCallback>,
    ) -> Result<(), EngineError> {
        let remote_output = self.paths.job_output_dir(job_id);
        let files = self.list_remote_files(&remote_output).await;
        if files.is_empty() {
            if let Some(cb) = &status {
                cb("No output files found.");
            }
            return Ok(());
        }

        let local_base = self.project_dir.join("tccp-output").join(job_id);
        let mut count = 0;
        for remote_file in &files {
            let Some(rel) = relative_to(&remote_output, remote_file) else {
                continue;
            };
            let result = self
                .dtn
                .download(remote_file, &local_base.join(rel))
                .await;
            if result.failed() {
                return Err(EngineError::Sync(format!(
                    "download failed for {remote_file}: {}",
                    result.output()
                )));
            }
            count += 1;
        }

        if let Some(cb) = &status {
            cb(&format!("Downloaded {count} files to tccp-output/{job_id}/"));
        }

        self.dtn.run(&format!("rm -rf {remote_output}")).await;
        self.mark_output_returned(job_id);
        Ok(())
    }

    /// Automatic post-completion variant: on partial failure the remote
    /// output is preserved and retried on a later poll.
    pub async fn try_return_output(&self, job: &TrackedJob) {
        if job.output_returned {
            return;
        }
        let remote_output = self.paths.job_output_dir(&job.job_id);
        let files = self.list_remote_files(&remote_output).await;
        if files.is_empty() {
            // Nothing to fetch — consider it returned
            self.mark_output_returned(&job.job_id);
            return;
        }

        let local_base = self.project_dir.join("tccp-output").join(&job.job_id);
        for remote_file in &files {
            let Some(rel) = relative_to(&remote_output, remote_file) else {
                continue;
            };
            let result = self
                .dtn
                .download(remote_file, &local_base.join(rel))
                .await;
            if result.failed() {
                warn!(job_id = %job.job_id, file = %remote_file, "auto-return failed, remote output preserved");
                return;
            }
        }

        self.dtn.run(&format!("rm -rf {remote_output}")).await;
        self.mark_output_returned(&job.job_id);
        info!(job_id = %job.job_id, "output auto-returned");
    }

    async fn list_remote_files(&self, remote_dir: &str) -> Vec<String> {
        let result = self
            .dtn
            .run(&format!("find {remote_dir} -type f 2>/dev/null"))
            .await;
        result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn mark_output_returned(&self, job_id: &str) {
        {
            let mut tracked = self.tracked.lock();
            if let Some(job) = tracked.iter_mut().find(|j| j.job_id == job_id) {
                job.output_returned = true;
            }
        }
        self.state.update(|s| {
            if let Some(job) = s.job_mut(job_id) {
                job.output_returned = true;
            }
        });
    }

    // ── Shutdown ───────────────────────────────────────────────

    /// Cancel all jobs that are still initializing (optionally used at
    /// shutdown). Their in-flight allocations are left for the caller.
    pub async fn cancel_initializing_jobs(&self, status: Option<StatusCallback>) -> Vec<String> {
        let targets: Vec<TrackedJob> = self
            .tracked
            .lock()
            .iter()
            .filter(|j| !j.init_complete && !j.completed)
            .cloned()
            .collect();

        let mut alloc_ids = Vec::new();
        for job in targets {
            if let Some(cb) = &status {
                cb(&format!("Canceling initializing job '{}'", job.job_id));
            }
            let _ = self.do_cancel(&job).await;
            if !job.alloc_slurm_id.is_empty() {
                alloc_ids.push(job.alloc_slurm_id);
            }
        }
        alloc_ids
    }

    /// Signal init tasks to stop at their next checkpoint and tear down
    /// tunnels. Tasks are detached, not joined — they observe the flag
    /// and exit, keeping shutdown latency bounded.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.tunnels.lock().clear();
    }
}

/// Path of `full` relative to `base` (both remote, slash separated).
fn relative_to(base: &str, full: &str) -> Option<String> {
    let rest = full.strip_prefix(base)?.trim_start_matches('/');
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
