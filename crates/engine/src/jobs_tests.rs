// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::cache::CacheManager;
use crate::config::JobSpec;
use std::collections::BTreeMap;
use tccp_core::{job_name_from_id, Allocation, JobStatus, SlurmProfile};
use tccp_ssh::FakeRemote;
use tccp_storage::StateStore;

struct Fixture {
    manager: Arc<JobManager>,
    fake: FakeRemote,
    dir: tempfile::TempDir,
}

fn fixture(config: ProjectConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();

    let fake = FakeRemote::new();
    // Environment exists unless a test overrides these
    fake.on(
        "IMAGE_OK || echo",
        tccp_core::SshResult::ok("IMAGE_OK\nVENV_OK\nDTACH_OK"),
    );
    fake.on("===TOTAL===", tccp_core::SshResult::ok("===TOTAL===\n100\n===END==="));
    fake.on("ssh-keygen", tccp_core::SshResult::ok("KEYS_OK"));

    let remote: Arc<dyn Remote> = Arc::new(fake.clone());
    let paths = RemotePaths::new("alice", "proj");
    let config = Arc::new(config);
    let state = Arc::new(StateHandle::load(StateStore::at_path(
        dir.path().join("state.yaml"),
    )));
    let allocs = Arc::new(AllocationManager::new(
        Arc::clone(&config),
        paths.clone(),
        Arc::clone(&remote),
        Arc::clone(&remote),
        Arc::clone(&state),
    ));
    let sync = Arc::new(SyncManager::new(
        dir.path().to_path_buf(),
        Arc::clone(&config),
        Arc::clone(&remote),
    ));
    let cache = Arc::new(CacheManager::new(Arc::clone(&remote), paths.clone()));
    let envs = Arc::new(EnvManager::new(
        Arc::clone(&remote),
        paths.clone(),
        cache,
        "proj",
    ));

    let manager = JobManager::new(
        Arc::clone(&config),
        paths,
        dir.path().to_path_buf(),
        dir.path().join("logs"),
        "dtn.cluster.edu".into(),
        remote,
        allocs,
        sync,
        envs,
        None,
        state,
    );

    Fixture { manager, fake, dir }
}

fn basic_config() -> ProjectConfig {
    let mut jobs = BTreeMap::new();
    jobs.insert(
        "main".to_string(),
        JobSpec {
            script: "main.py".into(),
            ..Default::default()
        },
    );
    ProjectConfig {
        name: "proj".into(),
        jobs,
        ..Default::default()
    }
}

async fn wait_for_init(manager: &Arc<JobManager>, job_id: &str) {
    for _ in 0..400 {
        let done = manager
            .tracked_jobs()
            .iter()
            .find(|j| j.job_id == job_id)
            .map(|j| j.init_complete || j.completed)
            .unwrap_or(false);
        if done {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("init did not finish for {job_id}");
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_project_submits_allocation_and_launches() {
    let f = fixture(basic_config());
    f.fake
        .on("sbatch", tccp_core::SshResult::ok("Submitted batch job 900\n"));
    f.fake
        .on("squeue -j 900", tccp_core::SshResult::ok("RUNNING c007\n"));

    let job = f.manager.run("main", None).unwrap();
    assert!(!job.init_complete);
    assert_eq!(job.status(), JobStatus::Initializing);
    // Record persisted immediately
    assert!(f
        .manager
        .tracked_jobs()
        .iter()
        .any(|j| j.job_id == job.job_id));

    wait_for_init(&f.manager, &job.job_id).await;

    let done = f.manager.find_by_name("main").unwrap();
    assert!(done.init_error.is_empty(), "init error: {}", done.init_error);
    assert!(done.init_complete);
    assert_eq!(done.compute_node, "c007");
    assert_eq!(done.alloc_slurm_id, "900");
    assert!(done.scratch_path.contains("/tmp/alice/proj/"));
    assert_eq!(done.status(), JobStatus::Running);

    // CPU-only defaults in the submitted sbatch script
    let sbatch = f.fake.calls_matching("TCCP_ALLOC_EOF");
    assert!(sbatch[0].contains("#SBATCH --partition=batch"));
    assert!(sbatch[0].contains("#SBATCH --nodes=1"));
    assert!(sbatch[0].contains("#SBATCH --cpus-per-task=1"));
    assert!(sbatch[0].contains("#SBATCH --mem=4G"));

    // Full sync happened, then dtach launch
    assert!(!f.fake.calls_matching("tar cf - . |").is_empty());
    assert!(!f.fake.calls_matching("dtach -n").is_empty());

    // The allocation is bound to this job
    let alloc = f.manager.allocs().find_by_id("900").unwrap();
    assert_eq!(alloc.active_job_id, done.job_id);

    // Init log has content
    let log = std::fs::read_to_string(f.manager.init_log_path(&done.job_id)).unwrap();
    assert!(log.contains("Launching job on compute node..."));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_job_reuses_idle_allocation_without_sbatch() {
    let f = fixture(basic_config());
    f.manager.allocs().state().update(|s| {
        s.allocations.push(Allocation {
            slurm_id: "800".into(),
            node: "c001".into(),
            start_time: tccp_core::now_iso(),
            duration_minutes: 240,
            resources: SlurmProfile {
                cpus_per_task: 2,
                memory: "4G".into(),
                ..Default::default()
            },
            ..Default::default()
        });
    });

    let job = f.manager.run("main", None).unwrap();
    wait_for_init(&f.manager, &job.job_id).await;

    let done = f.manager.find_by_name("main").unwrap();
    assert!(done.init_error.is_empty(), "init error: {}", done.init_error);
    assert_eq!(done.alloc_slurm_id, "800");
    // No new submission happened
    assert!(f.fake.calls_matching("sbatch").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn undefined_job_is_rejected() {
    let f = fixture(basic_config());
    assert!(matches!(
        f.manager.run("nope", None),
        Err(EngineError::JobNotDefined(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_init_aborts_pipeline() {
    let f = fixture(basic_config());
    // Allocation wait never resolves: scheduler keeps reporting PENDING
    f.fake
        .on("sbatch", tccp_core::SshResult::ok("Submitted batch job 901\n"));
    f.fake.on("squeue -j 901", tccp_core::SshResult::ok("PENDING \n"));

    let job = f.manager.run("main", None).unwrap();
    // Give the init task a moment to get into the allocation wait
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    f.manager.cancel_job("main", None).await.unwrap();

    let canceled = f.manager.find_by_name("main").unwrap();
    assert!(canceled.canceled);
    assert!(canceled.completed);
    assert_eq!(canceled.exit_code, 130);
    assert_eq!(canceled.status(), JobStatus::Aborted);

    wait_for_init(&f.manager, &job.job_id).await;
    // Canceled init leaves no init_error
    let after = f.manager.find_by_name("main").unwrap();
    assert!(after.init_error.is_empty());
    // No launch was attempted
    assert!(f.fake.calls_matching("dtach -n").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_completes_job_when_socket_gone() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "700");

    f.fake
        .on("test -e /tmp/tccp_2025", tccp_core::SshResult::ok("DONE"));
    // No remote output
    f.fake.on("find ", tccp_core::SshResult::ok(""));

    let completed_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&completed_seen);
    let cb: JobCallback = Arc::new(move |job: &TrackedJob| {
        seen.lock().push(job.job_id.clone());
    });
    f.manager.poll(Some(cb)).await;

    let job = f.manager.find_by_name("main").unwrap();
    assert!(job.completed);
    assert_eq!(job.exit_code, 0);
    assert!(job.output_returned); // nothing to fetch counts as returned
    assert_eq!(completed_seen.lock().as_slice(), [job_id.to_string()]);

    // Allocation released, scratch cleaned
    assert!(f.manager.allocs().find_by_id("700").unwrap().is_idle());
    assert!(!f.fake.calls_matching("rm -rf /tmp/alice/proj/").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_marks_exit_minus_one_when_allocation_died() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "701");

    // Socket probe inconclusive (hop fails), allocation gone
    f.fake
        .on("test -e /tmp/tccp_2025", tccp_core::SshResult::ok("ssh: connect refused"));
    f.fake.on("squeue -j 701", tccp_core::SshResult::ok("FAILED \n"));
    f.fake.on("find ", tccp_core::SshResult::ok(""));

    f.manager.poll(None).await;

    let job = f.manager.find_by_name("main").unwrap();
    assert!(job.completed);
    assert_eq!(job.exit_code, -1);
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_fills_node_for_pending_jobs() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "702");
    // Clear the node to simulate a pending allocation
    f.manager.state_handle().update(|s| {
        s.job_mut(job_id).unwrap().compute_node.clear();
    });
    {
        let mut tracked = f.manager.tracked.lock();
        tracked
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .unwrap()
            .compute_node
            .clear();
    }

    f.fake
        .on("squeue -j 702", tccp_core::SshResult::ok("RUNNING c099\n"));
    f.manager.poll(None).await;

    let job = f.manager.find_by_name("main").unwrap();
    assert!(!job.completed);
    assert_eq!(job.compute_node, "c099");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_running_job_checks_remote_first() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "703");

    // Remote says the job already finished on its own
    f.fake
        .on("test -e /tmp/tccp_2025", tccp_core::SshResult::ok("DONE"));

    let err = f.manager.cancel_job("main", None).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted { .. }));
    // No kill was issued
    assert!(f.fake.calls_matching("fuser -k").is_empty());
    // Local state caught up
    assert!(f.manager.find_by_name("main").unwrap().completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_running_job_kills_and_releases() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "704");

    f.fake
        .on("test -e /tmp/tccp_2025", tccp_core::SshResult::ok("RUNNING"));

    f.manager.cancel_job("main", None).await.unwrap();

    let job = f.manager.find_by_name("main").unwrap();
    assert!(job.canceled && job.completed);
    assert_eq!(job.exit_code, 130);
    assert_eq!(f.fake.calls_matching("fuser -k -9").len(), 1);
    assert!(f.manager.allocs().find_by_id("704").unwrap().is_idle());
    // Scratch cleaned up
    assert!(!f.fake.calls_matching("rm -rf /tmp/alice/proj/").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn prune_keeps_latest_terminal_record_per_name() {
    let f = fixture(basic_config());
    f.manager.state_handle().update(|s| {
        for (id, submit, completed) in [
            ("2025-01-15T09-00-00-000__main", "2025-01-15T09:00:00", true),
            ("2025-01-15T10-00-00-000__main", "2025-01-15T10:00:00", true),
            ("2025-01-15T11-00-00-000__main", "2025-01-15T11:00:00", false),
        ] {
            let mut job = TrackedJob::new(id, "main", submit.to_string());
            job.init_complete = true;
            job.completed = completed;
            if completed {
                job.exit_code = 0;
            }
            s.jobs.push(job);
        }
    });
    // Mirror into tracked
    {
        let jobs = f.manager.state_handle().with(|s| s.jobs.clone());
        *f.manager.tracked.lock() = jobs;
    }

    f.manager.prune_completed_jobs();

    let remaining: Vec<String> = f
        .manager
        .tracked_jobs()
        .iter()
        .map(|j| j.job_id.clone())
        .collect();
    // Oldest terminal record dropped; latest terminal + live kept
    assert_eq!(
        remaining,
        [
            "2025-01-15T10-00-00-000__main".to_string(),
            "2025-01-15T11-00-00-000__main".to_string(),
        ]
    );
    // State pruned identically
    assert_eq!(f.manager.state_handle().with(|s| s.jobs.len()), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn return_output_downloads_preserving_relative_paths() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "705");

    let out = format!("/cluster/home/alice/tccp/projects/proj/output/{job_id}");
    f.fake.on(
        "find ",
        tccp_core::SshResult::ok(format!("{out}/model.pt\n{out}/logs/train.log\n")),
    );
    let encoded = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(b"bytes")
    };
    f.fake.on("base64 ", tccp_core::SshResult::ok(encoded));

    f.manager.return_output(job_id, None).await.unwrap();

    let base = f.dir.path().join("tccp-output").join(job_id);
    assert!(base.join("model.pt").exists());
    assert!(base.join("logs/train.log").exists());

    // Remote output removed and flag persisted
    assert!(!f.fake.calls_matching(&format!("rm -rf {out}")).is_empty());
    assert!(f
        .manager
        .state_handle()
        .with(|s| s.job(job_id).unwrap().output_returned));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_download_preserves_remote_output() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "706");

    let out = format!("/cluster/home/alice/tccp/projects/proj/output/{job_id}");
    f.fake
        .on("find ", tccp_core::SshResult::ok(format!("{out}/model.pt\n")));
    f.fake.on("base64 ", tccp_core::SshResult::err("io error"));

    let job = f.manager.find_by_name("main").unwrap();
    f.manager.try_return_output(&job).await;

    // Remote copy retained for a later retry
    assert!(f.fake.calls_matching(&format!("rm -rf {out}")).is_empty());
    assert!(!f
        .manager
        .state_handle()
        .with(|s| s.job(job_id).unwrap().output_returned));
}

#[tokio::test(flavor = "multi_thread")]
async fn viewer_context_for_live_job() {
    let f = fixture(basic_config());
    let job_id = "2025-01-15T10-00-00-000__main";
    seed_running_job(&f, job_id, "707");

    let ctx = f.manager.viewer_context("main").unwrap();
    assert_eq!(ctx.compute_node, "c001");
    assert_eq!(ctx.sock_path, format!("/tmp/tccp_{job_id}.sock"));
    assert_eq!(ctx.user, "alice");
    assert_eq!(ctx.gateway_host, "dtn.cluster.edu");
    assert!(!ctx.canceled);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_initializing_jobs_sweeps_pending_inits() {
    let f = fixture(basic_config());
    f.fake
        .on("sbatch", tccp_core::SshResult::ok("Submitted batch job 910\n"));
    f.fake.on("squeue -j 910", tccp_core::SshResult::ok("PENDING \n"));

    let job = f.manager.run("main", None).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(f.manager.initializing_count(), 1);

    f.manager.cancel_initializing_jobs(None).await;
    wait_for_init(&f.manager, &job.job_id).await;

    let after = f.manager.find_by_name("main").unwrap();
    assert!(after.canceled && after.completed);
    assert_eq!(after.exit_code, 130);
    assert_eq!(f.manager.initializing_count(), 0);
}

/// Insert a launched, running job into tracked + persistent state.
fn seed_running_job(f: &Fixture, job_id: &str, slurm_id: &str) {
    let mut job = TrackedJob::new(job_id, job_name_from_id(job_id), tccp_core::now_iso());
    job.init_complete = true;
    job.alloc_slurm_id = slurm_id.to_string();
    job.compute_node = "c001".into();
    job.scratch_path = format!("/tmp/alice/proj/{job_id}");
    job.start_time = tccp_core::now_iso();

    f.manager.state_handle().update(|s| {
        s.allocations.push(Allocation {
            slurm_id: slurm_id.to_string(),
            node: "c001".into(),
            start_time: tccp_core::now_iso(),
            duration_minutes: 240,
            active_job_id: job_id.to_string(),
            ..Default::default()
        });
        s.jobs.push(job.clone());
    });
    f.manager.tracked.lock().push(job);
}
