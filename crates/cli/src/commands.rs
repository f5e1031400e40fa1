// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command execution: connect once, run one command, disconnect.

use crate::{Cli, Command};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tccp_core::StatusCallback;
use tccp_engine::{ProjectConfig, TccpService};
use tccp_ssh::SessionTarget;

fn status_printer() -> StatusCallback {
    Arc::new(|msg: &str| eprintln!("  {msg}"))
}

pub(crate) async fn execute(cli: Cli) -> Result<()> {
    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let config = ProjectConfig::load(&project_dir)?;

    let target = SessionTarget::new(&cli.host, &cli.user, &cli.password);
    let service = TccpService::connect(
        project_dir,
        config,
        target,
        cli.login_host.clone(),
        cli.user.clone(),
        status_printer(),
    )
    .await?;

    let result = dispatch(&service, &cli.command).await;
    service.disconnect().await;
    result
}

async fn dispatch(service: &TccpService, command: &Command) -> Result<()> {
    match command {
        Command::Run { job_name } => {
            let job = service.run_job(job_name, Some(status_printer()))?;
            println!("Submitted {} ({})", job.job_name, job.job_id);
            println!("Init log: {}", service.init_log_path(&job.job_id).display());

            // Follow initialization until it settles
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                let Some(current) = service.find_job_by_name(job_name) else {
                    break;
                };
                if current.init_complete || current.completed {
                    if !current.init_error.is_empty() {
                        return Err(anyhow!("{}", current.init_error));
                    }
                    println!("Job {} on {}", current.status(), current.compute_node);
                    break;
                }
            }
            Ok(())
        }

        Command::Jobs => {
            let jobs = service.list_jobs();
            if jobs.is_empty() {
                println!("No tracked jobs.");
                return Ok(());
            }
            println!(
                "{:<32} {:<12} {:<20} {:<10} {:<10} {}",
                "JOB", "NAME", "STATUS", "ALLOC", "NODE", "PORTS"
            );
            for j in jobs {
                println!(
                    "{:<32} {:<12} {:<20} {:<10} {:<10} {}",
                    j.job_id, j.job_name, j.status, j.slurm_id, j.compute_node, j.ports
                );
            }
            Ok(())
        }

        Command::Cancel { job_name } => {
            service.cancel_job(job_name, Some(status_printer())).await?;
            Ok(())
        }

        Command::Allocs => {
            service.reconcile_allocations(None).await;
            let allocs = service.list_allocations();
            if allocs.is_empty() {
                println!("No allocations.");
                return Ok(());
            }
            println!(
                "{:<10} {:<12} {:<10} {:<14} {:<8} {}",
                "ALLOC", "NODE", "PARTITION", "GPU", "STATUS", "REMAINING"
            );
            for a in allocs {
                println!(
                    "{:<10} {:<12} {:<10} {:<14} {:<8} {}",
                    a.slurm_id, a.node, a.partition, a.gpu, a.status, a.remaining
                );
            }
            Ok(())
        }

        Command::Dealloc { slurm_id } => {
            service
                .deallocate(slurm_id.as_deref(), Some(status_printer()))
                .await;
            Ok(())
        }

        Command::Output { job_id } => {
            service
                .return_output(job_id, Some(status_printer()))
                .await?;
            Ok(())
        }

        Command::Exec { command } => {
            let cmd = command.join(" ");
            let result = service.exec_remote(&cmd).await;
            print!("{}", result.stdout);
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            if result.failed() {
                return Err(anyhow!("command exited with {}", result.exit_code));
            }
            Ok(())
        }

        Command::List => {
            let result = service.list_scheduler_jobs(None).await;
            print!("{}", result.stdout);
            Ok(())
        }
    }
}
