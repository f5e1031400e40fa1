// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tccp: submit and supervise batch workloads on a 2FA-gated cluster.
//!
//! One interactive 2FA prompt per invocation; everything else rides the
//! single authenticated transport. The interactive REPL lives in a
//! separate frontend — this binary wires single commands to the engine.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tccp", version, about = "Cluster control plane for batch workloads")]
pub(crate) struct Cli {
    /// Gateway (DTN) host
    #[arg(long, env = "TCCP_HOST")]
    pub host: String,

    /// Cluster username
    #[arg(long, env = "TCCP_USER")]
    pub user: String,

    /// Password (prefer TCCP_PASSWORD over the flag)
    #[arg(long, env = "TCCP_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Login node for scheduler commands
    #[arg(long, env = "TCCP_LOGIN_HOST")]
    pub login_host: String,

    /// Project directory (defaults to the current directory)
    #[arg(long)]
    pub project: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit a named job and stream its init log
    Run { job_name: String },
    /// List tracked jobs
    Jobs,
    /// Cancel a job by name
    Cancel { job_name: String },
    /// List allocations
    Allocs,
    /// Cancel an allocation (all idle ones when no id given)
    Dealloc { slurm_id: Option<String> },
    /// Download a finished job's output
    Output { job_id: String },
    /// Run an ad-hoc command on the login node
    Exec { command: Vec<String> },
    /// Raw squeue listing for this user
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli).await
}
