//! Command-line surface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::sleep;
use tracing::info;

use crate::api::{ClusterStatus, JobReport, SubmitJobRequest, SubmitJobResponse};
use crate::client::LeaderClient;
use crate::config::ClusterConfig;
use crate::error::{EngineError, Result};
use crate::model::{JobManifest, JobState};
use crate::worker::WorkerConfig;

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_LEADER: i32 = 3;
pub const EXIT_JOB_FAILED: i32 = 4;
pub const EXIT_CLUSTER_UNHEALTHY: i32 = 5;

#[derive(Parser)]
#[command(name = "gristmill", about = "Distributed MapReduce batch engine", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Submit a job described by a manifest file.
    Submit {
        /// Path to a YAML job manifest (inputs + code_ref).
        manifest: PathBuf,
        /// Number of reduce partitions.
        #[arg(long)]
        reducers: u32,
        /// Map task count; defaults to one per input split.
        #[arg(long)]
        maps: Option<u32>,
        /// Coordinator address; repeat for each peer.
        #[arg(long = "coordinator", default_value = "127.0.0.1:7070")]
        coordinators: Vec<String>,
        /// Block until the job reaches a terminal state.
        #[arg(long)]
        wait: bool,
    },
    /// Show a job's state and per-task progress.
    Status {
        job_id: String,
        #[arg(long = "coordinator", default_value = "127.0.0.1:7070")]
        coordinators: Vec<String>,
    },
    /// Cancel a running job.
    Cancel {
        job_id: String,
        #[arg(long = "coordinator", default_value = "127.0.0.1:7070")]
        coordinators: Vec<String>,
    },
    /// Show replica-group health.
    ClusterStatus {
        #[arg(long = "coordinator", default_value = "127.0.0.1:7070")]
        coordinators: Vec<String>,
    },
    /// Run a coordinator replica.
    Coordinator {
        /// Path to the cluster configuration YAML.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a worker process.
    Worker {
        /// Path to the worker configuration YAML.
        #[arg(long)]
        config: PathBuf,
    },
}

/// Exit code for a failed command, per the documented contract.
pub fn exit_code_for(err: &EngineError) -> i32 {
    match err {
        EngineError::NotLeader { .. } => EXIT_NOT_LEADER,
        EngineError::JobFailed { .. } => EXIT_JOB_FAILED,
        EngineError::Unavailable(_) => EXIT_CLUSTER_UNHEALTHY,
        _ => 1,
    }
}

pub async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Submit {
            manifest,
            reducers,
            maps,
            coordinators,
            wait,
        } => submit(manifest, reducers, maps, coordinators, wait).await,
        Command::Status {
            job_id,
            coordinators,
        } => status(job_id, coordinators).await,
        Command::Cancel {
            job_id,
            coordinators,
        } => cancel(job_id, coordinators).await,
        Command::ClusterStatus { coordinators } => cluster_status(coordinators).await,
        Command::Coordinator { config } => {
            let config = ClusterConfig::load(&config)
                .with_context(|| format!("loading cluster config from {}", config.display()))?;
            crate::coordinator::server::run(config).await
        }
        Command::Worker { config } => {
            let config = WorkerConfig::load(&config)
                .with_context(|| format!("loading worker config from {}", config.display()))?;
            crate::worker::run(config).await
        }
    }
}

async fn submit(
    manifest_path: PathBuf,
    reducers: u32,
    maps: Option<u32>,
    coordinators: Vec<String>,
    wait: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading job manifest {}", manifest_path.display()))?;
    let manifest: JobManifest = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing job manifest {}", manifest_path.display()))?;
    let client = LeaderClient::new(coordinators)?;
    let response: SubmitJobResponse = client
        .post(
            "/api/jobs",
            &SubmitJobRequest {
                manifest,
                map_hint: maps,
                reduce_count: reducers,
            },
        )
        .await?;
    println!("{}", response.job_id);
    if wait {
        poll_until_terminal(&client, &response.job_id.to_string()).await?;
    }
    Ok(())
}

async fn poll_until_terminal(client: &LeaderClient, job_id: &str) -> Result<()> {
    loop {
        let report: JobReport = client.get(&format!("/api/jobs/{job_id}")).await?;
        info!(state = ?report.state, "job state");
        match report.state {
            JobState::Completed => {
                print_report(&report);
                return Ok(());
            }
            JobState::Failed => {
                print_report(&report);
                return Err(EngineError::JobFailed {
                    job_id: report.job_id,
                    reason: report
                        .failure_reason
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
            _ => sleep(Duration::from_secs(2)).await,
        }
    }
}

async fn status(job_id: String, coordinators: Vec<String>) -> Result<()> {
    let client = LeaderClient::new(coordinators)?;
    let report: JobReport = client.get(&format!("/api/jobs/{job_id}")).await?;
    print_report(&report);
    if report.state == JobState::Failed {
        return Err(EngineError::JobFailed {
            job_id: report.job_id,
            reason: report
                .failure_reason
                .unwrap_or_else(|| "unknown".to_string()),
        });
    }
    Ok(())
}

async fn cancel(job_id: String, coordinators: Vec<String>) -> Result<()> {
    let client = LeaderClient::new(coordinators)?;
    let report: JobReport = client.post(&format!("/api/jobs/{job_id}/cancel"), &()).await?;
    println!("job {} -> {:?}", report.job_id, report.state);
    Ok(())
}

async fn cluster_status(coordinators: Vec<String>) -> Result<()> {
    let client = LeaderClient::new(coordinators)?;
    let status: ClusterStatus = client.get("/api/cluster").await?;
    println!(
        "node {} | leader: {} | term {} | peers: {}",
        status.node_id,
        status
            .leader
            .map(|l| l.to_string())
            .unwrap_or_else(|| "none".to_string()),
        status.term,
        status.peers.join(", ")
    );
    if !status.healthy {
        return Err(EngineError::Unavailable("cluster has no leader".into()));
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    println!("job     {}", report.job_id);
    println!("state   {:?}", report.state);
    for task in &report.tasks {
        println!(
            "  {:<28} {:>9?}  attempt {}  {:>5.1}%",
            task.task.to_string(),
            task.state,
            task.attempt,
            task.progress * 100.0
        );
    }
    if !report.output_uris.is_empty() {
        println!("outputs:");
        for uri in &report.output_uris {
            println!("  {uri}");
        }
    }
    if let Some(reason) = &report.failure_reason {
        println!("failure: {reason}");
    }
}
