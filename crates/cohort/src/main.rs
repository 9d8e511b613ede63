//! Cohort: distributed job scheduler
//!
//! Main binary with subcommands:
//! - `run`: Start an in-process cluster against shared in-memory stores
//! - `config`: Print the effective node configuration as JSON

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use cohort_scheduler::SchedulerConfig;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cluster;

/// Parse boolean from environment variable, accepting common truthy values.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Distributed job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Node settings. Flags override the config file, which overrides defaults.
#[derive(Args, Debug, Clone)]
struct NodeArgs {
    /// JSON file with node settings
    #[arg(long, env = "COHORT_CONFIG")]
    config: Option<PathBuf>,

    /// Main loop and heartbeat cadence in milliseconds
    #[arg(long, env = "COHORT_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: Option<u64>,

    /// Silence in milliseconds after which a peer is considered stalled
    #[arg(long, env = "COHORT_HEARTBEAT_TIMEOUT_MS")]
    heartbeat_timeout_ms: Option<u64>,

    /// Concurrent job executions per node
    #[arg(long, env = "COHORT_WORKERS")]
    workers: Option<usize>,

    /// Remove the node's registration on a clean stop
    #[arg(long, env = "COHORT_DEREGISTER_ON_STOP", value_parser = parse_bool_env)]
    deregister_on_stop: Option<bool>,
}

impl NodeArgs {
    fn load(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => SchedulerConfig::default(),
        };
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(workers) = self.workers {
            config.worker_capacity = workers;
        }
        if let Some(deregister) = self.deregister_on_stop {
            config.deregister_on_stop = deregister;
        }
        config.validate().into_diagnostic()?;
        Ok(config)
    }
}

fn read_config(path: &Path) -> Result<SchedulerConfig> {
    let raw = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid config in {}", path.display()))
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster until the timer elapses or Ctrl-C
    Run {
        #[command(flatten)]
        node: NodeArgs,

        /// Number of scheduler nodes
        #[arg(long, env = "COHORT_NODES", default_value = "3")]
        nodes: usize,

        /// Number of recurring jobs
        #[arg(long, env = "COHORT_JOBS", default_value = "10")]
        jobs: usize,

        /// Interval between runs of each job in milliseconds
        #[arg(long, env = "COHORT_JOB_INTERVAL_MS", default_value = "5000")]
        job_interval_ms: u64,

        /// How long each run takes in milliseconds
        #[arg(long, env = "COHORT_JOB_DURATION_MS", default_value = "500")]
        job_duration_ms: u64,

        /// Per-job timeout in milliseconds
        #[arg(long, env = "COHORT_JOB_TIMEOUT_MS")]
        job_timeout_ms: Option<u64>,

        /// Fail every n-th run (0 never fails)
        #[arg(long, env = "COHORT_FAIL_EVERY", default_value = "0")]
        fail_every: u64,

        /// Stop after this many seconds; runs until Ctrl-C if omitted
        #[arg(long, env = "COHORT_RUN_FOR")]
        run_for: Option<u64>,

        /// Dispose one node mid-run without deregistering it
        #[arg(long, env = "COHORT_CRASH_NODE", value_parser = parse_bool_env, default_value = "false")]
        crash_node: bool,
    },

    /// Print the effective node configuration as JSON
    Config {
        #[command(flatten)]
        node: NodeArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cohort=info,cohort_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            node,
            nodes,
            jobs,
            job_interval_ms,
            job_duration_ms,
            job_timeout_ms,
            fail_every,
            run_for,
            crash_node,
        } => {
            let config = node.load()?;
            let options = cluster::ClusterOptions {
                nodes,
                jobs,
                job_interval: Duration::from_millis(job_interval_ms),
                job_duration: Duration::from_millis(job_duration_ms),
                job_timeout: job_timeout_ms.map(Duration::from_millis),
                fail_every,
                run_for: run_for.map(Duration::from_secs),
                crash_node,
            };

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("received shutdown signal");
                signal.cancel();
            });

            let summary = cluster::run(options, config, shutdown).await?;
            println!("nodes:       {}", summary.nodes);
            println!("completions: {}", summary.completions);
            println!("registered:  {}", summary.registered);
            for (result, count) in &summary.results {
                println!("  {result}: {count}");
            }
            Ok(())
        }

        Commands::Config { node } => {
            let config = node.load()?;
            let json = serde_json::to_string_pretty(&config).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
    }
}
