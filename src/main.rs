use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobmesh::cluster::LocalCluster;
use jobmesh::config::{BusConfig, ClusterConfig, FetchConfig, MasterConfig};
use jobmesh::master::JobState;
use jobmesh::protocol::{JobId, JobResult, JobSpec, Role};
use jobmesh::runtime::{CommandFetch, RoleWork};
use jobmesh::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobmesh")]
#[command(version)]
#[command(about = "Fetch, compute and collect jobs across a master and role nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a master and role nodes, accepting jobs over HTTP
    Serve(ServeArgs),

    /// Run a single job on a throwaway cluster and print its results
    Run(RunArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Number of fetcher nodes
    #[arg(long, default_value = "1")]
    fetchers: usize,

    /// Number of worker nodes
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Number of collector nodes
    #[arg(long, default_value = "1")]
    collectors: usize,

    /// Echo fetch targets instead of running them as shell commands
    #[arg(long)]
    builtin_fetch: bool,

    /// Shell used for fetch commands
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Timeout for a single fetch command in milliseconds
    #[arg(long, default_value = "30000")]
    fetch_timeout_ms: u64,

    /// How long a job may wait for free nodes before it is reported stalled
    #[arg(long, default_value = "5000")]
    capacity_timeout_ms: u64,

    /// Master sweep interval in milliseconds
    #[arg(long, default_value = "200")]
    sweep_interval_ms: u64,

    /// Per-node inbox size
    #[arg(long, default_value = "256")]
    inbox_capacity: usize,
}

impl ClusterArgs {
    fn config(&self) -> ClusterConfig {
        ClusterConfig {
            fetchers: self.fetchers,
            workers: self.workers,
            collectors: self.collectors,
            bus: BusConfig {
                inbox_capacity: self.inbox_capacity,
                ..BusConfig::default()
            },
            master: MasterConfig {
                sweep_interval_ms: self.sweep_interval_ms,
                capacity_timeout_ms: self.capacity_timeout_ms,
                ..MasterConfig::default()
            },
            fetch: FetchConfig {
                shell: self.shell.clone(),
                timeout_ms: self.fetch_timeout_ms,
            },
            api_addr: None,
        }
    }
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    api_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Fetch commands, one per fetcher slot
    #[arg(required = true)]
    commands: Vec<String>,

    /// Workers the job asks for (defaults to the cluster's worker count)
    #[arg(long)]
    job_workers: Option<usize>,

    /// Collectors the job asks for (defaults to the cluster's collector count)
    #[arg(long)]
    job_collectors: Option<usize>,

    /// Give up on the job after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput {
    job_id: JobId,
    state: JobState,
    results: Vec<JobResult>,
    collected: Vec<Value>,
}

// =============================================================================
// Commands
// =============================================================================

async fn start_cluster(
    args: &ClusterArgs,
    config: ClusterConfig,
    shutdown: CancellationToken,
) -> LocalCluster {
    let fetch = config.fetch.clone();
    let builtin = args.builtin_fetch;

    LocalCluster::start_with(config, shutdown, move |role| match role {
        Role::Fetcher if !builtin => {
            RoleWork::Fetcher(std::sync::Arc::new(CommandFetch::new(fetch.clone())))
        }
        role => RoleWork::builtin(role),
    })
    .await
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.cluster.config().with_api(args.api_addr);
    config.validate()?;
    tracing::info!(
        api_addr = %args.api_addr,
        nodes = config.total_nodes(),
        "Starting jobmesh"
    );

    let shutdown = install_shutdown_handler();
    let cluster = start_cluster(&args.cluster, config, shutdown.clone()).await;

    shutdown.cancelled().await;
    cluster.shutdown().await;
    Ok(())
}

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.cluster.config();
    config.validate()?;
    let shutdown = install_shutdown_handler();
    let cluster = start_cluster(&args.cluster, config, shutdown).await;
    if !cluster.wait_registered(Duration::from_secs(5)).await {
        return Err("nodes did not register with the master".into());
    }

    let spec = JobSpec {
        fetchers: args.commands.len(),
        workers: args.job_workers.unwrap_or(args.cluster.workers),
        collectors: args.job_collectors.unwrap_or(args.cluster.collectors),
        payload: Value::from(args.commands.clone()),
    };
    let master = cluster.master.clone();
    let job_id = master.create_job(spec).await?;

    let snapshot = master
        .wait_for_job(job_id, Duration::from_secs(args.timeout_secs))
        .await?;
    if !snapshot.state.is_terminal() {
        master.kill_job(job_id).await?;
        cluster.shutdown().await;
        return Err(format!("job {} did not finish within {}s", job_id, args.timeout_secs).into());
    }

    let output = RunOutput {
        job_id,
        state: snapshot.state,
        results: master.worker_results(job_id).await?,
        collected: snapshot.collected,
    };
    cluster.shutdown().await;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", output.job_id);
            println!("State:  {}", output.state);
            println!();
            println!("{:<6} {:<6} RESULT", "SLOT", "NODE");
            println!("{}", "-".repeat(60));
            for result in &output.results {
                println!(
                    "{:<6} {:<6} {}",
                    result.slot,
                    result.node_id,
                    result.payload
                );
            }
            if !output.collected.is_empty() {
                println!();
                println!("Collected:");
                for aggregate in &output.collected {
                    println!("  {}", aggregate);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Run(args) => run_job(args).await,
    }
}
