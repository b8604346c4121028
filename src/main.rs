use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mirsd::config::AppConfig;
use mirsd::context::AppContext;
use mirsd::core::{
    DaemonStatus, HealthReport, MirrorEngine, MirrorSummary, MirrorTarget, Setting, SyncActivity,
    SyncJob,
};
use mirsd::rpc::{RpcClient, RpcServer};
use mirsd::{db, logging};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mirsd")]
#[command(about = "Mirror Sync Daemon: keeps rsync mirrors of upstream trees fresh", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default /etc/mirsd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line values layered over the config file and environment.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon
    Daemon,
    /// Show daemon status
    Status,
    /// List mirror targets
    Targets,
    /// Show one mirror target
    Target { name: String },
    /// Start a sync of one target now
    Trigger {
        name: String,
        /// Recorded as the trigger origin (defaults to $USER)
        #[arg(long)]
        actor: Option<String>,
    },
    /// Show recent jobs for a target
    Jobs {
        target: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show one job including its captured output
    Job { id: String },
    /// Show settings, or one setting
    Settings { key: Option<String> },
    /// Change a setting
    Set { key: String, value: String },
    /// Enable a target
    Enable { name: String },
    /// Disable a target
    Disable { name: String },
    /// Change a target's upstream address
    SetUpstream { name: String, url: String },
    /// Delete finished jobs outside a retention policy
    Prune {
        /// Keep this many finished jobs per target
        #[arg(long)]
        keep: Option<u32>,
        /// Delete finished jobs older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Show the health rollup of enabled targets
    Health,
    /// Show target counts and total mirrored size
    Summary,
    /// Show job counts and transfer volume over recent days
    Activity {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;

    match cli.command {
        Commands::Daemon => {
            logging::init(logging::LogConfig::from(&config));
            run_daemon(config).await.context("Daemon failed")
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        command => run_client(config.rpc_bind, command).await,
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let db_conn = db::init(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let ctx = AppContext::new(config, db_conn);
    let engine = MirrorEngine::new(ctx.clone());

    let report = engine
        .bootstrap()
        .await
        .context("Failed to prepare sync engine")?;
    info!(?report, simulation = ctx.config.simulation, "Sync engine ready");

    let server = Arc::new(
        RpcServer::bind(engine.clone(), ctx.config.rpc_bind)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", ctx.config.rpc_bind))?,
    );
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };
    let scheduler = engine.spawn_scheduler();

    wait_for_signal().await?;
    info!("Shutdown requested");

    server.shutdown();
    engine.shutdown().await;
    if let Err(e) = scheduler.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }
    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "RPC server stopped with an error"),
        Err(e) => warn!(error = %e, "RPC server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn run_client(addr: SocketAddr, command: Commands) -> Result<()> {
    let client = RpcClient::new(addr);

    match command {
        Commands::Status => {
            let status: DaemonStatus = client.call_no_params("daemon.status").await?;
            println!("mirsd {} (up {}s)", status.version, status.uptime_secs);
            println!("targets:      {}", status.targets);
            println!("running jobs: {}", status.running_jobs);
            if !status.syncing.is_empty() {
                println!("syncing:      {}", status.syncing.join(", "));
            }
            if status.simulation {
                println!("simulation mode");
            }
            if status.shutting_down {
                println!("shutting down");
            }
        }
        Commands::Targets => {
            let targets: Vec<MirrorTarget> = client.call_no_params("targets.list").await?;
            for target in &targets {
                print_target_line(target);
            }
        }
        Commands::Target { name } => {
            let target: MirrorTarget = client.call("targets.get", Some(json!({ "name": name }))).await?;
            print_json(&target)?;
        }
        Commands::Trigger { name, actor } => {
            let actor = actor
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "cli".to_string());
            let job: SyncJob = client
                .call("sync.trigger", Some(json!({ "name": name, "actor": actor })))
                .await?;
            println!("started job {} for {}", job.id, job.target);
        }
        Commands::Jobs { target, limit } => {
            let jobs: Vec<SyncJob> = client
                .call("jobs.list", Some(json!({ "target": target, "limit": limit })))
                .await?;
            for job in &jobs {
                print_job_line(job);
            }
        }
        Commands::Job { id } => {
            let mut job: SyncJob = client.call("jobs.get", Some(json!({ "id": id }))).await?;
            let output = job.output.take();
            print_json(&job)?;
            if let Some(output) = output {
                println!("--- output ---");
                print!("{}", output);
            }
        }
        Commands::Settings { key } => match key {
            Some(key) => {
                let setting: Setting = client.call("settings.get", Some(json!({ "key": key }))).await?;
                println!("{} = {}", setting.key, setting.value);
            }
            None => {
                let settings: Vec<Setting> = client.call_no_params("settings.get").await?;
                for setting in &settings {
                    println!("{:<22} {:<12} {}", setting.key, setting.value, setting.description);
                }
            }
        },
        Commands::Set { key, value } => {
            let mut params = serde_json::Map::new();
            params.insert(key.clone(), Value::String(value));
            let settings: Vec<Setting> = client.call("settings.update", Some(Value::Object(params))).await?;
            if let Some(setting) = settings.iter().find(|s| s.key == key) {
                println!("{} = {}", setting.key, setting.value);
            }
        }
        Commands::Enable { name } => update_target(&client, json!({ "name": name, "enabled": true })).await?,
        Commands::Disable { name } => update_target(&client, json!({ "name": name, "enabled": false })).await?,
        Commands::SetUpstream { name, url } => {
            update_target(&client, json!({ "name": name, "upstream_url": url })).await?
        }
        Commands::Prune { keep, older_than_days } => {
            let result: Value = client
                .call(
                    "jobs.prune",
                    Some(json!({ "keep_per_target": keep, "older_than_days": older_than_days })),
                )
                .await?;
            println!("removed {} jobs", result["removed"]);
        }
        Commands::Health => {
            let health: HealthReport = client.call_no_params("stats.health").await?;
            println!("{}", health.status);
            for target in &health.targets {
                println!("  {:<10} {}", target.name, target.status.to_string());
            }
        }
        Commands::Summary => {
            let summary: MirrorSummary = client.call_no_params("stats.summary").await?;
            println!("targets: {} ({} enabled)", summary.total_targets, summary.enabled_targets);
            println!("size:    {} bytes", summary.total_size_bytes);
            println!("files:   {}", summary.total_files);
        }
        Commands::Activity { days } => {
            let activity: SyncActivity = client
                .call("stats.activity", Some(json!({ "days": days })))
                .await?;
            let totals = &activity.totals;
            println!("last {} days: {} jobs", activity.days, totals.total_jobs);
            for (status, count) in &totals.by_status {
                println!("  {:<10} {}", status, count);
            }
            println!(
                "transferred {} bytes in {} files",
                totals.bytes_transferred, totals.files_transferred
            );
            for job in &activity.recent {
                print_job_line(job);
            }
        }
        Commands::Daemon | Commands::Config => bail!("not a client command"),
    }

    Ok(())
}

async fn update_target(client: &RpcClient, params: Value) -> Result<()> {
    let target: MirrorTarget = client.call("targets.update", Some(params)).await?;
    print_target_line(&target);
    Ok(())
}

fn print_target_line(target: &MirrorTarget) {
    let last = target
        .last_sync_completed
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{:<10} {:<9} {:<9} last ok {:<17} {}",
        target.name,
        target.status.to_string(),
        if target.enabled { "enabled" } else { "disabled" },
        last,
        target.upstream_url
    );
}

fn print_job_line(job: &SyncJob) {
    let detail = job
        .failure_kind
        .map(|k| k.as_str().to_string())
        .or_else(|| job.bytes_transferred.map(|b| format!("{} bytes", b)))
        .unwrap_or_default();
    println!(
        "{}  {}  {:<9} {:<16} {}",
        job.id,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        job.status.to_string(),
        job.origin.to_string(),
        detail
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
