//! CLI command definitions for lockqueue.
//!
//! Every command builds a [`JobQueue`] over Redis, or over an in-process
//! store with `--memory`, from the environment configuration plus flag
//! overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::resolver::ProcessResolver;
use crate::scheduler::{
    ConsoleOutput, Job, JobQueue, QueueStats, ResolveOptions, Verbosity, WaitEstimate, Worker,
    WorkerPool,
};
use crate::store::{JobStore, MemoryStore, RedisStore};

/// Queue-backed dependency resolution service.
#[derive(Parser)]
#[command(name = "lockqueue")]
#[command(about = "Resolve dependency manifests into lock files through a Redis job queue")]
#[command(version)]
#[command(
    long_about = "lockqueue stores dependency resolution jobs in Redis and runs workers that claim them,\ninvoke the resolver and persist the lock file and output on the job record.\n\nExample usage:\n  lockqueue submit composer.json --no-dev\n  lockqueue worker --workers 4 --keep-running\n  lockqueue show <job-id>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Override the Redis URL (default: LOCKQUEUE_REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Override the queue key (default: LOCKQUEUE_QUEUE_KEY).
    #[arg(long, global = true)]
    pub queue_key: Option<String>,

    /// Use an in-process store instead of Redis. State is lost on exit.
    #[arg(long, global = true)]
    pub memory: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run queue workers.
    Worker(WorkerArgs),

    /// Resolve one queued job in the foreground, printing its output.
    #[command(name = "resolve-job")]
    ResolveJob(ResolveJobArgs),

    /// Queue a manifest for resolution.
    Submit(SubmitArgs),

    /// Print a job record as JSON.
    Show(JobIdArgs),

    /// Delete a job record.
    Delete(JobIdArgs),

    /// Print queue statistics and the current waiting-time estimate.
    Status,

    /// Print Prometheus metrics for the queue.
    Metrics,
}

/// Arguments for `lockqueue worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers in this process (default: LOCKQUEUE_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Keep polling after a job has been processed instead of exiting.
    #[arg(long)]
    pub keep_running: bool,

    /// Write Prometheus metrics to this file when the workers stop.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `lockqueue resolve-job`.
#[derive(Parser, Debug)]
pub struct ResolveJobArgs {
    /// Id of the job to resolve.
    pub job_id: String,

    /// Persist the finished job record.
    #[arg(long)]
    pub save: bool,
}

/// Arguments for `lockqueue submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Path to the manifest (composer.json).
    pub manifest: PathBuf,

    /// Restrict the update to these packages.
    #[arg(short = 'p', long = "package")]
    pub packages: Vec<String>,

    #[arg(long)]
    pub prefer_source: bool,

    #[arg(long)]
    pub prefer_dist: bool,

    /// Skip dev requirements.
    #[arg(long)]
    pub no_dev: bool,

    #[arg(long)]
    pub no_suggest: bool,

    #[arg(long)]
    pub prefer_stable: bool,

    #[arg(long)]
    pub prefer_lowest: bool,

    /// Keep ANSI decoration in the captured output.
    #[arg(long)]
    pub ansi: bool,

    /// Prefix output lines with elapsed time.
    #[arg(long)]
    pub profile: bool,

    /// Increase output verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Capture no resolver output.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl SubmitArgs {
    /// Options stored on the submitted job.
    pub fn resolve_options(&self) -> ResolveOptions {
        let verbosity = if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from_occurrences(self.verbose)
        };

        ResolveOptions {
            packages: self.packages.clone(),
            prefer_source: self.prefer_source,
            prefer_dist: self.prefer_dist,
            no_dev: self.no_dev,
            no_suggest: self.no_suggest,
            prefer_stable: self.prefer_stable,
            prefer_lowest: self.prefer_lowest,
            ansi: self.ansi.then_some(true),
            profile: self.profile,
            verbosity,
        }
    }
}

/// Arguments for commands addressing a single job.
#[derive(Parser, Debug)]
pub struct JobIdArgs {
    /// Job id.
    pub job_id: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let queue = open_queue(&config, cli.memory).await?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(args, config, queue).await,
        Commands::ResolveJob(args) => run_resolve_job_command(args, &config, queue).await,
        Commands::Submit(args) => run_submit_command(args, &config, &queue).await,
        Commands::Show(args) => run_show_command(args, &queue).await,
        Commands::Delete(args) => run_delete_command(args, &queue).await,
        Commands::Status => run_status_command(&config, &queue).await,
        Commands::Metrics => run_metrics_command(&queue).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;

    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.as_str());
    }
    if let Some(key) = &cli.queue_key {
        config = config.with_queue_key(key.as_str());
    }

    config.validate()?;
    Ok(config)
}

async fn open_queue(config: &Config, memory: bool) -> anyhow::Result<Arc<JobQueue>> {
    let store: Arc<dyn JobStore> = if memory {
        warn!("Using in-process store; queued jobs are lost when this process exits");
        Arc::new(MemoryStore::new())
    } else {
        let store = RedisStore::connect(&config.redis_url)
            .await
            .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
        Arc::new(store)
    };

    Ok(Arc::new(JobQueue::new(
        store,
        &config.queue_key,
        config.jobs_ttl,
    )))
}

fn build_resolver(config: &Config) -> Arc<ProcessResolver> {
    Arc::new(ProcessResolver::new(
        &config.resolver_command,
        config.jobs_dir.clone(),
    ))
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(
    args: WorkerArgs,
    mut config: Config,
    queue: Arc<JobQueue>,
) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if args.keep_running {
        config = config.with_terminate_after_run(false);
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    fs::create_dir_all(&config.jobs_dir).with_context(|| {
        format!(
            "Failed to create jobs directory {}",
            config.jobs_dir.display()
        )
    })?;

    let mut pool = WorkerPool::new(config.pool_config(), queue, build_resolver(&config));
    let trigger = pool.shutdown_trigger();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping workers after their current run");
                let _ = trigger.send(());
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt signal"),
        }
    });

    pool.start()?;
    let processed = pool.join().await?;
    let stats = pool.stats();

    info!(
        processed,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        "Workers stopped"
    );

    if let Some(path) = args.metrics_file {
        write_metrics_file(&path)?;
    }

    Ok(())
}

fn write_metrics_file(path: &Path) -> anyhow::Result<()> {
    fs::write(path, export_metrics())
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

// ============================================================================
// Manual resolution
// ============================================================================

async fn run_resolve_job_command(
    args: ResolveJobArgs,
    config: &Config,
    queue: Arc<JobQueue>,
) -> anyhow::Result<()> {
    let job = queue
        .get_job(&args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job not found: {}", args.job_id))?;

    fs::create_dir_all(&config.jobs_dir)?;

    let mut output = ConsoleOutput::new(job.options().verbosity);
    let worker = Worker::new(
        Arc::clone(&queue),
        build_resolver(config),
        config.worker_config(),
    )
    .with_id("manual");

    let result = worker.resolve(job, &mut output).await?;

    if args.save {
        queue.update_job(result.job()).await?;
        info!(job_id = %result.job().id(), "Saved job record");
    }

    if let Some(handle) = result.handle() {
        info!(
            command = %handle.command_line,
            duration_secs = handle.duration.as_secs_f64(),
            "Resolver finished"
        );
    }

    println!(
        "Job {} finished with status {} (exit code {})",
        result.job().id(),
        result.job().status(),
        result.exit_code()
    );

    Ok(())
}

// ============================================================================
// Submission and inspection
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOutput {
    id: String,
    #[serde(flatten)]
    estimate: WaitEstimate,
}

async fn run_submit_command(
    args: SubmitArgs,
    config: &Config,
    queue: &JobQueue,
) -> anyhow::Result<()> {
    let manifest = fs::read_to_string(&args.manifest)
        .with_context(|| format!("Failed to read {}", args.manifest.display()))?;
    serde_json::from_str::<serde_json::Value>(&manifest)
        .with_context(|| format!("{} is not valid JSON", args.manifest.display()))?;

    if !config.queue_length_limit().check(queue).await? {
        anyhow::bail!(
            "Queue {} is full ({} jobs), try again later",
            queue.queue_name(),
            config.queue_length_limit().maximum()
        );
    }

    let estimate = WaitEstimate::for_queue(queue, config.average_job_time, config.workers).await?;
    let job = Job::new(Job::generate_id(), manifest).with_options(args.resolve_options());
    queue.add_job(&job).await?;
    info!(job_id = %job.id(), "Job queued");

    let output = SubmitOutput {
        id: job.id().to_string(),
        estimate,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run_show_command(args: JobIdArgs, queue: &JobQueue) -> anyhow::Result<()> {
    let job = queue
        .get_job(&args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job not found: {}", args.job_id))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_delete_command(args: JobIdArgs, queue: &JobQueue) -> anyhow::Result<()> {
    let job = queue
        .get_job(&args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job not found: {}", args.job_id))?;

    queue.delete_job(&job).await?;
    println!("Deleted job {}", job.id());
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    #[serde(flatten)]
    stats: QueueStats,
    max_queue_length: usize,
    #[serde(flatten)]
    estimate: WaitEstimate,
}

async fn run_status_command(config: &Config, queue: &JobQueue) -> anyhow::Result<()> {
    let stats = queue.stats().await?;
    let estimate = WaitEstimate::new(stats.pending_jobs, config.average_job_time, config.workers);

    let output = StatusOutput {
        stats,
        max_queue_length: config.queue_length_limit().maximum(),
        estimate,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run_metrics_command(queue: &JobQueue) -> anyhow::Result<()> {
    init_metrics()?;

    let stats = queue.stats().await?;
    let metrics = MetricsCollector::new();
    metrics.update_queue_depth(queue.queue_name(), stats.pending_jobs);
    metrics.update_queue_depth(queue.backup_name(), stats.backup_jobs);

    print!("{}", export_metrics());
    Ok(())
}
