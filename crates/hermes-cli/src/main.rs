use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hermes_client::ReqwestTransport;
use hermes_core::checkpoint::{Checkpointer, ResumeUpdate};
use hermes_core::AppError;
use hermes_core::config::{MiddlewareConfig, Preset};
use hermes_core::failed_queue::{FailedTask, FailedTaskQueue};
use hermes_core::middleware::RequestMiddleware;
use hermes_core::models::{Method, OutboundRequest};
use hermes_core::resume::ResumeCoordinator;
use hermes_core::runs::{RunStatus, RunTracker};
use hermes_core::store::FileStore;
use hermes_core::traits::{CheckpointStore, FailedTaskStore, NullLedger, RunStore};
use hermes_core::worker::{BatchItem, BatchWorker, TracingBatchReporter, request_for};
use hermes_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "hermes", version, about = "Resilient request middleware with checkpoint/resume")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory of the JSON-file state store
    #[arg(long, global = true, env = "HERMES_STATE_DIR", default_value = "data/state")]
    state_dir: PathBuf,

    /// Keep state in PostgreSQL (requires DATABASE_URL) instead of files
    #[arg(long, global = true, default_value_t = false)]
    database: bool,

    /// JSON file with middleware settings (HERMES_* variables are ignored when set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Starting point for settings: conservative, balanced or aggressive
    #[arg(long, global = true, env = "HERMES_PRESET")]
    preset: Option<Preset>,

    /// Per-attempt HTTP timeout in seconds
    #[arg(long, global = true, env = "HERMES_REQUEST_TIMEOUT", default_value_t = 30)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request through the middleware and print the response body
    Fetch {
        /// Target URL
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: Method,

        /// JSON payload
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Give up after this many seconds, retries included
        #[arg(long)]
        deadline: Option<f64>,

        /// Print middleware statistics to stderr afterwards
        #[arg(long, default_value_t = false)]
        stats: bool,
    },

    /// Fetch a list of URLs, queueing retry-later failures
    Batch {
        /// Task type the run, checkpoint and failed tasks are filed under
        #[arg(short, long)]
        task_type: String,

        /// File with one URL per line ('#' starts a comment)
        #[arg(short, long)]
        input: PathBuf,

        /// Concurrent items (still capped by max_concurrent)
        #[arg(long, default_value_t = 5)]
        max_workers: usize,

        /// Out-of-band retries for each queued failure
        #[arg(long, default_value_t = 3)]
        max_task_retries: u32,
    },

    /// Show a task type's resume point, or move it
    Checkpoint {
        /// Task type
        task_type: String,

        /// Record this page as the last completed one
        #[arg(long)]
        set_page: Option<u64>,

        /// Cursor to store alongside --set-page
        #[arg(long, requires = "set_page")]
        cursor: Option<String>,
    },

    /// Reconcile state after a crash and print the integrity report
    Recover {
        /// Task types to check
        #[arg(required = true)]
        task_types: Vec<String>,

        /// Flag resume points older than this many hours
        #[arg(long)]
        stale_after_hours: Option<u64>,
    },

    /// List failed tasks that ran out of retries
    DeadLetters {
        /// Only this task type
        #[arg(short, long)]
        task_type: Option<String>,
    },

    /// Retry queued failed tasks until Ctrl-C
    Drain {
        /// Task types to retry
        #[arg(required = true)]
        task_types: Vec<String>,
    },
}

/// The three durable stores a command may need.
struct Stores<C, F, R> {
    checkpoints: C,
    failed: F,
    runs: R,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hermes=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.global)?;

    if cli.global.database {
        let db = connect_db().await?;
        let stores = Stores {
            checkpoints: db.checkpoint_repo(),
            failed: db.failed_task_repo(),
            runs: db.run_repo(),
        };
        dispatch(cli.command, &cli.global, &config, stores).await
    } else {
        let store = FileStore::open(&cli.global.state_dir)
            .await
            .with_context(|| format!("Failed to open state dir {}", cli.global.state_dir.display()))?;
        let stores = Stores {
            checkpoints: store.clone(),
            failed: store.clone(),
            runs: store,
        };
        dispatch(cli.command, &cli.global, &config, stores).await
    }
}

async fn dispatch<C, F, R>(
    command: Commands,
    global: &GlobalArgs,
    config: &MiddlewareConfig,
    stores: Stores<C, F, R>,
) -> Result<()>
where
    C: CheckpointStore,
    F: FailedTaskStore,
    R: RunStore,
{
    match command {
        Commands::Fetch {
            url,
            method,
            data,
            headers,
            deadline,
            stats,
        } => {
            let middleware = build_middleware(global, config)?;
            let mut request = OutboundRequest::new(method, url);
            if let Some(data) = data {
                request = request.with_payload(
                    serde_json::from_str(&data).context("Invalid JSON in --data")?,
                );
            }
            request = request.with_headers(headers.into_iter().collect::<BTreeMap<_, _>>());
            if let Some(secs) = deadline {
                request = request.with_deadline(
                    Duration::try_from_secs_f64(secs).context("Invalid --deadline")?,
                );
            }
            cmd_fetch(&middleware, &request, stats).await
        }
        Commands::Batch {
            task_type,
            input,
            max_workers,
            max_task_retries,
        } => {
            let middleware = build_middleware(global, config)?;
            let worker = BatchWorker::new(
                middleware,
                FailedTaskQueue::new(stores.failed.clone(), config.queue_config()),
                &task_type,
            )
            .with_max_workers(max_workers)
            .with_max_task_retries(max_task_retries);
            cmd_batch(&worker, &stores, &task_type, &input).await
        }
        Commands::Checkpoint {
            task_type,
            set_page,
            cursor,
        } => cmd_checkpoint(stores.checkpoints, &task_type, set_page, cursor).await,
        Commands::Recover {
            task_types,
            stale_after_hours,
        } => {
            let mut coordinator =
                ResumeCoordinator::new(stores.checkpoints, stores.failed, stores.runs, NullLedger);
            if let Some(hours) = stale_after_hours {
                coordinator = coordinator.with_stale_after(Duration::from_secs(hours * 3600));
            }
            let task_types: Vec<&str> = task_types.iter().map(String::as_str).collect();
            let report = coordinator.recover(&task_types).await?;
            if !report.is_clean() {
                tracing::warn!(findings = report.findings.len(), "Integrity check found problems");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::DeadLetters { task_type } => {
            let mut dead = stores.failed.list_dead_letters().await?;
            dead.retain(|t| task_type.as_deref().is_none_or(|tt| t.task_type == tt));
            println!("{}", serde_json::to_string_pretty(&dead)?);
            Ok(())
        }
        Commands::Drain { task_types } => {
            let middleware = build_middleware(global, config)?;
            let queue = FailedTaskQueue::new(stores.failed, config.queue_config());
            cmd_drain(&queue, &middleware, &task_types).await
        }
    }
}

/// Settings from `--config`, or from `HERMES_*` variables on top of the preset.
fn load_config(global: &GlobalArgs) -> Result<MiddlewareConfig> {
    let config = match &global.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: MiddlewareConfig =
                serde_json::from_str(&raw).context("Invalid JSON in config file")?;
            config.validate()?;
            config
        }
        None => MiddlewareConfig::from_lookup(|name| match (name, global.preset) {
            ("HERMES_PRESET", Some(preset)) => Some(preset.to_string()),
            _ => std::env::var(name).ok(),
        })?,
    };
    Ok(config)
}

fn build_middleware(
    global: &GlobalArgs,
    config: &MiddlewareConfig,
) -> Result<RequestMiddleware<ReqwestTransport>> {
    let transport = ReqwestTransport::with_timeout(Duration::from_secs(global.timeout))
        .context("Failed to create HTTP client")?;
    Ok(RequestMiddleware::from_config(transport, config)?)
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            token.cancel();
        }
    });
}

/// "Name: value" into a header pair.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// URLs from a list file: one per line, blank lines and '#' comments skipped.
fn read_targets(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

async fn cmd_fetch(
    middleware: &RequestMiddleware<ReqwestTransport>,
    request: &OutboundRequest,
    stats: bool,
) -> Result<()> {
    tracing::info!(method = %request.method, url = %request.url, "Fetching");

    let result = middleware.execute(request).await;
    if stats {
        eprintln!("{}", serde_json::to_string_pretty(&middleware.stats())?);
    }
    let executed = result?;

    tracing::info!(
        status = executed.response.status,
        attempts = executed.attempts,
        bytes = executed.response.body.len(),
        "Fetch complete"
    );
    println!("{}", executed.response.body);
    Ok(())
}

async fn cmd_batch<C, F, R>(
    worker: &BatchWorker<ReqwestTransport, F>,
    stores: &Stores<C, F, R>,
    task_type: &str,
    input: &Path,
) -> Result<()>
where
    C: CheckpointStore,
    F: FailedTaskStore,
    R: RunStore,
{
    let contents = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read URL list: {}", input.display()))?;
    let items: Vec<BatchItem> = read_targets(&contents)
        .into_iter()
        .map(BatchItem::get)
        .collect();

    let tracker = RunTracker::new(stores.runs.clone());
    let checkpointer = Checkpointer::new(stores.checkpoints.clone());
    let previous = checkpointer
        .get(task_type)
        .await?
        .map_or(0, |point| point.total_processed);

    let mut run = tracker.start(task_type).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = worker
        .run(items, |_, _| async { Ok(()) }, cancel, &TracingBatchReporter)
        .await;

    run.record_page(summary.succeeded as u64);
    for _ in 0..(summary.queued + summary.failed.len()) {
        run.record_failure();
    }
    let status = if summary.failed.is_empty() && summary.skipped == 0 {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };
    let error = (!summary.failed.is_empty())
        .then(|| format!("{} items failed permanently", summary.failed.len()));
    tracker.finish(run, status, error).await?;

    checkpointer
        .create_or_update(
            task_type,
            ResumeUpdate::default()
                .with_total_processed(previous + summary.succeeded as u64)
                .with_metadata("last_input", serde_json::json!(input.display().to_string())),
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_checkpoint<C: CheckpointStore>(
    store: C,
    task_type: &str,
    set_page: Option<u64>,
    cursor: Option<String>,
) -> Result<()> {
    let checkpointer = Checkpointer::new(store);

    let point = match set_page {
        Some(page) => {
            let mut update = ResumeUpdate::page(page);
            if let Some(cursor) = cursor {
                update = update.with_cursor(cursor);
            }
            Some(checkpointer.create_or_update(task_type, update).await?)
        }
        None => checkpointer.get(task_type).await?,
    };

    match point {
        Some(point) => println!("{}", serde_json::to_string_pretty(&point)?),
        None => println!("No checkpoint for task type {task_type}"),
    }
    Ok(())
}

async fn cmd_drain<F: FailedTaskStore>(
    queue: &FailedTaskQueue<F>,
    middleware: &RequestMiddleware<ReqwestTransport>,
    task_types: &[String],
) -> Result<()> {
    for task_type in task_types {
        let middleware = middleware.clone();
        queue.register_handler(task_type.as_str(), move |task: FailedTask| {
            let middleware = middleware.clone();
            async move {
                middleware.execute(&request_for(&task)).await?;
                Ok::<(), AppError>(())
            }
        });
    }

    let pending = queue.pending().await?.len();
    tracing::info!(pending, task_types = ?task_types, "Draining failed tasks (Ctrl-C to stop)");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    queue.run(cancel).await;

    let remaining = queue.pending().await?.len();
    let dead = queue.dead_letters().await?.len();
    tracing::info!(remaining, dead_letters = dead, "Drain stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Api-Key: secret").unwrap(),
            ("X-Api-Key".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_header("Accept:application/json").unwrap().1,
            "application/json"
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_read_targets() {
        let targets = read_targets("https://a.example/1\n\n# skipped\n  https://a.example/2  \n");
        assert_eq!(targets, vec!["https://a.example/1", "https://a.example/2"]);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "hermes",
            "--preset",
            "conservative",
            "fetch",
            "https://example.com",
            "-X",
            "post",
            "-H",
            "X-Trace: 1",
            "--deadline",
            "2.5",
        ])
        .unwrap();
        assert_eq!(cli.global.preset, Some(Preset::Conservative));
        match cli.command {
            Commands::Fetch {
                method,
                headers,
                deadline,
                ..
            } => {
                assert_eq!(method, Method::Post);
                assert_eq!(headers, vec![("X-Trace".to_string(), "1".to_string())]);
                assert_eq!(deadline, Some(2.5));
            }
            _ => panic!("expected fetch"),
        }

        assert!(Cli::try_parse_from(["hermes", "recover"]).is_err());
        assert!(Cli::try_parse_from(["hermes", "checkpoint", "listings", "--cursor", "c"]).is_err());
    }
}
