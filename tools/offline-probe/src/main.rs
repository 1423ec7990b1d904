//! Probe for the Nimbus offline layer.
//!
//! Drives one worker against the real network with a SQLite cache store, so
//! the offline behaviour can be checked from a shell.
//!
//! ## Usage
//!
//! ```bash
//! # Pre-warm and activate the configured version
//! offline-probe --db caches.db install
//!
//! # Route one request through the worker
//! offline-probe --db caches.db fetch http://127.0.0.1:5000/ --navigate
//!
//! # List cache buckets
//! offline-probe --db caches.db buckets
//!
//! # Show a push notification
//! offline-probe push "Rain expected at 5pm"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nimbus_common::{init_logging, LogConfig, LogFormat};
use nimbus_net::Client;
use nimbus_sw::{
    CacheStorage, ExtendableEvent, FetchDecision, HttpFetcher, NotificationCenter, OfflineWorker,
    PushMessage, Registration, Request, RequestMode, SqliteCacheStorage, WindowRegistry,
    WorkerConfig,
};
use serde::Serialize;
use tracing::debug;

#[derive(Parser)]
#[command(name = "offline-probe")]
#[command(about = "Drive the Nimbus offline layer against a real network")]
struct Cli {
    /// Worker configuration (JSON). Defaults to the shipped app settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite cache store.
    #[arg(long, global = true, default_value = "nimbus-cache.db")]
    db: PathBuf,

    /// Network timeout in seconds. No timeout when unset.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the configured version
    Install,

    /// Route one request through the worker
    Fetch {
        /// Absolute URL, or a path resolved against the app origin
        url: String,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// Issue the request in no-cors mode
        #[arg(long, conflicts_with = "navigate")]
        no_cors: bool,
        /// Write the response body here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List cache buckets and their entry counts
    Buckets,

    /// Display a push notification with the given text
    Push {
        text: String,
    },
}

#[derive(Debug, Serialize)]
struct InstallSummary {
    version: String,
    stored: usize,
    deleted: Vec<String>,
    failed: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FetchSummary {
    url: String,
    decision: &'static str,
    status: Option<u16>,
    response_type: Option<&'static str>,
    from_cache: bool,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct BucketSummary {
    name: String,
    entries: usize,
    current: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = load_config(cli.config.as_deref())?;
    debug!(version = %config.version, db = %cli.db.display(), "Probe starting");

    match cli.command {
        Commands::Install => {
            let worker = build_worker(config, &cli.db, cli.timeout)?;
            let summary = install(worker).await?;
            print_json(&summary)?;
        }
        Commands::Fetch {
            ref url,
            navigate,
            no_cors,
            ref output,
        } => {
            let target = config.resolve(url).context("invalid URL")?;
            let mut request = if navigate {
                Request::navigate(target)
            } else {
                Request::get(target)
            };
            if no_cors {
                request = request.with_mode(RequestMode::NoCors);
            }

            let worker = build_worker(config, &cli.db, cli.timeout)?;
            let (summary, body) = fetch(&worker, &request).await?;
            if let (Some(path), Some(body)) = (output, body) {
                std::fs::write(path, body)
                    .with_context(|| format!("cannot write {}", path.display()))?;
            }
            print_json(&summary)?;
        }
        Commands::Buckets => {
            let store = SqliteCacheStorage::open(&cli.db)
                .with_context(|| format!("cannot open {}", cli.db.display()))?;
            let buckets = list_buckets(&store, config.version.as_str()).await?;
            print_json(&buckets)?;
        }
        Commands::Push { ref text } => {
            let notifications = Arc::new(NotificationCenter::new());
            let network = http_fetcher(&config, cli.timeout)?;
            let worker = OfflineWorker::builder(config, Arc::new(network))
                .caches(Arc::new(SqliteCacheStorage::in_memory()?))
                .notifications(notifications.clone())
                .build();

            if worker.handle_push(PushMessage::text(text.clone())).await?.is_none() {
                bail!("push produced no notification");
            }
            for (id, n) in notifications.showing().await {
                println!("[{}] {}: {}", id, n.title, n.body);
            }
        }
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let format: LogFormat = cli.log_format.parse()?;
    let config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(config.with_format(format))?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => Ok(WorkerConfig::load(path)?),
        None => {
            let config = WorkerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn http_fetcher(config: &WorkerConfig, timeout: Option<u64>) -> Result<HttpFetcher> {
    let mut builder = Client::builder();
    if let Some(secs) = timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    Ok(HttpFetcher::new(builder.build()?, config.origin.clone()))
}

fn build_worker(config: WorkerConfig, db: &Path, timeout: Option<u64>) -> Result<Arc<OfflineWorker>> {
    let store = SqliteCacheStorage::open(db).with_context(|| format!("cannot open {}", db.display()))?;
    let network = http_fetcher(&config, timeout)?;
    let worker = OfflineWorker::builder(config, Arc::new(network))
        .caches(Arc::new(store))
        .clients(Arc::new(WindowRegistry::new()))
        .build();
    Ok(Arc::new(worker))
}

async fn install(worker: Arc<OfflineWorker>) -> Result<InstallSummary> {
    let scope = worker.config().root_url()?;
    let version = worker.version().to_string();
    let (registration, _events) = Registration::new(scope);

    let outcome = registration.update(worker).await?;
    let activation = outcome.activation.unwrap_or_default();
    Ok(InstallSummary {
        version,
        stored: outcome.install.stored,
        deleted: activation.deleted,
        failed: activation.failed,
    })
}

async fn fetch(worker: &OfflineWorker, request: &Request) -> Result<(FetchSummary, Option<Vec<u8>>)> {
    let mut event = ExtendableEvent::new();
    let decision = worker.handle_fetch(request, &mut event).await;
    event.settled().await;

    let summary = match decision? {
        FetchDecision::Passthrough => (
            FetchSummary {
                url: request.url.to_string(),
                decision: "passthrough",
                status: None,
                response_type: None,
                from_cache: false,
                bytes: 0,
            },
            None,
        ),
        FetchDecision::Respond(response) => (
            FetchSummary {
                url: request.url.to_string(),
                decision: "respond",
                status: Some(response.status.as_u16()),
                response_type: Some(response.response_type.as_str()),
                from_cache: response.from_cache,
                bytes: response.body.len(),
            },
            Some(response.body.to_vec()),
        ),
    };
    Ok(summary)
}

async fn list_buckets(store: &dyn CacheStorage, current: &str) -> Result<Vec<BucketSummary>> {
    let mut buckets = Vec::new();
    for name in store.keys().await? {
        let entries = store.entry_keys(&name).await?.len();
        buckets.push(BucketSummary {
            current: name == current,
            name,
            entries,
        });
    }
    Ok(buckets)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
