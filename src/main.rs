//! AgriStream - streaming weather/yield enrichment and alerting
//!
//! # Usage
//!
//! ```bash
//! # Consume channel envelopes from stdin, emit enriched records on stdout
//! producer | agristream --stdin
//!
//! # Replay a recorded JSON-lines capture into a file, 50ms between messages
//! agristream --replay capture.jsonl --speed-ms 50 --output enriched.jsonl
//!
//! # One-shot batch run without the HTTP API
//! agristream --replay capture.jsonl --no-server
//! ```
//!
//! # Environment Variables
//!
//! - `AGRISTREAM_CONFIG`: path to the TOML config (default: ./agristream.toml)
//! - `SMS_ACCOUNT_SID`, `SMS_AUTH_TOKEN`: gateway credentials (log-only when unset)
//! - `SMS_FROM_NUMBER`, `SMS_TO_NUMBER`: numbers when not set in the config
//! - `AGRISTREAM_CORS_ORIGINS`: comma-separated allowed origins for the API
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agristream::api::{create_app, ApiState};
use agristream::config::{self, StreamConfig};
use agristream::incidents::{
    run_dispatch_worker, IncidentManager, IncidentStore, InMemoryIncidentStore, LogNotifier,
    NotificationDispatcher, Notifier, Recipients, SledIncidentStore, SmsGateway,
};
use agristream::pipeline::source::{MessageSource, ReplaySource, StdinSource};
use agristream::pipeline::{AppState, ControlCommand, ProcessingLoop, StreamCoordinator};
use agristream::publisher::{JsonLinesSink, RecordPublisher, RecordSink};

/// Pending API acknowledgments held before callers see 503s.
const CONTROL_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "agristream")]
#[command(about = "Streaming weather/yield enrichment with drought, flood and stream-health alerting")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config (overrides AGRISTREAM_CONFIG and ./agristream.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read channel envelopes from stdin (default when no --replay is given)
    #[arg(long, conflicts_with = "replay")]
    stdin: bool,

    /// Replay a JSON-lines capture of channel envelopes
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Delay between replayed messages in milliseconds (0 = as fast as possible)
    #[arg(long, default_value = "0")]
    speed_ms: u64,

    /// Append enriched records to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Override the HTTP server address (config: server.addr)
    #[arg(short, long)]
    addr: Option<String>,

    /// Do not start the HTTP API; exit once the input is exhausted
    #[arg(long)]
    no_server: bool,

    /// Shut down once the input is exhausted, even with the API running
    #[arg(long)]
    exit_on_eof: bool,

    /// Keep incidents in memory only (no sled database)
    #[arg(long)]
    ephemeral: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    StreamProcessor,
    NotificationWorker,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::StreamProcessor => write!(f, "StreamProcessor"),
            TaskName::NotificationWorker => write!(f, "NotificationWorker"),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logs go to stderr; stdout is reserved for the record sink.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

// ============================================================================
// Component Initialization
// ============================================================================

/// Incident store plus the sled handle (when durable) for the final flush.
fn open_incident_store(
    config: &StreamConfig,
    ephemeral: bool,
) -> Result<(Arc<dyn IncidentStore>, Option<Arc<SledIncidentStore>>)> {
    if ephemeral {
        info!("💾 Incidents: in-memory (--ephemeral)");
        let store: Arc<dyn IncidentStore> = Arc::new(InMemoryIncidentStore::new());
        return Ok((store, None));
    }
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.storage.data_dir.display())
    })?;
    let path = config.storage.incident_db_path();
    let store = Arc::new(
        SledIncidentStore::open(&path)
            .with_context(|| format!("Failed to open incident store at {}", path.display()))?,
    );
    info!("💾 Incidents: {}", path.display());
    let shared: Arc<dyn IncidentStore> = store.clone();
    Ok((shared, Some(store)))
}

/// SMS gateway when credentials and numbers are present, log output otherwise.
fn select_notifier(config: &StreamConfig, recipients: &Recipients) -> Arc<dyn Notifier> {
    if !config.notifications.enabled {
        info!("📵 Notifications: disabled");
        return Arc::new(LogNotifier);
    }
    match SmsGateway::from_env(&config.notifications) {
        Some(Ok(gateway)) if recipients.is_complete() => {
            info!("📱 Notifications: SMS via {}", config.notifications.gateway_url);
            Arc::new(gateway)
        }
        Some(Ok(_)) => {
            warn!("SMS credentials set but from/to numbers missing; notifications will be logged only");
            Arc::new(LogNotifier)
        }
        Some(Err(e)) => {
            warn!(error = %e, "Failed to build SMS gateway; notifications will be logged only");
            Arc::new(LogNotifier)
        }
        None => {
            info!("📝 Notifications: log only (SMS credentials not set)");
            Arc::new(LogNotifier)
        }
    }
}

async fn open_sink(output: Option<&PathBuf>) -> Result<Box<dyn RecordSink>> {
    match output {
        Some(path) => {
            info!("📤 Output: {}", path.display());
            let sink = JsonLinesSink::append_file(path)
                .await
                .with_context(|| format!("Failed to open output file {}", path.display()))?;
            Ok(Box::new(sink))
        }
        None => {
            info!("📤 Output: stdout");
            Ok(Box::new(JsonLinesSink::stdout()))
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Monitor tasks; a failing or panicking task cancels the rest.
async fn run_supervisor(task_set: &mut JoinSet<Result<TaskName>>, cancel_token: CancellationToken) -> Result<()> {
    info!("[Supervisor] All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("[Supervisor] Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("[Supervisor] Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("[Supervisor] Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("[Supervisor] Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("[Supervisor] All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let in-flight work finish: the processor flushes output, the worker
    // sends what is already queued.
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("[Supervisor] Task {} stopped", task_name),
            Ok(Err(e)) => warn!("[Supervisor] Task ended with error during shutdown: {}", e),
            Err(e) => warn!("[Supervisor] Task panicked during shutdown: {}", e),
        }
    }

    Ok(())
}

// ============================================================================
// Pipeline Runner
// ============================================================================

async fn run_pipeline<S: MessageSource>(
    mut source: S,
    config: &StreamConfig,
    args: &CliArgs,
    cancel_token: CancellationToken,
) -> Result<()> {
    let (store, sled_store) = open_incident_store(config, args.ephemeral)?;

    let (dispatcher, notification_rx) = NotificationDispatcher::channel(config.notifications.queue_capacity);
    let recipients = Recipients::resolve(&config.notifications);
    let notifier = select_notifier(config, &recipients);

    let mut incidents = IncidentManager::new(Arc::clone(&store), dispatcher, config);
    match incidents.restore_open() {
        Ok(0) => {}
        Ok(n) => info!("♻️  Restored {} open incident(s)", n),
        Err(e) => warn!(error = %e, "Failed to restore open incidents"),
    }

    let sink = open_sink(args.output.as_ref()).await?;
    let publisher = RecordPublisher::new(&config.channels.output_topic, sink);
    let coordinator = StreamCoordinator::new(config, publisher, incidents);

    let app_state = Arc::new(RwLock::new(AppState::default()));
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(CONTROL_CHANNEL_CAPACITY);

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: HTTP Server
    if args.no_server {
        info!("🌐 HTTP API: disabled (--no-server)");
    } else {
        let addr = config.server.addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
        info!("🌐 HTTP API listening on http://{}", addr);
        let app = create_app(ApiState {
            app_state: Arc::clone(&app_state),
            store: Arc::clone(&store),
            control_tx,
        });
        spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    }

    // Task 2: Notification dispatch worker
    let worker_cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_dispatch_worker(notification_rx, notifier, recipients, worker_cancel).await?;
        Ok(TaskName::NotificationWorker)
    });

    // Task 3: Stream processor
    let stop_after_input = args.no_server || args.exit_on_eof;
    let proc_cancel = cancel_token.clone();
    let heartbeat_interval = config.heartbeats.check_interval();
    task_set.spawn(async move {
        info!("[StreamProcessor] Task starting");
        let processing_loop = ProcessingLoop::new(coordinator, app_state, proc_cancel.clone(), heartbeat_interval)
            .with_control(control_rx);
        let _stats = processing_loop.run(&mut source).await;
        if stop_after_input {
            proc_cancel.cancel();
        }
        Ok(TaskName::StreamProcessor)
    });

    let result = run_supervisor(&mut task_set, cancel_token).await;

    if let Some(sled_store) = sled_store {
        if let Err(e) = sled_store.flush() {
            warn!(error = %e, "Failed to flush incident store");
        }
    }
    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Cancel `token` once `signal` fires.
///
/// A failed handler install leaves the token alone; the pipeline then runs
/// until its source ends or the supervisor stops it.
async fn cancel_on_signal<F>(signal: F, token: CancellationToken)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("🛑 Received Ctrl+C, initiating shutdown...");
            token.cancel();
        }
        Err(e) => {
            warn!(error = %e, "Failed to install Ctrl+C handler, signal shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let mut stream_config = StreamConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(ref addr) = args.addr {
        stream_config.server.addr.clone_from(addr);
    }

    if args.print_config {
        println!("{}", stream_config.to_toml()?);
        return Ok(());
    }

    config::init(stream_config.clone());

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  AgriStream v{}", env!("CARGO_PKG_VERSION"));
    info!("  Weather/yield enrichment and stream alerting");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "   Channels: weather='{}' yield='{}' metrics='{}' -> '{}'",
        stream_config.channels.weather_topic,
        stream_config.channels.yield_topic,
        stream_config.channels.metrics_topic,
        stream_config.channels.output_topic
    );
    info!(
        "   Drought: {} days < {} | Flood: {}-day avg > {}",
        stream_config.drought.drought_days,
        stream_config.drought.precip_threshold,
        stream_config.flood.window_days,
        stream_config.flood.flood_threshold
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown_token));

    if let Some(ref path) = args.replay {
        info!("📥 Input: replay {} ({}ms between messages)", path.display(), args.speed_ms);
        let source = ReplaySource::open(path, args.speed_ms).await?;
        run_pipeline(source, &stream_config, &args, cancel_token).await?;
    } else {
        info!("📥 Input: stdin (JSON-lines channel envelopes)");
        run_pipeline(StdinSource::new(), &stream_config, &args, cancel_token).await?;
    }

    info!("✓ AgriStream shutdown complete");
    Ok(())
}
