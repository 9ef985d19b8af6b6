//! Atrium application binary - composition root.
//!
//! Ties together all atrium crates into a single executable:
//! 1. Load configuration from TOML, then env and CLI overrides
//! 2. Open SQLite and restore every project's allocator from its journal
//! 3. Build the turn pipeline (queue -> driver -> worker -> processor)
//! 4. Start background jobs (dialogue archival, sheet mirror)
//! 5. Serve the axum API until Ctrl-C, then drain and stop everything

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use atrium_agent::{
    AiGateway, BroadcastReplySink, FanoutReplySink, ProjectRegistry, ReplySink, TurnProcessor,
    TurnWorker, WebhookReplySink,
};
use atrium_api::auth::load_or_generate_token;
use atrium_api::{start_server, AppState};
use atrium_booking::{BookingAllocator, EventFeed};
use atrium_core::clock::{Clock, SystemClock};
use atrium_core::config::AtriumConfig;
use atrium_core::journal::BookingJournal;
use atrium_core::types::ProjectId;
use atrium_mirror::{HttpSheetClient, InMemorySheet, MirrorProjector, Reconciler, SheetClient};
use atrium_queue::{ConversationQueue, QueueDriver};
use atrium_storage::{
    Database, DialogueArchiver, DialogueRepository, FeedbackRepository, HistoryCompressor,
    SqliteJournal,
};

use crate::cli::CliArgs;

const DISPATCH_CHANNEL_CAPACITY: usize = 1024;
const REPLY_STREAM_CAPACITY: usize = 256;
const OUTBOUND_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long background tasks get to finish after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Restore one allocator per project from the journal, replaying the
/// project's committed events into a fresh feed.
fn build_registry(
    config: &AtriumConfig,
    journal: &Arc<SqliteJournal>,
) -> Result<ProjectRegistry, Box<dyn std::error::Error>> {
    let mut registry = ProjectRegistry::new();
    for project in &config.projects {
        let project_id = ProjectId::from(project.project_id.as_str());
        let feed = Arc::new(EventFeed::with_history(journal.load_events(&project_id)?));
        let allocator = BookingAllocator::new(
            project,
            config.schedule.slot_minutes,
            Arc::clone(journal) as Arc<dyn BookingJournal>,
            feed,
        )?;
        let restored = allocator.restore(journal.load_bookings(&project_id)?)?;
        tracing::info!(
            project_id = %project_id,
            restored,
            events = allocator.feed().len(),
            "Project allocator ready"
        );
        registry.insert(project.clone(), Arc::new(allocator));
    }
    Ok(registry)
}

fn build_sheet(config: &AtriumConfig) -> Result<Arc<dyn SheetClient>, Box<dyn std::error::Error>> {
    match config.mirror.endpoint.as_deref() {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Sheet mirror enabled");
            let client = HttpSheetClient::new(endpoint, &config.projects, OUTBOUND_HTTP_TIMEOUT)?;
            Ok(Arc::new(client) as Arc<dyn SheetClient>)
        }
        None => {
            tracing::warn!("Sheet mirror enabled without an endpoint; projecting in memory");
            Ok(Arc::new(InMemorySheet::new()) as Arc<dyn SheetClient>)
        }
    }
}

async fn join_all(handles: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in handles {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task panicked"),
            Err(_) => tracing::warn!(task = name, "Task did not stop in time"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. Loaded before tracing so the configured level applies; the
    // outcome is logged once the subscriber is up.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match AtriumConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (AtriumConfig::default(), Some(e)),
    };
    args.apply_overrides(&mut config);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting atrium v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load config, using defaults"
        ),
    }
    config.validate()?;
    if config.projects.is_empty() {
        tracing::warn!("No projects configured; every webhook will return 404");
    }

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("atrium.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let journal = Arc::new(SqliteJournal::new(Arc::clone(&db)));
    let dialogues = Arc::new(DialogueRepository::new(Arc::clone(&db)));
    let feedback = Arc::new(FeedbackRepository::new(Arc::clone(&db)));
    let registry = Arc::new(build_registry(&config, &journal)?);

    // Outbound replies go to the operator stream and to per-project webhooks.
    let broadcast = Arc::new(BroadcastReplySink::new(REPLY_STREAM_CAPACITY));
    let mut sinks: Vec<Arc<dyn ReplySink>> = vec![Arc::clone(&broadcast) as Arc<dyn ReplySink>];
    let webhooks = WebhookReplySink::new(&config.projects, OUTBOUND_HTTP_TIMEOUT)?;
    if webhooks.configured() > 0 {
        tracing::info!(count = webhooks.configured(), "Reply webhooks configured");
        sinks.push(Arc::new(webhooks));
    }
    let sink: Arc<dyn ReplySink> = Arc::new(FanoutReplySink::new(sinks));

    // === Turn pipeline ===

    let gateway = Arc::new(AiGateway::from_config(&config.ai)?);
    let processor = Arc::new(TurnProcessor::new(
        Arc::clone(&registry),
        Arc::clone(&gateway),
        Arc::clone(&dialogues),
        feedback,
        sink,
        Arc::clone(&clock),
        config.schedule.clone(),
        config.ai.history_turns,
    ));
    let queue = Arc::new(ConversationQueue::new(
        config.queue.clone(),
        Arc::clone(&clock),
    ));
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
    let driver = Arc::new(QueueDriver::new(Arc::clone(&queue), dispatch_tx.clone()));
    let worker = Arc::new(TurnWorker::new(
        Arc::clone(&queue),
        processor,
        dispatch_tx,
        Duration::from_secs(config.queue.processing_timeout_secs),
    ));

    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    {
        let driver = Arc::clone(&driver);
        handles.push(("queue-driver", tokio::spawn(async move { driver.run().await })));
    }
    {
        let worker = Arc::clone(&worker);
        handles.push((
            "turn-worker",
            tokio::spawn(async move { worker.run(dispatch_rx).await }),
        ));
    }

    // === Background jobs ===

    let archiver = Arc::new(DialogueArchiver::new(
        Arc::clone(&dialogues),
        Arc::clone(&gateway) as Arc<dyn HistoryCompressor>,
        Arc::clone(&clock),
        config.dialogue.clone(),
        config.schedule.utc_offset_minutes,
    ));
    {
        let archiver = Arc::clone(&archiver);
        handles.push(("dialogue-archiver", tokio::spawn(async move { archiver.run().await })));
    }

    let mut projectors: Vec<Arc<MirrorProjector>> = Vec::new();
    let mut reconciler: Option<Arc<Reconciler>> = None;
    if config.mirror.enabled {
        let sheet = build_sheet(&config)?;
        for (project_id, entry) in registry.iter() {
            let projector = Arc::new(MirrorProjector::new(
                project_id.clone(),
                Arc::clone(entry.allocator.feed()),
                Arc::clone(&sheet),
                &config.mirror,
            ));
            let task = Arc::clone(&projector);
            handles.push(("mirror-projector", tokio::spawn(async move { task.run().await })));
            projectors.push(projector);
        }

        let allocators = registry
            .iter()
            .map(|(_, entry)| Arc::clone(&entry.allocator))
            .collect();
        let rec = Arc::new(Reconciler::new(
            allocators,
            sheet,
            Arc::clone(&clock),
            &config.mirror,
            config.schedule.utc_offset_minutes,
        ));
        let task = Arc::clone(&rec);
        handles.push(("mirror-reconciler", tokio::spawn(async move { task.run().await })));
        reconciler = Some(rec);
    }

    // === API server ===

    let token = load_or_generate_token(&data_dir.join("api_token"));
    let port = config.general.port;
    let mut state = AppState::new(
        config,
        Arc::clone(&queue),
        Arc::clone(&registry),
        dialogues,
        broadcast,
        clock,
    );
    state.api_token = token;
    if let Some(rec) = reconciler.as_ref() {
        state = state.with_reconciler(Arc::clone(rec));
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    let served = start_server(port, state, shutdown).await;
    if let Err(ref e) = served {
        tracing::error!(port, error = %e, "API server failed");
    }

    // === Shutdown ===

    // New messages are refused; in-flight turns finish on the worker.
    queue.close();
    driver.shutdown();
    worker.shutdown();
    archiver.shutdown();
    for projector in &projectors {
        projector.shutdown();
    }
    if let Some(rec) = reconciler.as_ref() {
        rec.shutdown();
    }
    join_all(handles).await;
    tracing::info!("atrium stopped");

    served.map_err(Into::into)
}
