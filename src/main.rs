use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;

use smartmail::api::{self, AppState};
use smartmail::channels::{ResendSender, SlackNotifier, WebhookNotifier};
use smartmail::classify::ClassificationService;
use smartmail::config::AppConfig;
use smartmail::llm::create_providers;
use smartmail::objects::FsObjectStore;
use smartmail::pipeline::{
    ActionRuleEngine, AutoReplyGate, IngestService, MessageProcessor, QueueConsumer,
};
use smartmail::queue::{ConsumerOptions, LocalQueue, spawn_consumer};
use smartmail::reliability::{
    FailedQueueRetry, Maintenance, RetentionCleanup, SlaScanner, parse_schedule, spawn_maintenance,
};
use smartmail::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    tracing::info!("SmartMail v{}", env!("CARGO_PKG_VERSION"));

    // ── Storage ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .context("Failed to open database")?,
    );
    let objects = Arc::new(
        FsObjectStore::new(&config.server.object_dir)
            .await
            .context("Failed to open object store")?,
    );

    // ── Outbound channels ───────────────────────────────────────────────
    let http = reqwest::Client::new();
    let slack = config
        .notify
        .slack_webhook_url
        .as_ref()
        .map(|url| SlackNotifier::new(http.clone(), url));
    let webhook = config
        .notify
        .custom_webhook_url
        .as_ref()
        .map(|url| WebhookNotifier::new(http.clone(), url));
    let resend = ResendSender::from_config(&config.reply, http.clone());
    if resend.is_none() {
        tracing::info!("Transactional email not configured, replies stay as drafts");
    }

    // ── Pipeline ────────────────────────────────────────────────────────
    let classifier = Arc::new(
        ClassificationService::new(create_providers(&config.ai, http.clone()))
            .with_timeout(config.ai.request_timeout),
    );
    let processor = Arc::new(MessageProcessor::new(
        db.clone(),
        classifier,
        ActionRuleEngine::new(db.clone(), db.clone(), slack.clone(), webhook),
        AutoReplyGate::new(db.clone(), resend, &config.reply),
    ));

    let (queue, receiver) = LocalQueue::new(config.server.queue_capacity);
    let (consumer_handle, consumer_shutdown) = spawn_consumer(
        queue.clone(),
        receiver,
        Arc::new(QueueConsumer::new(processor.clone())),
        ConsumerOptions::default(),
    );

    let ingest = Arc::new(IngestService::new(
        db.clone(),
        db.clone(),
        objects.clone(),
        queue.clone(),
        config.limits,
    ));

    // ── Maintenance ─────────────────────────────────────────────────────
    let schedule = parse_schedule(&config.server.maintenance_cron)?;
    let maintenance = Arc::new(Maintenance {
        retry: FailedQueueRetry::new(db.clone(), queue.clone()),
        retention: RetentionCleanup::new(db.clone(), objects, config.limits.retention_days),
        sla: SlaScanner::new(db.clone(), slack),
    });
    let (maintenance_handle, maintenance_shutdown) = spawn_maintenance(schedule, maintenance);

    // ── HTTP ────────────────────────────────────────────────────────────
    if config.server.internal_api_secret.is_none() {
        tracing::warn!("INTERNAL_API_SECRET not set, internal endpoints are disabled");
    }
    let app = api::router(AppState {
        db: db.clone(),
        processor,
        ingest,
        internal_secret: config.server.internal_api_secret.clone(),
        dashboard_secret: config.server.dashboard_api_secret.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    consumer_shutdown.store(true, Ordering::Relaxed);
    maintenance_shutdown.store(true, Ordering::Relaxed);
    let _ = tokio::join!(consumer_handle, maintenance_handle);
    tracing::info!("SmartMail stopped");
    Ok(())
}

/// Log to stderr, or to a daily-rolling file when a log directory is set.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "smartmail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
