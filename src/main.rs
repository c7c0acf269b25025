use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crm_intake::api::{AppState, api_routes};
use crm_intake::config::AppConfig;
use crm_intake::lifecycle::{self, ChannelSink, LifecycleEngine, NotificationSink, TracingSink};
use crm_intake::pipeline::IngestionPipeline;
use crm_intake::store::{AccountStore, Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📇 CRM Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!(
        "   Lifecycle: slow after {}d, inactive after {}d",
        config.thresholds.slow_after_days, config.thresholds.inactive_after_days
    );

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    let db: Arc<dyn Database> = backend.clone();
    let accounts: Arc<dyn AccountStore> = backend;

    // ── Lifecycle ───────────────────────────────────────────────────────
    let (channel_sink, mut digest_rx) = ChannelSink::new(64);
    let sink: Arc<dyn NotificationSink> = Arc::new(channel_sink);
    let engine = Arc::new(LifecycleEngine::new(config.thresholds, accounts, sink));

    // Notification consumer: the transport that would deliver digests is
    // outside this service, so they end up in the log.
    tokio::spawn(async move {
        while let Some(digest) = digest_rx.recv().await {
            TracingSink.notify(&digest.changed, &digest.never_contacted);
        }
    });

    let ticker = if config.sweep.enabled {
        eprintln!("   Sweep: enabled ({})", config.sweep.schedule);
        Some(lifecycle::spawn_sweep_ticker(
            Arc::clone(&engine),
            config.sweep.schedule.clone(),
        ))
    } else {
        eprintln!("   Sweep: disabled");
        None
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let pipeline = Arc::new(IngestionPipeline::new(Arc::clone(&db), Arc::clone(&engine)));
    let app = api_routes(AppState {
        db,
        pipeline,
        engine: Arc::clone(&engine),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    let cancellation = engine.cancellation();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            cancellation.cancel();
        })
        .await
        .context("HTTP server failed")?;

    if let Some(handle) = ticker {
        let _ = handle.await;
    }
    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is configured.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crm-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
