use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use open_draft_moderation::config::{DatabaseLocation, ServiceConfig};
use open_draft_moderation::llm::create_provider;
use open_draft_moderation::moderation::{
    AppState, ModerationProcessor, ModerationQueue, PrescreenRules, VisionAnalyzer,
    moderation_routes, spawn_pending_sweep_task, spawn_stale_sweep_task,
};
use open_draft_moderation::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing: stderr always, daily rolling file when OPEN_DRAFT_LOG_DIR is set
    let (file_layer, _log_guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "moderation.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %config.llm.model,
        bind = %config.bind_addr,
        "Starting moderation service"
    );

    // Database
    let db: Arc<dyn Database> = match config.database {
        DatabaseLocation::File(ref path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            Arc::new(LibSqlBackend::new_local(path).await?)
        }
        DatabaseLocation::Memory => {
            tracing::warn!("Using an in-memory database; moderation state is lost on exit");
            Arc::new(LibSqlBackend::new_memory().await?)
        }
    };

    // Moderation pipeline
    let llm = create_provider(&config.llm)?;
    let analyzer = VisionAnalyzer::new(llm, &config.upload_dir, config.max_image_bytes)
        .with_store(Arc::clone(&db));

    let mut rules = PrescreenRules::default_rules();
    for host in &config.blocked_hosts {
        rules
            .block_host(host)
            .with_context(|| format!("Invalid blocked host: {host}"))?;
    }
    info!(rules = rules.len(), "Pre-screen rules loaded");

    let queue = ModerationQueue::new(Arc::clone(&db));
    let processor = Arc::new(ModerationProcessor::new(
        Arc::clone(&queue),
        analyzer,
        rules,
        config.processor.clone(),
    ));

    // Background sweeps
    let _pending_sweep = spawn_pending_sweep_task(
        Arc::clone(&processor),
        config.sweep_interval,
        config.sweep_batch_size,
    );
    let _stale_sweep = spawn_stale_sweep_task(
        Arc::clone(&queue),
        config.sweep_interval,
        config.stale_analysis_after,
    );

    // HTTP + WebSocket
    let app = moderation_routes(AppState {
        queue,
        processor,
        admin_token: config.admin_token.clone(),
        analyze_on_submit: config.analyze_on_submit,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Listening (REST /api, WebSocket /ws)");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
