use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pump_watch::api::{create_router, AppState};
use pump_watch::config::{Config, ServerConfig, StorageConfig, TelegramConfig};
use pump_watch::services::{
    run_once, DedupeStore, FileStore, LogSink, MemoryStore, NotifySink, PollScheduler, PollStats, TelegramSink,
};

fn build_store(cfg: &StorageConfig) -> Arc<dyn DedupeStore> {
    if !cfg.persist {
        tracing::warn!("Persistence disabled, dedupe state is lost on restart");
        return Arc::new(MemoryStore::new(cfg.max_entries));
    }
    match FileStore::open(&cfg.path, cfg.max_entries) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!("Cannot open dedupe store {} ({}), falling back to memory", cfg.path, e);
            Arc::new(MemoryStore::new(cfg.max_entries))
        }
    }
}

fn build_sink(cfg: &TelegramConfig) -> anyhow::Result<Arc<dyn NotifySink>> {
    if cfg.dry_run {
        tracing::info!("✓ Dry run: alerts go to the log");
        return Ok(Arc::new(LogSink));
    }
    if cfg.bot_token.is_empty() || cfg.chat_id.is_empty() {
        tracing::warn!("Telegram token or chat missing, alerts go to the log");
        return Ok(Arc::new(LogSink));
    }
    let sink = TelegramSink::new(&cfg.bot_token, &cfg.chat_id, &cfg.parse_mode, cfg.disable_preview)
        .context("building Telegram client")?;
    tracing::info!("✓ Telegram sink ready (chat {})", cfg.chat_id);
    Ok(Arc::new(sink))
}

async fn serve_status(cfg: ServerConfig, state: Arc<AppState>) {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Status server cannot bind {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("✓ Status server on http://{}", addr);
    if let Err(e) = axum::serve(listener, create_router(state)).await {
        tracing::error!("Status server stopped: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main(worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pump_watch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let once = args.iter().any(|a| a == "--once");
    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .or_else(|| std::env::var("PUMP_WATCH_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string());

    println!("\n🚀 Pump Watch Starting...\n");

    let config = Config::load(&config_path).with_context(|| format!("loading {}", config_path))?;
    tracing::info!("✓ Configuration loaded ({} watchers)", config.watchers.len());

    let store = build_store(&config.storage);
    let sink = build_sink(&config.telegram)?;
    let stats = PollStats::new();
    let grace = config.shutdown_grace();

    let pollers = config
        .watchers
        .iter()
        .map(|w| {
            w.build_poller(store.clone(), sink.clone(), stats.watcher(&w.name), grace)
                .map(Arc::new)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if once {
        for (name, report) in run_once(&pollers).await {
            println!(
                "  {:12} fetch={} records={} new={} alerts={} rejected={}",
                name,
                if report.fetch_ok { "ok" } else { "failed" },
                report.records,
                report.first_sights,
                report.notified,
                report.rejected
            );
        }
        return Ok(());
    }

    let watchers: Vec<String> = pollers.iter().map(|p| p.name().to_string()).collect();
    let scheduler = PollScheduler::spawn(pollers);
    println!("📥 {} pollers running\n", scheduler.len());

    if config.server.enabled {
        let state = Arc::new(AppState { store: store.clone(), stats: stats.clone(), watchers });
        tokio::spawn(serve_status(config.server.clone(), state));
    }

    shutdown_signal().await;
    tracing::info!("Shutting down, waiting up to {}s for in-flight cycles", grace.as_secs() + 1);

    for (name, cycles) in scheduler.shutdown(grace + Duration::from_secs(1)).await {
        match cycles {
            Some(n) => tracing::info!(watcher = %name, "stopped after {} cycles", n),
            None => tracing::warn!(watcher = %name, "did not stop cleanly"),
        }
    }
    if let Err(e) = store.flush() {
        tracing::warn!("Final dedupe store flush failed: {}", e);
    }
    tracing::info!("✓ {} entities tracked", store.len());
    Ok(())
}
