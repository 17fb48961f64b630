use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use panelmux::collector::cache::FetchCache;
use panelmux::collector::Collector;
use panelmux::config::AppConfig;
use panelmux::db::{PgStore, Store};
use panelmux::enforcement::{Enforcer, UsageSync};
use panelmux::notifications::TelegramNotifier;
use panelmux::panels::PanelClients;
use panelmux::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "panelmux", about = "Multi-panel subscription aggregator")]
struct Cli {
    /// Listen address, overriding LISTEN_ADDR.
    #[arg(long)]
    listen: Option<String>,
    /// Run a single usage sync pass and exit.
    #[arg(long)]
    sync_once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let clients = Arc::new(PanelClients::new(http.clone()));
    let cache = Arc::new(FetchCache::new(Duration::from_secs(config.fetch_cache_ttl)));
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let collector = Arc::new(Collector::new(
        store.clone(),
        clients.clone(),
        cache,
        config.fetch_max_workers,
    ));
    let notifier = Arc::new(TelegramNotifier::new(http, config.bot_token.clone()));
    let enforcer = Arc::new(Enforcer::new(store.clone(), clients.clone(), notifier));

    let sync = UsageSync::new(store, clients, enforcer.clone(), config.admin_ids.clone());

    if cli.sync_once {
        sync.run_tick().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle = tokio::spawn(sync.run(config.usage_sync_interval, shutdown_rx));

    let state = AppState {
        pool,
        collector,
        enforcer,
        admin_ids: config.admin_ids.clone(),
    };
    let app = web::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sync_handle.await;
    Ok(())
}
