use anyhow::Context;
use marginalia_relay::{
    access::DocumentAccessStore,
    bus::Bus,
    config::{LogFormat, RelayConfig},
    db::pool::{check_pool_health, create_pg_pool},
    RelayServer, SHUTDOWN_DRAIN_TIMEOUT,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let database_url = config
        .database_url
        .as_deref()
        .context("MARGINALIA_RELAY_DATABASE_URL must be set for the document access lookup")?;
    let pool = create_pg_pool(database_url, &config.pool).await?;
    check_pool_health(&pool).await?;

    let bus = match config.redis_url.as_deref() {
        Some(redis_url) => Bus::redis(redis_url).await.context("failed to connect to redis bus")?,
        None => {
            warn!("MARGINALIA_RELAY_REDIS_URL not set, events stay within this process");
            Bus::in_memory()
        }
    };
    info!(bus = bus.backend(), "relay bus ready");

    let server = RelayServer::start(&config, bus, DocumentAccessStore::Postgres(pool)).await?;

    shutdown_signal().await;
    server.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
