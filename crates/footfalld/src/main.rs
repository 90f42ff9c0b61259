use anyhow::{Context, Result};
use footfall_core::IdentityGateway;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod store;

use config::{Bus, Config, BUS_NAME, OBJECT_PATH};
use dbus_interface::FootfallService;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("footfalld starting");

    let config = Config::from_env();
    let pipeline = config.pipeline().context("invalid pipeline configuration")?;

    let (store, store_kind) = if config.memory_store {
        tracing::warn!("FOOTFALL_MEMORY_STORE=1: identities will not survive a restart");
        (SqliteStore::open_in_memory().await?, "memory")
    } else {
        let store = SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open {}", config.db_path.display()))?;
        (store, "sqlite")
    };

    let gateway = Arc::new(IdentityGateway::new(
        Arc::new(store),
        &pipeline.matching,
        config.store_timeout(),
    ));
    tracing::info!(
        similarity_threshold = gateway.similarity_threshold(),
        store_timeout = ?gateway.store_timeout(),
        store = store_kind,
        "identity gateway ready"
    );

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FootfallService::new(gateway, store_kind))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "footfalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("footfalld shutting down");

    Ok(())
}
