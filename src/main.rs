use std::sync::Arc;

use clap::Parser;
use durable_e2e::apps;
use durable_e2e::client::Client;
use durable_e2e::config::{AppConfig, Cli, StorageConfig};
use durable_e2e::http::{self, AppState};
use durable_e2e::providers::Provider;
use durable_e2e::providers::in_memory::InMemoryProvider;
use durable_e2e::providers::sqlite::SqliteProvider;
use durable_e2e::runtime::{self, Runtime};
use tracing::{error, info};

async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn Provider>, Box<dyn std::error::Error>> {
    Ok(match storage {
        StorageConfig::Memory => Arc::new(InMemoryProvider::new()),
        StorageConfig::Sqlite(url) => Arc::new(SqliteProvider::new(url, None).await?),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "durable_e2e::main", error = %e, "Failed to listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli)?;
    runtime::observability::init_logging(&config.logging)?;

    let store = open_store(&config.storage).await?;
    let (orchestrations, activities, entities) = apps::register_all(&config)?;
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        orchestrations,
        entities,
        config.runtime.to_options(),
    )
    .await;

    let listener = tokio::net::TcpListener::bind(config.http.bind_address()).await?;
    let state = AppState::new(Client::new(store), config);
    let served = http::serve(listener, state, shutdown_signal()).await;

    info!(target: "durable_e2e::main", "Shutting down runtime");
    rt.shutdown(None).await;
    served?;
    Ok(())
}
