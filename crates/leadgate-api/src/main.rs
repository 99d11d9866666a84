//! `leadgate-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use leadgate_api::config::Config;
use leadgate_api::server::Server;
use leadgate_core::observability::{LogFormat, init_logging};
use leadgate_core::storage::{FsBackend, MemoryBackend, StorageBackend};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    init_logging(choose_log_format(&config));

    let storage: Arc<dyn StorageBackend> = if let Some(dir) = config.storage.data_dir.as_deref() {
        tracing::info!(data_dir = %dir, "Using filesystem storage backend");
        Arc::new(FsBackend::new(dir)?)
    } else {
        if !config.debug {
            anyhow::bail!("LEADGATE_DATA_DIR is required when LEADGATE_DEBUG=false");
        }
        tracing::warn!("LEADGATE_DATA_DIR not set; using in-memory storage backend (debug only)");
        Arc::new(MemoryBackend::new())
    };

    let server = Server::builder()
        .config(config)
        .storage_backend(storage)
        .build();
    server.serve().await?;
    Ok(())
}
