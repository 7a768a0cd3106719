//! Application state shared by all CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use stepline_infra::config::load_engine_config;
use stepline_infra::sqlite::SqliteStateStore;
use stepline_types::config::EngineConfig;

/// Shared handles: data directory, engine config, and the state store.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: Arc<SqliteStateStore>,
}

impl AppState {
    /// Resolve the data directory, load configuration, and open the store.
    ///
    /// The data directory comes from `STEPLINE_DATA_DIR`, falling back to
    /// `~/.stepline`, and is created if missing.
    pub async fn init() -> Result<Self> {
        let data_dir = PathBuf::from(std::env::var("STEPLINE_DATA_DIR").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            format!("{home}/.stepline")
        }));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let database_url = format!("sqlite://{}/stepline.db", data_dir.display());
        let store = SqliteStateStore::open(&database_url)
            .await
            .context("opening state store")?;

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
        })
    }
}
