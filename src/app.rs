use crate::{
    api::CatalogClient, catalog::CatalogService, config::ConfigStore, database::Database,
    download::DownloadManager,
};
use anyhow::{anyhow, Result};
use log::debug;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub const APP_ID: &str = "dev.wknd.CivitaiBrowser";

#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub config: Arc<ConfigStore>,
    pub database: Arc<Database>,
    pub catalog: Arc<CatalogService>,
    pub downloads: Arc<DownloadManager>,
}

impl AppContext {
    pub fn new() -> Result<Self> {
        Self::with_config(ConfigStore::new()?)
    }

    pub fn with_config(config: ConfigStore) -> Result<Self> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
        );

        let config = Arc::new(config);
        let database_path = config.database_path();
        debug!("Opening catalog database at {database_path:?}");
        let database = Arc::new(Database::open(database_path)?);

        let client = CatalogClient::new(config.settings().endpoint(), config.api_token())?;
        let catalog = Arc::new(CatalogService::new(
            runtime.clone(),
            client,
            database.clone(),
        ));
        let downloads = Arc::new(DownloadManager::new(
            runtime.clone(),
            config.clone(),
            database.clone(),
        )?);

        Ok(Self {
            runtime,
            config,
            database,
            catalog,
            downloads,
        })
    }
}
