//! Per-run context
//!
//! Built once per run and shared by reference with the extractor, the
//! transformer and the orchestrator. Owns the HTTP client and the metadata
//! store handle; [`PipelineContext::close`] releases the store's connections.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::PipelineError;
use crate::paths::PathResolver;
use crate::store::{MetadataStore, PgMetadataStore};

pub struct PipelineContext {
    config: Config,
    http: Client,
    store: Arc<dyn MetadataStore>,
    paths: PathResolver,
}

impl PipelineContext {
    /// Build a context around an existing store, creating the data roots
    pub fn new(config: Config, store: Arc<dyn MetadataStore>) -> Result<Self, PipelineError> {
        config.validate()?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .user_agent(config.api.user_agent.clone())
            .build()?;

        let paths = config.storage.resolver();
        for root in [paths.raw_root(), paths.processed_root()] {
            std::fs::create_dir_all(root).map_err(|source| PipelineError::Io {
                path: root.to_path_buf(),
                source,
            })?;
        }

        Ok(Self {
            config,
            http,
            store,
            paths,
        })
    }

    /// Connect to the Postgres metadata store and build the context
    pub async fn connect(config: Config) -> Result<Self, PipelineError> {
        let store: Arc<dyn MetadataStore> =
            Arc::new(PgMetadataStore::connect(&config.database).await?);

        match Self::new(config, Arc::clone(&store)) {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                store.close().await;
                Err(e)
            },
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Release network and database handles
    pub async fn close(&self) {
        self.store.close().await;
    }
}
