//! Judge context: every shared handle the workers need, constructed
//! explicitly at startup instead of living in module-level singletons.
//! Lifecycle is construct -> run -> drain -> close; `main` owns it.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use rocode_common::config::JudgeConfig;
use tracing::info;

use crate::backend::ExecutionBackend;
use crate::store::SubmissionStore;

#[derive(Clone)]
pub struct JudgeContext {
    pub config: JudgeConfig,
    pub redis: redis::aio::ConnectionManager,
    pub backend: Arc<ExecutionBackend>,
    pub store: SubmissionStore,
}

impl JudgeContext {
    /// Connect to Redis and select the execution backend for this host.
    pub async fn connect(config: JudgeConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .context("Invalid Redis URL")?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!(redis = %config.redis_url, "Connected to Redis");

        let backend = ExecutionBackend::from_config(&config)?;
        let store = SubmissionStore::new(conn.clone());

        Ok(JudgeContext {
            config,
            redis: conn,
            backend: Arc::new(backend),
            store,
        })
    }
}
