use std::sync::Arc;

use crate::chain::rpc::RpcClient;
use crate::chain::{LiveSource, LogSource};
use crate::config::HubConfig;
use crate::db::bars::{BarKind, BarStore};
use crate::db::pool::{open_pool, DbPool};
use crate::error::HubError;
use crate::feed::ChartSession;
use crate::ingest::TickIngestor;

/// Shared application state, passed to all route handlers via `axum::extract::State`.
pub struct AppState {
    pub config: HubConfig,
    pub pool: DbPool,
    pub bars: Arc<BarStore>,
    pub ingestor: TickIngestor,
    pub logs: Arc<dyn LogSource>,
    pub live: Arc<dyn LiveSource>,
}

impl AppState {
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let pool = open_pool(&config.db_path, 8)?;
        let bars = Arc::new(BarStore::new(pool.clone()));
        let ingestor = TickIngestor::new(Arc::clone(&bars), pool.clone());

        let rpc = Arc::new(RpcClient::new(
            config.rpc_url.clone(),
            config.settle_topic.clone(),
        ));
        let logs: Arc<dyn LogSource> = Arc::clone(&rpc) as Arc<dyn LogSource>;
        let live: Arc<dyn LiveSource> = rpc;

        Ok(Arc::new(Self {
            config,
            pool,
            bars,
            ingestor,
            logs,
            live,
        }))
    }

    /// Open a chart session for one (series, kind).  The session owns its
    /// buffer and live feed; nothing is shared across sessions.
    pub fn open_session(&self, series_id: &str, kind: BarKind) -> ChartSession {
        ChartSession::new(
            &self.config,
            series_id.to_string(),
            kind,
            Arc::clone(&self.logs),
            Arc::clone(&self.live),
        )
    }
}
