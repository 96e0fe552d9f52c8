use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::exchange::{Exchange, ExchangeConfig};
use crate::store::{Store, StoreResult};

/// Shared state handed to the HTTP layer: the engine facade plus the
/// append-only trade store. Tests construct a fresh instance against a
/// temporary directory.
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
    pub store: Arc<RwLock<Store>>,
}

impl AppState {
    pub async fn new(store_path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_config(store_path, ExchangeConfig::default()).await
    }

    pub async fn with_config(
        store_path: impl AsRef<Path>,
        cfg: ExchangeConfig,
    ) -> StoreResult<Self> {
        Ok(AppState {
            exchange: Arc::new(Exchange::new(cfg)),
            store: Arc::new(RwLock::new(Store::open(store_path)?)),
        })
    }
}
