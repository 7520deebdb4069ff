use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::db::create_pool;
use crate::pg_token_store::PgTokenStore;
use crate::token_store::{MemoryTokenStore, TokenStore};

#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<Config>,
    pub token_store: Arc<dyn TokenStore>,
}

impl RelayContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let token_store: Arc<dyn TokenStore> = match config.store.backend {
            StoreBackend::Postgres => {
                let pool = create_pool(&config.database).await?;
                Arc::new(PgTokenStore::new(pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory token store; registrations are lost on restart");
                Arc::new(MemoryTokenStore::new())
            }
        };

        Ok(Self::with_store(config, token_store))
    }

    pub fn with_store(config: Config, token_store: Arc<dyn TokenStore>) -> Self {
        RelayContext {
            config: Arc::new(config),
            token_store,
        }
    }
}
