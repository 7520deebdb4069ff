use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;
use crate::error::StorageError;

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Longest a store call waits for a pooled connection.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Setting up token store connection pool ({})", mask_database_url(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);

    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    let mut last_error = anyhow!("no connection attempt made");
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Token store connection established on attempt {}", attempt);
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!("Token store connection failed on attempt {}: {}", attempt, e);
                last_error = anyhow!("Database connection failed: {}", e);
            }
            Err(_) => {
                tracing::warn!("Token store connection timed out on attempt {}", attempt);
                last_error = anyhow!("Database connection timed out");
            }
        }

        if attempt < CONNECT_ATTEMPTS {
            let wait_time = Duration::from_secs(2_u64.pow(attempt - 1));
            tracing::info!("Waiting {:?} before retry...", wait_time);
            tokio::time::sleep(wait_time).await;
        }
    }

    tracing::error!("All {} token store connection attempts failed", CONNECT_ATTEMPTS);
    Err(last_error)
}

pub async fn get_connection(pool: &DbPool) -> Result<DbConnection, StorageError> {
    match tokio::time::timeout(CHECKOUT_TIMEOUT, pool.get()).await {
        Ok(conn) => conn.map_err(|e| StorageError::Unavailable(e.to_string())),
        Err(_) => Err(StorageError::Unavailable(format!(
            "no pooled connection within {:?}",
            CHECKOUT_TIMEOUT
        ))),
    }
}

fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        let (before_at, after_at) = url.split_at(at_pos);
        let credentials_start = before_at.find("://").map(|i| i + 3).unwrap_or(0);
        match before_at[credentials_start..].rfind(':') {
            Some(colon_pos) => {
                let (protocol_user, _password) = before_at.split_at(credentials_start + colon_pos);
                format!("{}:****{}", protocol_user, after_at)
            }
            None => format!("postgres://****{}", after_at),
        }
    } else {
        "Invalid URL format".to_string()
    }
}
