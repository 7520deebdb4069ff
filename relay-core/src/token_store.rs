use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::types::{DeviceToken, Platform};

/// Durable mapping from push token to its owning user and device.
///
/// Every call goes to the backing store; there is no read cache.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Upsert keyed by `token`. An existing row has its owner, device and
    /// platform overwritten. When `device_id` is given, any other token the
    /// same user registered for that device is dropped.
    async fn register(
        &self,
        user_id: &str,
        token: &str,
        device_id: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<DeviceToken, StorageError>;

    async fn list_tokens(&self, user_id: &str) -> Result<Vec<String>, StorageError>;

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceToken>, StorageError>;

    /// Returns the number of rows removed; an unknown token removes nothing.
    async fn remove_token(&self, token: &str) -> Result<usize, StorageError>;

    /// Removes `token` only while `user_id` owns it, in a single store call.
    async fn remove_owned_token(&self, user_id: &str, token: &str) -> Result<usize, StorageError>;

    async fn remove_all_for_user(&self, user_id: &str) -> Result<usize, StorageError>;

    async fn remove_for_device(&self, user_id: &str, device_id: &str) -> Result<usize, StorageError>;
}

/// Process-local store for development runs and tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    rows: RwLock<HashMap<String, DeviceToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn register(
        &self,
        user_id: &str,
        token: &str,
        device_id: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<DeviceToken, StorageError> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;

        if let Some(device_id) = device_id {
            rows.retain(|existing, row| {
                existing == token
                    || row.user_id != user_id
                    || row.device_id.as_deref() != Some(device_id)
            });
        }

        let row = rows
            .entry(token.to_string())
            .and_modify(|row| {
                row.user_id = user_id.to_string();
                row.device_id = device_id.map(str::to_string);
                row.platform = platform;
                row.updated_at = now;
            })
            .or_insert_with(|| DeviceToken {
                token: token.to_string(),
                user_id: user_id.to_string(),
                device_id: device_id.map(str::to_string),
                platform,
                created_at: now,
                updated_at: now,
            });

        Ok(row.clone())
    }

    async fn list_tokens(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.token.clone())
            .collect())
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceToken>, StorageError> {
        let mut devices: Vec<DeviceToken> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(devices)
    }

    async fn remove_token(&self, token: &str) -> Result<usize, StorageError> {
        Ok(usize::from(self.rows.write().await.remove(token).is_some()))
    }

    async fn remove_owned_token(&self, user_id: &str, token: &str) -> Result<usize, StorageError> {
        let mut rows = self.rows.write().await;
        if rows.get(token).map_or(false, |row| row.user_id == user_id) {
            rows.remove(token);
            return Ok(1);
        }
        Ok(0)
    }

    async fn remove_all_for_user(&self, user_id: &str) -> Result<usize, StorageError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| row.user_id != user_id);
        Ok(before - rows.len())
    }

    async fn remove_for_device(&self, user_id: &str, device_id: &str) -> Result<usize, StorageError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| !(row.user_id == user_id && row.device_id.as_deref() == Some(device_id)));
        Ok(before - rows.len())
    }
}
