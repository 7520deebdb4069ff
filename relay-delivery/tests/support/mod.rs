#![allow(dead_code)]

use async_trait::async_trait;
use relay_core::{DeviceToken, MemoryTokenStore, Message, Platform, StorageError, TokenStore};
use relay_delivery::{DeliveryClient, DeliverySettings, ProviderError, PushProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider double that answers from a per-token script and records every
/// call it receives.
pub struct ScriptedProvider {
    script: HashMap<String, ProviderError>,
    batch_error: Option<ProviderError>,
    delay: Duration,
    max_batch: usize,
    batches: Mutex<Vec<Vec<String>>>,
    singles: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        ScriptedProvider {
            script: HashMap::new(),
            batch_error: None,
            delay: Duration::ZERO,
            max_batch: 500,
            batches: Mutex::new(Vec::new()),
            singles: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, token: &str, error: ProviderError) -> Self {
        self.script.insert(token.to_string(), error);
        self
    }

    pub fn failing_batches(mut self, error: ProviderError) -> Self {
        self.batch_error = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn singles(&self) -> Vec<String> {
        self.singles.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.batches.lock().unwrap().len() + self.singles.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, token: &str) -> Result<(), ProviderError> {
        match self.script.get(token) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn send_one(&self, token: &str, _message: &Message) -> Result<(), ProviderError> {
        self.singles.lock().unwrap().push(token.to_string());
        self.enter().await;
        self.answer(token)
    }

    async fn send_many(
        &self,
        tokens: &[String],
        _message: &Message,
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
        self.batches.lock().unwrap().push(tokens.to_vec());
        self.enter().await;
        if let Some(error) = &self.batch_error {
            return Err(error.clone());
        }
        Ok(tokens.iter().map(|token| self.answer(token)).collect())
    }
}

/// Store wrapper whose listing repeats every token.
pub struct DuplicatingStore(pub Arc<MemoryTokenStore>);

/// Store wrapper whose deletes always fail.
pub struct FailingPruneStore(pub Arc<MemoryTokenStore>);

/// Store wrapper whose deletes never complete.
pub struct HangingPruneStore(pub Arc<MemoryTokenStore>);

/// Store that cannot be reached at all.
pub struct UnreachableStore;

macro_rules! delegate_writes {
    ($ty:ty) => {
        #[async_trait]
        impl TokenStore for $ty {
            async fn register(
                &self,
                user_id: &str,
                token: &str,
                device_id: Option<&str>,
                platform: Option<Platform>,
            ) -> Result<DeviceToken, StorageError> {
                self.0.register(user_id, token, device_id, platform).await
            }

            async fn list_tokens(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
                self.list(user_id).await
            }

            async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceToken>, StorageError> {
                self.0.list_devices(user_id).await
            }

            async fn remove_token(&self, token: &str) -> Result<usize, StorageError> {
                self.remove(token).await
            }

            async fn remove_owned_token(&self, user_id: &str, token: &str) -> Result<usize, StorageError> {
                self.0.remove_owned_token(user_id, token).await
            }

            async fn remove_all_for_user(&self, user_id: &str) -> Result<usize, StorageError> {
                self.0.remove_all_for_user(user_id).await
            }

            async fn remove_for_device(&self, user_id: &str, device_id: &str) -> Result<usize, StorageError> {
                self.0.remove_for_device(user_id, device_id).await
            }
        }
    };
}

impl DuplicatingStore {
    async fn list(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let tokens = self.0.list_tokens(user_id).await?;
        Ok(tokens.iter().chain(tokens.iter()).cloned().collect())
    }

    async fn remove(&self, token: &str) -> Result<usize, StorageError> {
        self.0.remove_token(token).await
    }
}

impl FailingPruneStore {
    async fn list(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        self.0.list_tokens(user_id).await
    }

    async fn remove(&self, _token: &str) -> Result<usize, StorageError> {
        Err(StorageError::Unavailable("connection refused".to_string()))
    }
}

impl HangingPruneStore {
    async fn list(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        self.0.list_tokens(user_id).await
    }

    async fn remove(&self, _token: &str) -> Result<usize, StorageError> {
        std::future::pending().await
    }
}

delegate_writes!(DuplicatingStore);
delegate_writes!(FailingPruneStore);
delegate_writes!(HangingPruneStore);

#[async_trait]
impl TokenStore for UnreachableStore {
    async fn register(
        &self,
        _user_id: &str,
        _token: &str,
        _device_id: Option<&str>,
        _platform: Option<Platform>,
    ) -> Result<DeviceToken, StorageError> {
        Err(unreachable_store())
    }

    async fn list_tokens(&self, _user_id: &str) -> Result<Vec<String>, StorageError> {
        Err(unreachable_store())
    }

    async fn list_devices(&self, _user_id: &str) -> Result<Vec<DeviceToken>, StorageError> {
        Err(unreachable_store())
    }

    async fn remove_token(&self, _token: &str) -> Result<usize, StorageError> {
        Err(unreachable_store())
    }

    async fn remove_owned_token(&self, _user_id: &str, _token: &str) -> Result<usize, StorageError> {
        Err(unreachable_store())
    }

    async fn remove_all_for_user(&self, _user_id: &str) -> Result<usize, StorageError> {
        Err(unreachable_store())
    }

    async fn remove_for_device(&self, _user_id: &str, _device_id: &str) -> Result<usize, StorageError> {
        Err(unreachable_store())
    }
}

fn unreachable_store() -> StorageError {
    StorageError::Unavailable("pool timed out".to_string())
}

pub fn settings(max_batch_size: usize, max_in_flight: usize) -> DeliverySettings {
    DeliverySettings {
        max_batch_size,
        max_in_flight,
        request_timeout: Duration::from_secs(10),
    }
}

pub fn ready_client(provider: &Arc<ScriptedProvider>, settings: DeliverySettings) -> DeliveryClient {
    let provider: Arc<dyn PushProvider> = provider.clone();
    DeliveryClient::ready(provider, settings)
}

pub async fn seed(store: &MemoryTokenStore, user_id: &str, tokens: impl IntoIterator<Item = String>) {
    for token in tokens {
        store.register(user_id, &token, None, None).await.unwrap();
    }
}

pub fn numbered_tokens(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{:04}", prefix, i)).collect()
}

pub fn message() -> Message {
    Message::new("New Follower", "Someone started following you")
}
