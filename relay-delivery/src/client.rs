use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use relay_core::config::DeliveryConfig;
use relay_core::{DeliveryOutcome, Message};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing;

use crate::provider::{classify, ProviderError, PushProvider};

pub type Outcomes = HashMap<String, DeliveryOutcome>;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed provider credentials: {0}")]
    MalformedCredentials(String),
}

/// Called once per finished sub-batch, inside the task that ran it, so the
/// hook still runs when the caller has stopped waiting.
#[async_trait]
pub trait BatchObserver: Send + Sync {
    async fn on_sub_batch(&self, outcomes: &Outcomes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    pub max_batch_size: usize,
    pub max_in_flight: usize,
    pub request_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        DeliverySettings::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        DeliverySettings {
            max_batch_size: config.max_batch_size.max(1),
            max_in_flight: config.max_in_flight.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }
}

#[derive(Clone)]
enum Capability {
    Disabled,
    Ready(Arc<dyn PushProvider>),
}

/// Sends messages through the configured push provider and turns every
/// provider answer into a per-token `DeliveryOutcome`.
///
/// Whether a provider is available is decided once, at construction. A
/// disabled client answers `TransientFailure` for every token without
/// touching the network.
#[derive(Clone)]
pub struct DeliveryClient {
    capability: Capability,
    settings: DeliverySettings,
}

impl DeliveryClient {
    pub fn ready(provider: Arc<dyn PushProvider>, settings: DeliverySettings) -> Self {
        tracing::info!(
            "Push delivery enabled via {} (sub-batch {}, {} in flight, timeout {:?})",
            provider.name(),
            settings.max_batch_size.min(provider.max_batch_size()),
            settings.max_in_flight,
            settings.request_timeout
        );
        DeliveryClient {
            capability: Capability::Ready(provider),
            settings,
        }
    }

    pub fn disabled(settings: DeliverySettings) -> Self {
        tracing::warn!("Push delivery disabled (no usable provider credentials)");
        DeliveryClient {
            capability: Capability::Disabled,
            settings,
        }
    }

    /// Builds the provider from `credentials`. Absent, blank or rejected
    /// credentials leave the client disabled.
    pub fn with_credentials<F>(credentials: Option<&str>, settings: DeliverySettings, build: F) -> Self
    where
        F: FnOnce(&str) -> Result<Arc<dyn PushProvider>, DeliveryError>,
    {
        match credentials.map(str::trim).filter(|c| !c.is_empty()) {
            None => Self::disabled(settings),
            Some(credentials) => match build(credentials) {
                Ok(provider) => Self::ready(provider, settings),
                Err(e) => {
                    tracing::error!("Failed to initialise push provider: {}", e);
                    Self::disabled(settings)
                }
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.capability, Capability::Ready(_))
    }

    pub async fn send_one(&self, token: &str, message: &Message) -> DeliveryOutcome {
        let provider = match &self.capability {
            Capability::Disabled => return DeliveryOutcome::TransientFailure,
            Capability::Ready(provider) => provider,
        };

        let result = match tokio::time::timeout(self.settings.request_timeout, provider.send_one(token, message)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        if let Err(e) = &result {
            tracing::debug!("{} send to {} failed: {}", provider.name(), token_hint(token), e);
        }

        classify(&result)
    }

    pub async fn send_batch(&self, tokens: &[String], message: &Message) -> Outcomes {
        self.send_batch_observed(tokens, message, None).await
    }

    /// Chunks `tokens` into provider-sized sub-batches and runs them as
    /// spawned tasks, at most `max_in_flight` at a time. Every token gets
    /// exactly one outcome.
    ///
    /// Dropping the returned future stops further sub-batches from being
    /// issued; sub-batches already running finish in the background and
    /// still call `observer`.
    pub async fn send_batch_observed(
        &self,
        tokens: &[String],
        message: &Message,
        observer: Option<Arc<dyn BatchObserver>>,
    ) -> Outcomes {
        let provider = match &self.capability {
            Capability::Disabled => {
                return tokens
                    .iter()
                    .map(|token| (token.clone(), DeliveryOutcome::TransientFailure))
                    .collect();
            }
            Capability::Ready(provider) => provider.clone(),
        };

        let sub_batch_size = self.settings.max_batch_size.min(provider.max_batch_size()).max(1);
        let limiter = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let message = Arc::new(message.clone());
        let mut outcomes = Outcomes::with_capacity(tokens.len());
        let mut running = FuturesUnordered::new();

        for chunk in tokens.chunks(sub_batch_size) {
            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!("Sub-batch limiter closed: {}", e);
                    mark_transient(&mut outcomes, chunk);
                    continue;
                }
            };

            let chunk = chunk.to_vec();
            let handle = tokio::spawn(run_sub_batch(
                provider.clone(),
                chunk.clone(),
                message.clone(),
                self.settings.request_timeout,
                observer.clone(),
                permit,
            ));
            running.push(async move { (chunk, handle.await) });
        }

        while let Some((chunk, joined)) = running.next().await {
            match joined {
                Ok(sub_batch) => outcomes.extend(sub_batch),
                Err(e) => {
                    tracing::error!("Sub-batch of {} tokens aborted: {}", chunk.len(), e);
                    mark_transient(&mut outcomes, &chunk);
                }
            }
        }

        outcomes
    }
}

async fn run_sub_batch(
    provider: Arc<dyn PushProvider>,
    tokens: Vec<String>,
    message: Arc<Message>,
    timeout: Duration,
    observer: Option<Arc<dyn BatchObserver>>,
    permit: OwnedSemaphorePermit,
) -> Outcomes {
    let results = match tokio::time::timeout(timeout, provider.send_many(&tokens, &message)).await {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            tracing::warn!("{} rejected sub-batch of {} tokens: {}", provider.name(), tokens.len(), e);
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(
                "{} sub-batch of {} tokens timed out after {:?}",
                provider.name(),
                tokens.len(),
                timeout
            );
            Vec::new()
        }
    };

    if !results.is_empty() && results.len() != tokens.len() {
        tracing::warn!(
            "{} returned {} results for {} tokens",
            provider.name(),
            results.len(),
            tokens.len()
        );
    }

    let mut results = results.into_iter();
    let outcomes: Outcomes = tokens
        .into_iter()
        .map(|token| {
            let outcome = match results.next() {
                Some(result) => classify(&result),
                None => DeliveryOutcome::TransientFailure,
            };
            (token, outcome)
        })
        .collect();

    // The provider call is done; let the next sub-batch start while the observer runs.
    drop(permit);

    if let Some(observer) = observer {
        observer.on_sub_batch(&outcomes).await;
    }

    outcomes
}

fn mark_transient(outcomes: &mut Outcomes, tokens: &[String]) {
    for token in tokens {
        outcomes.insert(token.clone(), DeliveryOutcome::TransientFailure);
    }
}

/// Leading characters of a token, enough to correlate log lines.
pub(crate) fn token_hint(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}
