use async_trait::async_trait;
use futures::future::join_all;
use relay_core::{DeliveryOutcome, DispatchSummary, Message, StorageError, TokenStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::client::{token_hint, BatchObserver, DeliveryClient, Outcomes};

/// Upper bound on a single prune so a stalled store cannot hold up a dispatch.
const PRUNE_TIMEOUT: Duration = Duration::from_secs(5);

/// Removes tokens the provider reported as permanently invalid. A failed or
/// timed-out delete is logged and the token still counts as pruned.
struct Pruner {
    store: Arc<dyn TokenStore>,
}

impl Pruner {
    async fn prune(&self, token: &str) {
        match tokio::time::timeout(PRUNE_TIMEOUT, self.store.remove_token(token)).await {
            Ok(Ok(_)) => tracing::debug!("Pruned invalid token {}", token_hint(token)),
            Ok(Err(e)) => tracing::warn!("Failed to prune invalid token {}: {}", token_hint(token), e),
            Err(_) => tracing::warn!(
                "Pruning invalid token {} timed out after {:?}",
                token_hint(token),
                PRUNE_TIMEOUT
            ),
        }
    }
}

#[async_trait]
impl BatchObserver for Pruner {
    async fn on_sub_batch(&self, outcomes: &Outcomes) {
        let prunes = outcomes
            .iter()
            .filter(|(_, outcome)| **outcome == DeliveryOutcome::InvalidToken)
            .map(|(token, _)| self.prune(token));
        join_all(prunes).await;
    }
}

/// Fans one message out to every device a user has registered.
#[derive(Clone)]
pub struct FanoutDispatcher {
    store: Arc<dyn TokenStore>,
    client: DeliveryClient,
}

impl FanoutDispatcher {
    pub fn new(store: Arc<dyn TokenStore>, client: DeliveryClient) -> Self {
        Self { store, client }
    }

    pub fn client(&self) -> &DeliveryClient {
        &self.client
    }

    /// Sends `message` to all of `user_id`'s tokens and prunes the ones the
    /// provider rejects as invalid.
    ///
    /// Only a failure to read the token listing is returned as an error;
    /// per-token failures are counted in the summary. Transient failures are
    /// left for the caller to retry.
    pub async fn send_to_user(&self, user_id: &str, message: &Message) -> Result<DispatchSummary, StorageError> {
        let listed = self.store.list_tokens(user_id).await?;
        if listed.is_empty() {
            tracing::debug!("No device tokens registered for user {}", user_id);
            return Ok(DispatchSummary::default());
        }

        let listed_count = listed.len();
        let tokens = dedup_tokens(listed);
        if tokens.len() < listed_count {
            tracing::debug!(
                "Dropped {} duplicate token(s) for user {}",
                listed_count - tokens.len(),
                user_id
            );
        }

        let pruner: Arc<dyn BatchObserver> = Arc::new(Pruner {
            store: self.store.clone(),
        });
        let outcomes = self
            .client
            .send_batch_observed(&tokens, message, Some(pruner))
            .await;

        let mut summary = DispatchSummary::default();
        for outcome in outcomes.values() {
            summary.record(*outcome);
        }

        tracing::info!(
            user_id = %user_id,
            delivered = summary.delivered,
            invalid_pruned = summary.invalid_pruned,
            transient_failed = summary.transient_failed,
            "Dispatched notification to {} device(s)",
            tokens.len()
        );

        Ok(summary)
    }

    /// Sends `message` to a single token owned by `user_id`. Returns `None`
    /// when the user does not own the token.
    pub async fn send_to_token(
        &self,
        user_id: &str,
        token: &str,
        message: &Message,
    ) -> Result<Option<DeliveryOutcome>, StorageError> {
        let owned = self.store.list_tokens(user_id).await?;
        if !owned.iter().any(|t| t == token) {
            return Ok(None);
        }

        let outcome = self.client.send_one(token, message).await;
        if outcome == DeliveryOutcome::InvalidToken {
            Pruner {
                store: self.store.clone(),
            }
            .prune(token)
            .await;
        }

        Ok(Some(outcome))
    }
}

/// Drops repeated tokens, keeping first-seen order.
fn dedup_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(tokens.len());
    tokens
        .into_iter()
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let tokens = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dedup_tokens(tokens), vec!["b", "a", "c"]);
    }
}
