use async_trait::async_trait;
use relay_core::{DeliveryOutcome, Message};
use thiserror::Error;

/// Largest sub-batch any provider accepts unless it says otherwise.
pub const DEFAULT_PROVIDER_BATCH_SIZE: usize = 500;

/// A typed error reported by the push provider, either for one token or
/// for a whole call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("token is no longer registered")]
    Unregistered,

    #[error("token is not a valid registration")]
    InvalidToken,

    #[error("provider rate limit exceeded")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Only a permanently dead token is worth pruning; everything else may
    /// succeed on a later attempt.
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            ProviderError::Unregistered | ProviderError::InvalidToken => DeliveryOutcome::InvalidToken,
            ProviderError::RateLimited
            | ProviderError::Unavailable(_)
            | ProviderError::Unauthorized
            | ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::Other(_) => DeliveryOutcome::TransientFailure,
        }
    }
}

pub fn classify(result: &Result<(), ProviderError>) -> DeliveryOutcome {
    match result {
        Ok(()) => DeliveryOutcome::Delivered,
        Err(e) => e.outcome(),
    }
}

/// The external messaging capability.
///
/// Implementations must be safe to call from several tasks at once.
#[async_trait]
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_batch_size(&self) -> usize {
        DEFAULT_PROVIDER_BATCH_SIZE
    }

    async fn send_one(&self, token: &str, message: &Message) -> Result<(), ProviderError>;

    /// Per-token results in input order. An `Err` means the call as a whole
    /// failed and no token was attempted.
    async fn send_many(
        &self,
        tokens: &[String],
        message: &Message,
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError>;
}
