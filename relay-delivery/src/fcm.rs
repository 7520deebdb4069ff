use async_trait::async_trait;
use fcm::{Client, ErrorReason, FcmError, FcmResponse, MessageBuilder, NotificationBuilder};
use relay_core::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tracing;

use crate::client::{token_hint, DeliveryError};
use crate::provider::{ProviderError, PushProvider, DEFAULT_PROVIDER_BATCH_SIZE};

pub struct FcmProvider {
    client: Client,
    server_key: String,
}

impl FcmProvider {
    pub fn from_server_key(server_key: &str) -> Result<Self, DeliveryError> {
        if server_key.is_empty() || server_key.chars().any(char::is_whitespace) {
            return Err(DeliveryError::MalformedCredentials(
                "FCM server key must be a single non-empty token".to_string(),
            ));
        }

        tracing::info!("Initializing FCM client");

        Ok(Self {
            client: Client::new(),
            server_key: server_key.to_string(),
        })
    }

    /// Builder entry point for `DeliveryClient::with_credentials`.
    pub fn build(server_key: &str) -> Result<Arc<dyn PushProvider>, DeliveryError> {
        Ok(Arc::new(Self::from_server_key(server_key)?))
    }

    fn finish<'a>(
        mut builder: MessageBuilder<'a>,
        message: &'a Message,
        data: &HashMap<String, String>,
    ) -> Result<fcm::Message<'a>, ProviderError> {
        let mut notification = NotificationBuilder::new();
        notification.title(&message.title);
        notification.body(&message.body);
        builder.notification(notification.finalize());

        if !data.is_empty() {
            builder
                .data(data)
                .map_err(|e| ProviderError::Other(format!("unencodable data payload: {}", e)))?;
        }

        Ok(builder.finalize())
    }
}

fn reason_error(reason: &ErrorReason) -> ProviderError {
    match reason {
        ErrorReason::NotRegistered => ProviderError::Unregistered,
        ErrorReason::InvalidRegistration | ErrorReason::MissingRegistration => ProviderError::InvalidToken,
        ErrorReason::DeviceMessageRateExceeded => ProviderError::RateLimited,
        ErrorReason::Unavailable | ErrorReason::InternalServerError => {
            ProviderError::Unavailable(format!("{:?}", reason))
        }
        other => ProviderError::Other(format!("{:?}", other)),
    }
}

fn sdk_error(error: FcmError) -> ProviderError {
    match error {
        FcmError::Unauthorized => ProviderError::Unauthorized,
        FcmError::ServerError(_) => ProviderError::Unavailable("FCM server error".to_string()),
        other => ProviderError::Other(format!("{:?}", other)),
    }
}

/// Per-token results in request order. A top-level error or a missing
/// result list fails the whole call.
fn per_token_results(response: FcmResponse) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
    if let Some(reason) = &response.error {
        return Err(reason_error(reason));
    }

    let results = response
        .results
        .ok_or_else(|| ProviderError::Other("FCM response carried no per-token results".to_string()))?;

    Ok(results
        .iter()
        .map(|result| match &result.error {
            Some(reason) => Err(reason_error(reason)),
            None => Ok(()),
        })
        .collect())
}

#[async_trait]
impl PushProvider for FcmProvider {
    fn name(&self) -> &'static str {
        "fcm"
    }

    fn max_batch_size(&self) -> usize {
        DEFAULT_PROVIDER_BATCH_SIZE
    }

    async fn send_one(&self, token: &str, message: &Message) -> Result<(), ProviderError> {
        let data = message.string_data();
        let request = Self::finish(MessageBuilder::new(&self.server_key, token), message, &data)?;

        let response = self.client.send(request).await.map_err(sdk_error)?;

        if let Some(reason) = &response.error {
            return Err(reason_error(reason));
        }
        if let Some(reason) = response
            .results
            .as_ref()
            .and_then(|results| results.first())
            .and_then(|result| result.error.as_ref())
        {
            return Err(reason_error(reason));
        }

        tracing::debug!("FCM notification sent to device {}", token_hint(token));
        Ok(())
    }

    async fn send_many(
        &self,
        tokens: &[String],
        message: &Message,
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
        let data = message.string_data();
        let request = Self::finish(MessageBuilder::new_multi(&self.server_key, tokens), message, &data)?;

        let response = self.client.send(request).await.map_err(sdk_error)?;
        tracing::debug!(
            "FCM multicast for {} devices: {:?} succeeded, {:?} failed",
            tokens.len(),
            response.success,
            response.failure
        );

        per_token_results(response)
    }
}
