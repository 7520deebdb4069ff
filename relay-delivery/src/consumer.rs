use anyhow::{anyhow, Result};
use rdkafka::consumer::Consumer;
use rdkafka::Message as KafkaMessage;
use relay_core::redpanda::create_consumer;
use relay_core::{Message, RelayContext};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing;

use crate::dispatcher::FanoutDispatcher;

const TOPIC: &str = "notifications.delivery";

/// A job published by upstream services asking for one user's devices to be
/// notified.
#[derive(Debug, Deserialize)]
struct DeliveryJob {
    user_id: String,
    notification: Message,
}

pub async fn run(ctx: RelayContext, dispatcher: FanoutDispatcher) -> Result<()> {
    let consumer = match create_consumer(&ctx.config.redpanda)? {
        Some(consumer) => consumer,
        None => {
            tracing::info!("REDPANDA_BROKERS not set, delivery-job consumer not started");
            return Ok(());
        }
    };

    consumer.subscribe(&[TOPIC])?;
    tracing::info!("Delivery consumer subscribed to topic: {}", TOPIC);

    let mut error_count = 0u32;
    let mut last_error_log: Option<Instant> = None;

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    if let Err(e) = handle_delivery(&dispatcher, payload).await {
                        tracing::error!("Error processing delivery job: {}", e);
                    }
                }
            }
            Err(e) => {
                error_count = error_count.saturating_add(1);
                if last_error_log.map_or(true, |at| at.elapsed() >= Duration::from_secs(30)) {
                    tracing::warn!(
                        "Error receiving message from Redpanda (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = Some(Instant::now());
                }
                tokio::time::sleep(receive_backoff(error_count)).await;
            }
        }
    }
}

async fn handle_delivery(dispatcher: &FanoutDispatcher, payload: &[u8]) -> Result<()> {
    let job = parse_job(payload)?;

    let summary = dispatcher
        .send_to_user(&job.user_id, &job.notification)
        .await
        .map_err(|e| anyhow!("dispatch for user {} failed: {}", job.user_id, e))?;

    tracing::debug!("Processed delivery job for {}: {:?}", job.user_id, summary);
    Ok(())
}

fn parse_job(payload: &[u8]) -> Result<DeliveryJob> {
    let job: DeliveryJob = serde_json::from_slice(payload)?;
    if job.user_id.trim().is_empty() {
        return Err(anyhow!("delivery job has an empty user_id"));
    }
    Ok(job)
}

/// 1s, 2s, 4s ... capped at 30s.
fn receive_backoff(error_count: u32) -> Duration {
    Duration::from_secs(1 << error_count.saturating_sub(1).min(5)).min(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_with_data() {
        let job = parse_job(
            br#"{"user_id":"u1","notification":{"title":"Hi","body":"There","data":{"n":1}}}"#,
        )
        .unwrap();

        assert_eq!(job.user_id, "u1");
        assert_eq!(job.notification.title, "Hi");
        assert_eq!(job.notification.string_data()["n"], "1");
    }

    #[test]
    fn rejects_jobs_without_notification_or_user() {
        assert!(parse_job(br#"{"user_id":"u1"}"#).is_err());
        assert!(parse_job(br#"{"user_id":" ","notification":{"title":"a","body":"b"}}"#).is_err());
        assert!(parse_job(b"not json").is_err());
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(receive_backoff(1), Duration::from_secs(1));
        assert_eq!(receive_backoff(2), Duration::from_secs(2));
        assert_eq!(receive_backoff(5), Duration::from_secs(16));
        assert_eq!(receive_backoff(6), Duration::from_secs(30));
        assert_eq!(receive_backoff(40), Duration::from_secs(30));
    }
}
