use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use std::sync::Arc;
use tracing;

use crate::config::RedpandaConfig;

pub type RedpandaConsumer = Arc<StreamConsumer>;

fn build_client_config(brokers: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", brokers)
        .set("metadata.request.timeout.ms", "30000")
        .set("socket.timeout.ms", "30000")
        .set("socket.keepalive.enable", "true")
        .set("broker.address.family", "v4");

    if let Ok(ssl_enabled) = std::env::var("REDPANDA_SSL_ENABLED") {
        if ssl_enabled == "true" || ssl_enabled == "1" {
            tracing::info!("SSL/TLS enabled for Redpanda connection");
            client_config.set("security.protocol", "ssl");

            if let Ok(ca_location) = std::env::var("REDPANDA_SSL_CA_LOCATION") {
                client_config.set("ssl.ca.location", &ca_location);
            }
            if let Ok(cert_location) = std::env::var("REDPANDA_SSL_CERT_LOCATION") {
                client_config.set("ssl.certificate.location", &cert_location);
            }
            if let Ok(key_location) = std::env::var("REDPANDA_SSL_KEY_LOCATION") {
                client_config.set("ssl.key.location", &key_location);
            }
        }
    }

    client_config
}

/// Builds a consumer for the configured brokers, or `None` when no brokers
/// are configured.
pub fn create_consumer(config: &RedpandaConfig) -> Result<Option<RedpandaConsumer>> {
    let brokers = match &config.brokers {
        Some(brokers) => brokers,
        None => return Ok(None),
    };

    tracing::info!(
        "Creating Redpanda consumer (brokers: {}, group: {})",
        brokers,
        config.consumer_group
    );

    let consumer: StreamConsumer = build_client_config(brokers)
        .set("group.id", &config.consumer_group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| {
            tracing::error!("Failed to create Redpanda consumer for {}: {}", brokers, e);
            anyhow!("Failed to create Redpanda consumer: {}", e)
        })?;

    Ok(Some(Arc::new(consumer)))
}
