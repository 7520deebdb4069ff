use anyhow::Result;
use relay_api::run as run_api;
use relay_core::Config;
use relay_core::RelayContext;
use relay_delivery::run as run_delivery;
use relay_delivery::{DeliveryClient, DeliverySettings, FanoutDispatcher, FcmProvider};
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting push relay");

    let config = Config::from_env();
    let ctx = RelayContext::new(config).await?;

    // One client for the whole process; a bad key disables push instead of aborting startup.
    let client = DeliveryClient::with_credentials(
        ctx.config.delivery.fcm_server_key.as_deref(),
        DeliverySettings::from(&ctx.config.delivery),
        FcmProvider::build,
    );
    let dispatcher = FanoutDispatcher::new(ctx.token_store.clone(), client);

    tracing::info!("Relay context initialized");

    let ctx_clone = ctx.clone();
    let dispatcher_clone = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = run_delivery(ctx_clone, dispatcher_clone).await {
            tracing::error!("Delivery consumer error: {}", e);
        }
    });

    tokio::select! {
        result = run_api(ctx, dispatcher) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
