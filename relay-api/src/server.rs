use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, post},
    Router,
};
use relay_core::RelayContext;
use relay_delivery::FanoutDispatcher;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::handlers;
use crate::identity;

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(ctx: RelayContext, dispatcher: FanoutDispatcher) -> Router {
    let cors = cors_layer(ctx.config.server.cors_origins.as_deref());
    if ctx.config.server.internal_callers.is_none() {
        tracing::warn!("INTERNAL_CALLER_IDS not set, any authenticated caller may send notifications");
    }

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/device-tokens",
            post(handlers::register_device_token)
                .get(handlers::list_device_tokens)
                .delete(handlers::remove_all_device_tokens),
        )
        .route("/api/v1/device-tokens/:token", delete(handlers::remove_device_token))
        .route("/api/v1/devices/:device_id/tokens", delete(handlers::remove_device))
        .route("/api/v1/notifications", post(handlers::send_notification))
        .route("/api/v1/notifications/test", post(handlers::test_notification))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(ctx))
                .layer(Extension(dispatcher))
                .layer(middleware::from_fn(identity::identity_middleware)),
        )
}

pub async fn run(ctx: RelayContext, dispatcher: FanoutDispatcher) -> Result<()> {
    let host: std::net::IpAddr = ctx.config.server.host.parse()?;
    let addr = SocketAddr::new(host, ctx.config.server.api_port);
    let app = router(ctx, dispatcher);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
