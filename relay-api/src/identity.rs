use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing;

/// Header the upstream gateway sets after it has authenticated the caller.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity attached by the upstream gateway. This service trusts it as-is.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

fn user_id_from(req: &Request) -> Option<String> {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub async fn identity_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" || req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let user_id = match user_id_from(&req) {
        Some(id) => id,
        None => {
            tracing::debug!("Missing {} header on {}", USER_ID_HEADER, req.uri().path());
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    req.extensions_mut().insert(AuthenticatedUser { user_id });

    Ok(next.run(req).await)
}
