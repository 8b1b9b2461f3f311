//! Proxy authentication for the generation endpoint.
//!
//! The platform proxy forwards the caller's token pair as two headers. When
//! no credentials are configured the check is skipped.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

pub const PROXY_KEY_HEADER: &str = "x-proxy-key";
pub const PROXY_SECRET_HEADER: &str = "x-proxy-secret";

pub async fn require_proxy_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.proxy_auth.as_ref() else {
        return Ok(next.run(request).await);
    };

    let (key, secret) = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        (header(PROXY_KEY_HEADER), header(PROXY_SECRET_HEADER))
    };

    if key.as_deref() == Some(expected.key.as_str())
        && secret.as_deref() == Some(expected.secret.as_str())
    {
        Ok(next.run(request).await)
    } else {
        warn!(
            "Rejected unauthenticated request to {} (key present: {})",
            request.uri().path(),
            key.is_some()
        );
        Err(ApiError::Unauthorized)
    }
}
