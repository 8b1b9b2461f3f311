pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod storage;
pub mod validation;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use synth_core::SpeechModel;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::require_proxy_auth;
use crate::config::ServerConfig;
use crate::handlers::{generate_speech, health_check, list_languages, metrics_endpoint};
use crate::metrics::AppMetrics;
use crate::storage::BucketStore;

/// Request bodies are small JSON documents; text is capped at 5000 characters.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn SpeechModel>,
    pub store: Arc<BucketStore>,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(model: Arc<dyn SpeechModel>, config: ServerConfig) -> Self {
        let store = Arc::new(BucketStore::new(config.bucket_mount.clone()));
        Self {
            model,
            store,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
            started_at: Instant::now(),
        }
    }
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let Ok(value) = HeaderValue::from_str(&request_id) else {
        return next.run(request).await;
    };
    request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let permissive = || {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods.clone())
            .allow_headers(Any)
            .allow_credentials(false)
    };

    let Some(allowed_origins) = config.cors_allowed_origins.as_ref() else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return permissive();
    };

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        permissive()
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods.clone())
            .allow_headers(Any)
            .allow_credentials(false)
    }
}

/// Build the application router with the full middleware stack.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    // Global limiter: every caller shares one bucket, which behaves the same
    // behind the platform proxy as it does locally.
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / per_minute as u64).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit: {}/min", per_minute))?,
    );
    info!("Rate limiting: {} requests per minute", per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    let speech_api = Router::new()
        .route("/generate_speech", post(generate_speech))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_proxy_auth));

    let public_api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/languages", get(list_languages))
        .route("/metrics", get(metrics_endpoint));

    let api = Router::new().merge(speech_api).merge(public_api);

    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
