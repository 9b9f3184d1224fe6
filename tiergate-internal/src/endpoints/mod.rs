use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;

use crate::gateway_util::AppStateData;
use crate::rate_limit::b2b_rate_limit_middleware;

pub mod b2b;
pub mod fallback;
pub mod features;
pub mod internal;
pub mod status;

/// Every gateway route. Layers that only concern the binary (request tracing, body limits)
/// are added by the caller.
pub fn router(app_state: AppStateData) -> Router {
    // Only the B2B routes are metered per API key
    let b2b_routes = Router::new()
        .route("/b2b/v1/usage", get(b2b::key_usage_handler))
        .route("/b2b/v1/rate-limit", get(b2b::rate_limit_handler))
        .route_layer(from_fn_with_state(
            app_state.rate_limiter.clone(),
            b2b_rate_limit_middleware,
        ));

    let feature_routes = Router::new()
        .route("/v1/features", get(features::list_features_handler))
        .route(
            "/v1/features/{feature_id}/access",
            get(features::feature_access_handler),
        )
        .route(
            "/v1/features/{feature_id}/usage",
            post(features::consume_usage_handler),
        );

    let internal_routes = Router::new()
        .route(
            "/internal/policies/reload",
            post(internal::reload_policies_handler),
        )
        .route("/internal/metrics", get(internal::metrics_handler))
        .route_layer(from_fn_with_state(
            app_state.clone(),
            internal::internal_token_middleware,
        ));

    Router::new()
        .merge(b2b_routes)
        .merge(feature_routes)
        .merge(internal_routes)
        .route("/status", get(status::status_handler))
        .route("/health", get(status::health_handler))
        .fallback(fallback::handle_404)
        .with_state(app_state)
}
