use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};
use crate::rate_limit::B2bCaller;
use crate::report::{ApiEnvelope, B2bRateLimitResponse, ErrorCode};

/// The caller's own key: tier, limits and current usage. The request itself has already
/// been counted by the rate limit middleware.
pub async fn key_usage_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
    Extension(caller): Extension<B2bCaller>,
) -> Result<Response, Error> {
    let now = Utc::now();
    match rate_limiter.key_usage(&caller.fingerprint, now).await? {
        Some(key) => {
            Ok(Json(ApiEnvelope::success(key, now, Some(&caller.rate_limit))).into_response())
        }
        // Deleted between the middleware's lookup and ours
        None => {
            let code = ErrorCode::KeyUnknown;
            let envelope: ApiEnvelope<()> =
                ApiEnvelope::failure(code, now, Some(&caller.rate_limit));
            Ok((code.status_code(), Json(envelope)).into_response())
        }
    }
}

/// The rate limit decision made for this request.
pub async fn rate_limit_handler(
    Extension(caller): Extension<B2bCaller>,
) -> Json<ApiEnvelope<B2bRateLimitResponse>> {
    let now = Utc::now();
    Json(ApiEnvelope::success(
        B2bRateLimitResponse::from(&caller.rate_limit),
        now,
        Some(&caller.rate_limit),
    ))
}
