use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{fingerprint_api_key, B2bDecision, B2bRateLimitResult, RateLimiter};
use crate::report::{ApiEnvelope, ErrorCode, RateLimitHeaders};

/// Attached to requests that passed the B2B rate limiter.
#[derive(Clone, Debug)]
pub struct B2bCaller {
    pub fingerprint: String,
    pub rate_limit: B2bRateLimitResult,
}

/// Charges one request to the caller's API key before the handler runs.
///
/// Rejected keys and exhausted windows are answered here with the B2B envelope; allowed
/// requests carry a `B2bCaller` extension and get the rate limit headers on the way out.
pub async fn b2b_rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(api_key) = extract_api_key(request.headers()) else {
        return Err(Error::new(ErrorDetails::ApiKeyMissing).into_response());
    };
    let fingerprint = fingerprint_api_key(&api_key);
    let now = Utc::now();

    let result = match limiter
        .allow_fingerprint(&fingerprint, now)
        .await
        .map_err(|e| e.into_response())?
    {
        B2bDecision::Rejected(rejection) => {
            let code = ErrorCode::from(rejection);
            let envelope: ApiEnvelope<()> = ApiEnvelope::failure(code, now, None);
            return Err((code.status_code(), Json(envelope)).into_response());
        }
        B2bDecision::Evaluated(result) => result,
    };

    let headers = RateLimitHeaders::from_result(&result, now).to_header_map();
    if let Some(code) = ErrorCode::for_rate_limit(&result) {
        let envelope: ApiEnvelope<()> = ApiEnvelope::failure(code, now, Some(&result));
        let mut response = (code.status_code(), Json(envelope)).into_response();
        response.headers_mut().extend(headers);
        return Err(response);
    }

    request.extensions_mut().insert(B2bCaller {
        fingerprint,
        rate_limit: result,
    });
    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    Ok(response)
}

/// `Authorization: Bearer <key>` first, then `x-api-key`.
fn extract_api_key(headers: &HeaderMap) -> Option<SecretString> {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim);
    let key = bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    })?;
    (!key.is_empty()).then(|| SecretString::from(key))
}
