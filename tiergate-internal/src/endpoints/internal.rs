use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{Json, Response};
use secrecy::SecretString;
use serde::Serialize;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::metrics::MetricsSnapshot;
use crate::rate_limit::fingerprint_api_key;

pub const INTERNAL_TOKEN_HEADER: &str = "x-tiergate-internal-token";

/// Guards the `/internal` routes with `gateway.internal_token`, when one is configured.
pub async fn internal_token_middleware(
    State(AppStateData { config, .. }): AppState,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if let Some(expected) = &config.gateway.internal_token {
        let presented = request
            .headers()
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| SecretString::from(value.to_string()));
        // Compare digests so the comparison time does not depend on the token's contents
        let authorized = presented.is_some_and(|presented| {
            fingerprint_api_key(&presented) == fingerprint_api_key(expected)
        });
        if !authorized {
            return Err(Error::new(ErrorDetails::InternalTokenInvalid));
        }
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub status: String,
    pub features: usize,
}

/// Re-reads `policies.path` and swaps the new catalog in. A catalog that fails to load
/// leaves the current one active.
pub async fn reload_policies_handler(
    State(AppStateData {
        config, policies, ..
    }): AppState,
) -> Result<Json<ReloadResponse>, Error> {
    let path = config.policies.path.as_ref().ok_or_else(|| {
        Error::new(ErrorDetails::InvalidRequest {
            message: "the embedded policy catalog cannot be reloaded; set `policies.path`"
                .to_string(),
        })
    })?;
    let catalog = policies.reload_from_path(path).await?;
    Ok(Json(ReloadResponse {
        status: "ok".to_string(),
        features: catalog.declared_features().count(),
    }))
}

pub async fn metrics_handler(
    State(AppStateData { metrics, .. }): AppState,
) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
