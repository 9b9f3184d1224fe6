use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use futures::join;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};

pub const TIERGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: TIERGATE_VERSION.to_string(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
}

/// A health check that includes the usage store and the API key directory.
/// Each probe gets `store.timeout_ms`, the same budget as a single store call.
pub async fn health_handler(
    State(AppStateData {
        config,
        store,
        keys,
        ..
    }): AppState,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = config.store.timeout();
    let (store_ok, keys_ok) = join!(
        probe("store", limit, store.health()),
        probe("key_directory", limit, keys.health())
    );

    if store_ok && keys_ok {
        return Ok(Json(json!({
            "gateway": "ok",
            "store": "ok",
            "key_directory": "ok",
            "backend": store.backend_name(),
        })));
    }

    Err((
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "gateway": "ok",
            "store": if store_ok { "ok" } else { "error" },
            "key_directory": if keys_ok { "ok" } else { "error" },
            "backend": store.backend_name(),
        })),
    ))
}

async fn probe(
    component: &str,
    limit: Duration,
    check: impl Future<Output = Result<(), Error>>,
) -> bool {
    match timeout(limit, check).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            tracing::warn!(
                component,
                "Health probe timed out after {}ms",
                limit.as_millis()
            );
            false
        }
    }
}
