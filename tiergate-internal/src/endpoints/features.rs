use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::policy::{resolve, resolve_all, FeatureAccessEntry, Tier};
use crate::quota::Principal;
use crate::report::UsageCheckResponse;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_TIER_HEADER: &str = "x-principal-tier";

/// The principal as asserted by the authentication layer in front of the gateway.
///
/// The id is required. A missing or unrecognized tier never fails the request; it only
/// lowers the principal to `Tier::LOWEST`.
#[derive(Clone, Debug)]
pub struct AuthenticatedPrincipal(pub Principal);

impl<S> FromRequestParts<S> for AuthenticatedPrincipal
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let id = header(PRINCIPAL_ID_HEADER).ok_or_else(|| {
            Error::new(ErrorDetails::PrincipalMissing {
                message: format!("missing `{PRINCIPAL_ID_HEADER}` header"),
            })
        })?;
        let principal = match header(PRINCIPAL_TIER_HEADER) {
            Some(raw_tier) => Principal::from_claims(id, raw_tier),
            None => {
                tracing::debug!(
                    principal_id = id,
                    "No tier claim; treating principal as `{}`",
                    Tier::LOWEST
                );
                Principal::new(id, Tier::LOWEST)
            }
        };
        Ok(AuthenticatedPrincipal(principal))
    }
}

#[derive(Debug, Serialize)]
pub struct FeatureListResponse {
    pub tier: Tier,
    pub features: Vec<FeatureAccessEntry>,
}

/// Every feature the catalog knows about, resolved for the caller's tier.
pub async fn list_features_handler(
    State(AppStateData { policies, .. }): AppState,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Json<FeatureListResponse> {
    let catalog = policies.load();
    Json(FeatureListResponse {
        tier: principal.tier,
        features: resolve_all(&catalog, principal.tier),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccessResponse {
    pub tier: Tier,
    pub entry: FeatureAccessEntry,
    pub usage: UsageCheckResponse,
}

/// Resolved entitlement plus where the caller stands in the current window. Consumes nothing.
pub async fn feature_access_handler(
    State(AppStateData {
        policies, quota, ..
    }): AppState,
    Path(feature_id): Path<String>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<FeatureAccessResponse>, Error> {
    let entry = resolve(&policies.load(), principal.tier, &feature_id);
    let usage = quota
        .usage_status(&principal, &feature_id, Utc::now())
        .await?;
    Ok(Json(FeatureAccessResponse {
        tier: principal.tier,
        entry,
        usage: UsageCheckResponse::from(&usage),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumeUsageParams {
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

/// Charges the caller for one use (or `cost` uses) of a feature.
pub async fn consume_usage_handler(
    State(AppStateData { quota, .. }): AppState,
    Path(feature_id): Path<String>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    StructuredJson(params): StructuredJson<ConsumeUsageParams>,
) -> Result<Response, Error> {
    let result = quota
        .check_and_consume(&principal, &feature_id, params.cost, Utc::now())
        .await?;
    let response = UsageCheckResponse::from(&result);
    Ok((response.status_code(), Json(response)).into_response())
}
