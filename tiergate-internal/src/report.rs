use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::policy::AccessLevel;
use crate::quota::{DecisionBasis, UsageCheckResult};
use crate::rate_limit::{B2bRateLimitResult, KeyRejection};

const SECONDS_PER_DAY: u64 = 86_400;

/// Formats `duration` as an ISO-8601 duration: `PT23H59M59S`, `P1DT2H`, `PT0.25S`.
///
/// Days are always 24 hours here; counter windows are UTC so there is no DST to account for.
pub fn format_iso8601_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let days = total_secs / SECONDS_PER_DAY;
    let hours = (total_secs % SECONDS_PER_DAY) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours == 0 && minutes == 0 && seconds == 0 && millis == 0 {
        if days == 0 {
            out.push_str("T0S");
        }
        return out;
    }
    out.push('T');
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if millis > 0 {
        let fraction = format!("{millis:03}");
        out.push_str(&format!("{seconds}.{}S", fraction.trim_end_matches('0')));
    } else if seconds > 0 {
        out.push_str(&format!("{seconds}S"));
    }
    out
}

/// Short form for people: the two most significant units, e.g. `5h 3m`, `1d 2h`, `45s`.
pub fn format_human_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let units = [
        (total_secs / SECONDS_PER_DAY, "d"),
        ((total_secs % SECONDS_PER_DAY) / 3600, "h"),
        ((total_secs % 3600) / 60, "m"),
        (total_secs % 60, "s"),
    ];
    let parts: Vec<String> = units
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .take(2)
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

/// Machine-readable reason attached to every denial, so callers can message each case
/// differently.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    KeyUnknown,
    KeySuspended,
    KeyRevoked,
    QuotaExceeded,
    FeatureLocked,
    UsageUnavailable,
}

impl ErrorCode {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorCode::RateLimited | ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::KeyUnknown => StatusCode::UNAUTHORIZED,
            ErrorCode::KeySuspended | ErrorCode::KeyRevoked | ErrorCode::FeatureLocked => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::UsageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::KeyUnknown => "Invalid API key",
            ErrorCode::KeySuspended => "API key is suspended",
            ErrorCode::KeyRevoked => "API key has been revoked",
            ErrorCode::QuotaExceeded => "Usage quota exceeded for this period",
            ErrorCode::FeatureLocked => "Feature is not available on your plan",
            ErrorCode::UsageUnavailable => "Usage could not be verified; try again shortly",
        }
    }

    /// `None` when the decision allowed the request.
    pub fn for_usage(result: &UsageCheckResult) -> Option<ErrorCode> {
        if result.allowed {
            return None;
        }
        Some(match result.basis {
            DecisionBasis::NoAccess => ErrorCode::FeatureLocked,
            DecisionBasis::StoreFailClosed => ErrorCode::UsageUnavailable,
            DecisionBasis::Counted | DecisionBasis::Unmetered | DecisionBasis::StoreFailOpen => {
                ErrorCode::QuotaExceeded
            }
        })
    }

    pub fn for_rate_limit(result: &B2bRateLimitResult) -> Option<ErrorCode> {
        if result.allowed {
            return None;
        }
        Some(match result.basis {
            DecisionBasis::StoreFailClosed => ErrorCode::UsageUnavailable,
            _ => ErrorCode::RateLimited,
        })
    }
}

impl From<KeyRejection> for ErrorCode {
    fn from(rejection: KeyRejection) -> Self {
        match rejection {
            KeyRejection::Unknown => ErrorCode::KeyUnknown,
            KeyRejection::Suspended => ErrorCode::KeySuspended,
            KeyRejection::Revoked => ErrorCode::KeyRevoked,
        }
    }
}

/// Caller-facing form of a consumer feature decision.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCheckResponse {
    pub feature_id: String,
    pub allowed: bool,
    /// `-1` when the feature is not metered
    pub remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    pub access: AccessLevel,
    pub blurred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl From<&UsageCheckResult> for UsageCheckResponse {
    fn from(result: &UsageCheckResult) -> Self {
        Self {
            feature_id: result.feature_id.clone(),
            allowed: result.allowed,
            remaining: result.remaining.to_raw(),
            reset_in: result.reset_in.map(format_iso8601_duration),
            reset_in_human: result.reset_in.map(format_human_duration),
            reset_at: result.reset_at,
            limit: result.limit.map(|limit| limit.to_raw()),
            access: result.access,
            blurred: result.blurred,
            error_code: ErrorCode::for_usage(result),
        }
    }
}

impl UsageCheckResponse {
    pub fn status_code(&self) -> StatusCode {
        self.error_code
            .map_or(StatusCode::OK, |code| code.status_code())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct B2bRateLimitResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub limit: u64,
}

impl From<&B2bRateLimitResult> for B2bRateLimitResponse {
    fn from(result: &B2bRateLimitResult) -> Self {
        Self {
            allowed: result.allowed,
            remaining: result.remaining,
            reset_at: result.reset_at,
            limit: result.limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMeta {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl From<&B2bRateLimitResult> for RateLimitMeta {
    fn from(result: &B2bRateLimitResult) -> Self {
        Self {
            remaining: result.remaining,
            limit: result.limit,
            reset_at: result.reset_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitMeta>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Envelope every B2B response is wrapped in.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub meta: ResponseMeta,
}

impl<T> ApiEnvelope<T> {
    fn meta(now: DateTime<Utc>, rate_limit: Option<&B2bRateLimitResult>) -> ResponseMeta {
        ResponseMeta {
            request_id: Uuid::now_v7(),
            timestamp: now,
            cached: false,
            rate_limit: rate_limit.map(RateLimitMeta::from),
        }
    }

    pub fn success(data: T, now: DateTime<Utc>, rate_limit: Option<&B2bRateLimitResult>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Self::meta(now, rate_limit),
        }
    }

    pub fn failure(
        code: ErrorCode,
        now: DateTime<Utc>,
        rate_limit: Option<&B2bRateLimitResult>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code,
                message: code.message().to_string(),
            }),
            meta: Self::meta(now, rate_limit),
        }
    }
}

/// Standard rate limit response headers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the governing window resets
    pub reset: i64,
    /// Seconds to wait, only set on denials
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_result(result: &B2bRateLimitResult, now: DateTime<Utc>) -> Self {
        let retry_after = (!result.allowed).then(|| {
            // Round up so a client that waits exactly this long lands in the next window
            let millis = (result.reset_at - now).num_milliseconds().max(0);
            u64::try_from((millis + 999) / 1000).unwrap_or(0)
        });
        Self {
            limit: result.limit,
            remaining: result.remaining,
            reset: result.reset_at.timestamp(),
            retry_after,
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers always produce valid header values
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Limit;
    use crate::quota::Remaining;
    use crate::rate_limit::RateWindow;
    use crate::testing::at;
    use serde_json::json;

    #[test]
    fn test_format_iso8601_duration() {
        assert_eq!(format_iso8601_duration(Duration::ZERO), "PT0S");
        assert_eq!(
            format_iso8601_duration(Duration::from_secs(23 * 3600 + 59 * 60 + 59)),
            "PT23H59M59S"
        );
        assert_eq!(format_iso8601_duration(Duration::from_secs(30)), "PT30S");
        assert_eq!(
            format_iso8601_duration(Duration::from_secs(26 * 3600)),
            "P1DT2H"
        );
        assert_eq!(format_iso8601_duration(Duration::from_secs(86_400)), "P1D");
        assert_eq!(format_iso8601_duration(Duration::from_millis(250)), "PT0.25S");
        assert_eq!(
            format_iso8601_duration(Duration::from_millis(61_500)),
            "PT1M1.5S"
        );
    }

    #[test]
    fn test_format_human_duration() {
        assert_eq!(format_human_duration(Duration::ZERO), "0s");
        assert_eq!(format_human_duration(Duration::from_secs(45)), "45s");
        assert_eq!(
            format_human_duration(Duration::from_secs(5 * 3600 + 3 * 60 + 9)),
            "5h 3m"
        );
        assert_eq!(format_human_duration(Duration::from_secs(26 * 3600)), "1d 2h");
        assert_eq!(format_human_duration(Duration::from_secs(3600 + 5)), "1h");
    }

    fn counted(allowed: bool, remaining: u64) -> UsageCheckResult {
        UsageCheckResult {
            feature_id: "player_comparison".to_string(),
            allowed,
            remaining: Remaining::Count(remaining),
            reset_in: Some(Duration::from_secs(30)),
            reset_at: Some(at(2026, 3, 15, 0, 0, 0)),
            limit: Some(Limit::Count(3)),
            access: AccessLevel::Limited,
            blurred: false,
            basis: DecisionBasis::Counted,
        }
    }

    #[test]
    fn test_usage_check_response_shape() {
        let response = UsageCheckResponse::from(&counted(false, 0));
        assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "featureId": "player_comparison",
                "allowed": false,
                "remaining": 0,
                "resetIn": "PT30S",
                "resetInHuman": "30s",
                "resetAt": "2026-03-15T00:00:00Z",
                "limit": 3,
                "access": "limited",
                "blurred": false,
                "errorCode": "QUOTA_EXCEEDED",
            })
        );

        let allowed = UsageCheckResponse::from(&counted(true, 2));
        assert_eq!(allowed.status_code(), StatusCode::OK);
        assert_eq!(allowed.error_code, None);
    }

    #[test]
    fn test_usage_error_codes() {
        let locked = UsageCheckResult {
            basis: DecisionBasis::NoAccess,
            access: AccessLevel::None,
            ..counted(false, 0)
        };
        assert_eq!(ErrorCode::for_usage(&locked), Some(ErrorCode::FeatureLocked));
        assert_eq!(
            UsageCheckResponse::from(&locked).status_code(),
            StatusCode::FORBIDDEN
        );

        let store_down = UsageCheckResult {
            basis: DecisionBasis::StoreFailClosed,
            ..counted(false, 0)
        };
        assert_eq!(
            UsageCheckResponse::from(&store_down).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let unmetered = UsageCheckResult {
            remaining: Remaining::Unbounded,
            limit: Some(Limit::Unlimited),
            basis: DecisionBasis::Unmetered,
            ..counted(true, 0)
        };
        let response = UsageCheckResponse::from(&unmetered);
        assert_eq!(response.remaining, -1);
        assert_eq!(response.limit, Some(-1));
    }

    #[test]
    fn test_key_rejection_codes() {
        assert_eq!(
            ErrorCode::from(KeyRejection::Unknown).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorCode::from(KeyRejection::Suspended).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ErrorCode::from(KeyRejection::Revoked),
            ErrorCode::KeyRevoked
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::KeySuspended).unwrap(),
            json!("KEY_SUSPENDED")
        );
    }

    fn denied_b2b() -> B2bRateLimitResult {
        B2bRateLimitResult {
            allowed: false,
            remaining: 0,
            reset_at: at(2026, 3, 14, 15, 31, 0),
            limit: 30,
            governing_window: RateWindow::Minute,
            basis: DecisionBasis::Counted,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let now = at(2026, 3, 14, 15, 30, 10);
        let envelope: ApiEnvelope<()> =
            ApiEnvelope::failure(ErrorCode::RateLimited, now, Some(&denied_b2b()));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["success"], json!(false));
        assert!(value.get("data").is_none());
        assert_eq!(
            value["error"],
            json!({"code": "RATE_LIMITED", "message": "Rate limit exceeded"})
        );
        assert_eq!(value["meta"]["timestamp"], json!("2026-03-14T15:30:10Z"));
        assert_eq!(value["meta"]["cached"], json!(false));
        assert_eq!(
            value["meta"]["rateLimit"],
            json!({"remaining": 0, "limit": 30, "resetAt": "2026-03-14T15:31:00Z"})
        );
        let request_id = value["meta"]["requestId"].as_str().unwrap();
        assert_eq!(Uuid::parse_str(request_id).unwrap().get_version_num(), 7);

        let success = ApiEnvelope::success(
            B2bRateLimitResponse::from(&denied_b2b()),
            now,
            None,
        );
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["data"]["limit"], json!(30));
        assert!(value["meta"].get("rateLimit").is_none());
    }

    #[test]
    fn test_rate_limit_headers() {
        let now = at(2026, 3, 14, 15, 30, 10);
        let headers = RateLimitHeaders::from_result(&denied_b2b(), now);
        assert_eq!(headers.retry_after, Some(50));

        let map = headers.to_header_map();
        assert_eq!(map.get("X-RateLimit-Limit").unwrap(), "30");
        assert_eq!(map.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(
            map.get("X-RateLimit-Reset").unwrap(),
            &at(2026, 3, 14, 15, 31, 0).timestamp().to_string()
        );
        assert_eq!(map.get("Retry-After").unwrap(), "50");

        let allowed = B2bRateLimitResult {
            allowed: true,
            remaining: 12,
            ..denied_b2b()
        };
        let map = RateLimitHeaders::from_result(&allowed, now).to_header_map();
        assert!(map.get("Retry-After").is_none());
    }
}
