//! Responses the gateway produces itself.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::json;

use super::GatewayBody;
use crate::quota::QuotaResult;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<GatewayBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Attach the quota headers to any response.
pub(crate) fn with_quota_headers<B>(mut response: Response<B>, result: &QuotaResult) -> Response<B> {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining()));
    response
}

/// `429` carrying the configured limit and window.
pub fn too_many_requests(result: &QuotaResult) -> Response<GatewayBody> {
    let response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        json!({
            "error": "Too many requests",
            "limit": result.limit,
            "window_seconds": result.window_secs,
        }),
    );
    with_quota_headers(response, result)
}

/// `500` for a quota check that could not be decided.
pub fn quota_store_unavailable() -> Response<GatewayBody> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "quota store unavailable" }),
    )
}

/// `502` when the upstream cannot be reached.
pub fn bad_gateway() -> Response<GatewayBody> {
    json_response(StatusCode::BAD_GATEWAY, json!({ "error": "bad gateway" }))
}

pub fn health() -> Response<GatewayBody> {
    json_response(StatusCode::OK, json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaPolicy;

    async fn body_json(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_too_many_requests_body() {
        let result = QuotaPolicy::new(3, 60).unwrap().evaluate(4);
        let response = too_many_requests(&result);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "3");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Too many requests", "limit": 3, "window_seconds": 60 })
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_distinct_from_rejection() {
        let response = quota_store_unavailable();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "quota store unavailable");
    }
}
