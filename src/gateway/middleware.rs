//! Per-client quota enforcement as a tower middleware.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use tower::{Layer, Service};
use tracing::{debug, error, instrument};

use super::response::{quota_store_unavailable, too_many_requests, with_quota_headers};
use super::GatewayBody;
use crate::quota::{Decision, FailPolicy, Limiter};

/// Identifier used when a request carries no usable address.
const UNKNOWN_CLIENT: &str = "unknown";

/// Peer address of the connection a request arrived on.
///
/// The server inserts this as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Applies the quota to every request passing through.
#[derive(Clone)]
pub struct QuotaLayer {
    limiter: Arc<Limiter>,
    fail_policy: FailPolicy,
    trust_forwarded_headers: bool,
}

impl QuotaLayer {
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self {
            limiter,
            fail_policy: FailPolicy::default(),
            trust_forwarded_headers: false,
        }
    }

    /// Choose what happens when the store cannot answer.
    pub fn with_fail_policy(mut self, fail_policy: FailPolicy) -> Self {
        self.fail_policy = fail_policy;
        self
    }

    /// Identify clients by `X-Forwarded-For` / `X-Real-IP` when present.
    pub fn with_trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        QuotaService {
            inner,
            limiter: Arc::clone(&self.limiter),
            fail_policy: self.fail_policy,
            trust_forwarded_headers: self.trust_forwarded_headers,
        }
    }
}

/// Service produced by [`QuotaLayer`].
///
/// Admitted requests go to the inner service; rejected ones get a `429`
/// and a store failure under fail-closed policy gets a `500`. Neither of
/// the short-circuit responses reaches the inner service.
#[derive(Clone)]
pub struct QuotaService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    fail_policy: FailPolicy,
    trust_forwarded_headers: bool,
}

impl<S, B> Service<Request<B>> for QuotaService<S>
where
    S: Service<Request<B>, Response = Response<GatewayBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<GatewayBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let fail_policy = self.fail_policy;
        let identifier = client_identifier(&req, self.trust_forwarded_headers);

        Box::pin(enforce(inner, limiter, fail_policy, identifier, req))
    }
}

#[instrument(skip(inner, limiter, fail_policy, req), fields(method = %req.method(), path = %req.uri().path()))]
async fn enforce<S, B>(
    mut inner: S,
    limiter: Arc<Limiter>,
    fail_policy: FailPolicy,
    identifier: String,
    req: Request<B>,
) -> Result<Response<GatewayBody>, S::Error>
where
    S: Service<Request<B>, Response = Response<GatewayBody>>,
{
    match Decision::from_outcome(limiter.check(&identifier).await, fail_policy) {
        Decision::Admit(result) => {
            let response = inner.call(req).await?;
            Ok(match result {
                Some(result) => with_quota_headers(response, &result),
                None => response,
            })
        }
        Decision::Reject(result) => {
            debug!(
                count = result.count,
                limit = result.limit,
                strategy = limiter.strategy_name(),
                "Rejecting request over quota"
            );
            Ok(too_many_requests(&result))
        }
        Decision::Indeterminate(err) => {
            error!(error = %err, kind = err.kind(), "Quota check failed");
            Ok(quota_store_unavailable())
        }
    }
}

/// Quota identifier for a request: the client IP.
pub fn client_identifier<B>(req: &Request<B>, trust_forwarded_headers: bool) -> String {
    if trust_forwarded_headers {
        if let Some(forwarded) = forwarded_client(req.headers()) {
            return forwarded;
        }
    }

    req.extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Client address reported by the proxy in front of the gateway.
///
/// The rightmost `X-Forwarded-For` hop is the one that proxy appended; hops
/// further left are client-supplied. Values that are not IP addresses are
/// skipped.
fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect();

    hops.into_iter()
        .rev()
        .find_map(parse_ip)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_ip)
        })
        .map(|ip| ip.to_string())
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use crate::gateway::response::{full_body, X_RATELIMIT_REMAINING};
    use crate::quota::{resolve, Clock, ManualClock, Mode, QuotaPolicy};
    use crate::store::{AtomicStore, MemoryStore, Transaction};
    use async_trait::async_trait;
    use http::StatusCode;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn memory_limiter(limit: u64) -> Arc<Limiter> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Arc::new(resolve(
            Mode::Sliding,
            QuotaPolicy::new(limit, 60).unwrap(),
            Duration::from_millis(100),
            store,
            clock,
        ))
    }

    struct BrokenStore;

    #[async_trait]
    impl AtomicStore for BrokenStore {
        async fn execute(&self, _transaction: &Transaction) -> Result<i64, QuotaError> {
            Err(QuotaError::StoreUnavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), QuotaError> {
            Err(QuotaError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn broken_limiter() -> Arc<Limiter> {
        Arc::new(resolve(
            Mode::Fixed,
            QuotaPolicy::new(1, 60).unwrap(),
            Duration::from_millis(100),
            Arc::new(BrokenStore),
            Arc::new(ManualClock::new(0)),
        ))
    }

    /// Inner service that counts how often it was reached.
    fn counting_inner(
        hits: Arc<AtomicUsize>,
    ) -> impl Service<
        Request<()>,
        Response = Response<GatewayBody>,
        Error = Infallible,
        Future = impl Send + 'static,
    > + Clone
    + Send
    + 'static {
        tower::service_fn(move |_req: Request<()>| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(full_body("downstream")))
            }
        })
    }

    fn request_from(ip: [u8; 4]) -> Request<()> {
        let mut req = Request::new(());
        req.extensions_mut()
            .insert(ClientAddr(SocketAddr::from((ip, 40000))));
        req
    }

    #[tokio::test]
    async fn test_admits_until_limit_then_rejects() {
        let hits = Arc::new(AtomicUsize::new(0));
        let service = QuotaLayer::new(memory_limiter(2)).layer(counting_inner(hits.clone()));

        let first = service.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_RATELIMIT_REMAINING], "1");

        let second = service.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let third = service.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let other = service.oneshot(request_from([10, 0, 0, 2])).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_failure_fail_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let service = QuotaLayer::new(broken_limiter()).layer(counting_inner(hits.clone()));

        let response = service.oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fail_open() {
        let hits = Arc::new(AtomicUsize::new(0));
        let service = QuotaLayer::new(broken_limiter())
            .with_fail_policy(FailPolicy::Open)
            .layer(counting_inner(hits.clone()));

        let response = service.oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_REMAINING).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identifier_from_peer_address() {
        let req = request_from([192, 168, 1, 9]);
        assert_eq!(client_identifier(&req, false), "192.168.1.9");
        assert_eq!(client_identifier(&Request::new(()), false), "unknown");
    }

    #[test]
    fn test_forwarded_headers_only_when_trusted() {
        let mut req = request_from([10, 0, 0, 1]);
        req.headers_mut()
            .insert("x-forwarded-for", "198.51.100.20, 203.0.113.7".parse().unwrap());

        assert_eq!(client_identifier(&req, false), "10.0.0.1");
        assert_eq!(client_identifier(&req, true), "203.0.113.7");

        let mut req = request_from([10, 0, 0, 1]);
        req.headers_mut()
            .insert("x-real-ip", "198.51.100.4".parse().unwrap());
        assert_eq!(client_identifier(&req, true), "198.51.100.4");
    }

    #[test]
    fn test_spoofed_forwarded_hops_do_not_change_identifier() {
        // The fronting proxy appends the real client after whatever it sent.
        let mut first = request_from([10, 0, 0, 1]);
        first
            .headers_mut()
            .insert("x-forwarded-for", "1.1.1.1, 203.0.113.7".parse().unwrap());
        let mut second = request_from([10, 0, 0, 1]);
        second
            .headers_mut()
            .insert("x-forwarded-for", "2.2.2.2, 203.0.113.7".parse().unwrap());

        assert_eq!(client_identifier(&first, true), "203.0.113.7");
        assert_eq!(client_identifier(&second, true), "203.0.113.7");
    }

    #[test]
    fn test_non_ip_forwarded_values_are_ignored() {
        let mut req = request_from([10, 0, 0, 1]);
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.7, not-an-ip".parse().unwrap());
        assert_eq!(client_identifier(&req, true), "203.0.113.7");

        let mut req = request_from([10, 0, 0, 1]);
        req.headers_mut()
            .insert("x-forwarded-for", "random-token-42".parse().unwrap());
        req.headers_mut()
            .insert("x-real-ip", "garbage".parse().unwrap());
        assert_eq!(client_identifier(&req, true), "10.0.0.1");
    }
}
