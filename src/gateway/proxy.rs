//! Forwarding admitted requests to the upstream.

use std::convert::Infallible;
use std::fmt;
use std::net::IpAddr;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{
    HeaderName, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Request, Response, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::{debug, warn};

use super::middleware::ClientAddr;
use super::response::bad_gateway;
use super::GatewayBody;
use crate::error::{Result, TurnstileError};

type HttpClient = Client<HttpConnector, Incoming>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe one connection and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Append `client` to `X-Forwarded-For`, folding any existing values into
/// one comma-separated header.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let mut hops: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    hops.push(client.to_string());

    if let Ok(value) = HeaderValue::from_str(&hops.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Reverse proxy to a single plain-HTTP upstream.
///
/// The client pools connections, so clones share them.
#[derive(Clone)]
pub struct UpstreamProxy {
    client: HttpClient,
    authority: Authority,
    base_path: String,
}

impl UpstreamProxy {
    pub fn new(upstream: &Uri) -> Result<Self> {
        if upstream.scheme() != Some(&Scheme::HTTP) {
            return Err(TurnstileError::Config(format!(
                "Upstream {upstream} must use http://"
            )));
        }
        let authority = upstream
            .authority()
            .cloned()
            .ok_or_else(|| TurnstileError::Config(format!("Upstream {upstream} has no host")))?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            client,
            authority,
            base_path: upstream.path().trim_end_matches('/').to_string(),
        })
    }

    /// Where a request for `path_and_query` is sent.
    pub fn target_uri(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri> {
        let suffix = path_and_query.map(PathAndQuery::as_str).unwrap_or("/");
        let joined = format!("{}{}", self.base_path, suffix);

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(joined)
            .build()
            .map_err(|e| TurnstileError::Http(format!("Invalid upstream URI: {e}")))
    }

    /// Forward one request. Transport failures become a `502`.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<GatewayBody> {
        let (mut parts, body) = req.into_parts();

        parts.uri = match self.target_uri(parts.uri.path_and_query()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "Could not build upstream request");
                return bad_gateway();
            }
        };
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        if let Some(ClientAddr(peer)) = parts.extensions.get::<ClientAddr>().copied() {
            append_forwarded_for(&mut parts.headers, peer.ip());
        }
        if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
            parts.headers.insert(HOST, host);
        }

        debug!(uri = %parts.uri, method = %parts.method, "Forwarding request");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(mut resp) => {
                strip_hop_by_hop(resp.headers_mut());
                resp.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(upstream = %self.authority, error = %e, "Upstream request failed");
                bad_gateway()
            }
        }
    }
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("authority", &self.authority)
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl Service<Request<Incoming>> for UpstreamProxy {
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.forward(req).await) })
    }
}
