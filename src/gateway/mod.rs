//! The HTTP boundary: quota middleware, upstream proxy and server.
//!
//! Every request except `GET /health` is identified by client IP and
//! counted against the configured quota before it is forwarded. Rejections
//! and store failures are answered locally and never reach the upstream.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;

mod middleware;
mod proxy;
mod response;
mod server;

pub use middleware::{client_identifier, ClientAddr, QuotaLayer, QuotaService};
pub use proxy::UpstreamProxy;
pub use response::{
    bad_gateway, health, quota_store_unavailable, too_many_requests, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING,
};
pub use server::{GatewayServer, GatewayService};

/// Body type of every response the gateway returns.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;
