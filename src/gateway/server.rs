//! HTTP server for the quota gateway.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, info, warn};

use super::middleware::{ClientAddr, QuotaLayer, QuotaService};
use super::proxy::UpstreamProxy;
use super::response::health;
use super::GatewayBody;
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::quota::{FailPolicy, Limiter};

const HEALTH_PATH: &str = "/health";

/// Routes health checks locally and everything else through the quota.
#[derive(Clone)]
pub struct GatewayService {
    upstream: QuotaService<UpstreamProxy>,
}

impl GatewayService {
    pub fn new(upstream: QuotaService<UpstreamProxy>) -> Self {
        Self { upstream }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        if req.method() == Method::GET && req.uri().path() == HEALTH_PATH {
            return Box::pin(async { Ok(health()) });
        }
        Box::pin(self.upstream.clone().oneshot(req))
    }
}

/// HTTP server for the quota gateway.
pub struct GatewayServer {
    service: GatewayService,
}

impl GatewayServer {
    pub fn new(
        limiter: Arc<Limiter>,
        fail_policy: FailPolicy,
        trust_forwarded_headers: bool,
        upstream: UpstreamProxy,
    ) -> Self {
        let quota = QuotaLayer::new(limiter)
            .with_fail_policy(fail_policy)
            .with_trust_forwarded_headers(trust_forwarded_headers);

        Self {
            service: GatewayService::new(quota.layer(upstream)),
        }
    }

    /// Create a server from validated configuration.
    pub fn from_config(config: &TurnstileConfig, limiter: Arc<Limiter>) -> Result<Self> {
        let upstream = UpstreamProxy::new(&config.upstream_uri()?)?;
        Ok(Self::new(
            limiter,
            config.quota.fail_policy,
            config.server.trust_forwarded_headers,
            upstream,
        ))
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Starting quota gateway");

        let builder = ConnBuilder::new(TokioExecutor::new());
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "Accepted connection");

                    let service = self.service.clone();
                    let builder = builder.clone();
                    tokio::spawn(async move {
                        let svc = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                            req.extensions_mut().insert(ClientAddr(peer));
                            service.clone().oneshot(req)
                        });

                        if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                            warn!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
