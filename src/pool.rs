//! Connection pool for function backend connections
//!
//! One pooled HTTP client is shared by every dispatch. Idle connections are
//! reused per backend address and dropped after the idle timeout. Response
//! bodies handed back to callers can be wrapped in a [`DeadlineBody`] so a
//! backend that stalls mid-stream cannot hold a connection forever.

use crate::config::ServerConfig;
use crate::error::{BoxError, GatewayBody};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tracing::debug;

/// Request body type sent to backends
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: server.pool_idle_timeout(),
            connect_timeout: server.write_timeout(),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Send a fully built request and wait for the response headers.
    /// Dropping the returned future abandons the backend call.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, PoolError> {
        Ok(self.client.request(req).await?)
    }
}

/// Error yielded when a response body outlives its deadline
#[derive(Debug, thiserror::Error)]
#[error("response body not completed within {0:?}")]
pub struct BodyTimeout(pub Duration);

/// Response body that fails once a deadline passes
pub struct DeadlineBody {
    inner: GatewayBody,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    expired: bool,
}

impl DeadlineBody {
    pub fn new(inner: GatewayBody, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            expired: false,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.expired = true;
            return Poll::Ready(Some(Err(Box::new(BodyTimeout(this.timeout)))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
