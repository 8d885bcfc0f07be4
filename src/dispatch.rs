//! Function invocation routing
//!
//! A request names its function either in the path (`/function/{name}`, with
//! or without a trailing slash) or, on the bare root path, in the
//! `X-Function` header. The name is resolved to a backend address from the
//! replica watcher's snapshot when the entry is fresh, and from the
//! orchestrator otherwise. The request is then proxied through the shared
//! connection pool.
//!
//! Timeouts:
//! - `write_timeout` bounds sending the request until response headers arrive
//! - `read_timeout` bounds streaming the response body back
//!
//! Every dispatch records exactly one invocation outcome, including
//! dispatches whose future is dropped because the caller went away. Outcomes
//! are labelled with the function name only once the name is known to be a
//! function; everything else is counted under [`UNKNOWN_FUNCTION`].

use crate::config::Config;
use crate::error::{BoxError, GatewayBody, GatewayError};
use crate::function::validate_name;
use crate::metrics::{GatewayMetrics, InvocationOutcome, UNKNOWN_FUNCTION};
use crate::orchestrator::SharedOrchestrator;
use crate::pool::{ConnectionPool, DeadlineBody, ProxyBody};
use crate::watcher::ReplicaReader;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header naming the function on the root invocation path
pub const X_FUNCTION: &str = "x-function";
/// Response header carrying the dispatch latency
pub const X_DURATION_SECONDS: &str = "x-duration-seconds";
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

const FUNCTION_PATH_PREFIX: &str = "/function/";

/// Status recorded when the caller disconnects before a response is produced
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Connection-management headers that must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Maximum snapshot age served without re-resolving
    pub freshness: Duration,
    pub function_label: String,
}

impl DispatchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_timeout: config.server.read_timeout(),
            write_timeout: config.server.write_timeout(),
            freshness: config.watcher.freshness(),
            function_label: config.orchestrator.function_label.clone(),
        }
    }
}

/// Where an invocation is sent
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTarget {
    pub function_name: String,
    pub backend_address: String,
    pub last_resolved: Instant,
}

/// Pull the function name out of an invocation request
pub fn extract_function_name<B>(req: &Request<B>) -> Result<String, GatewayError> {
    let path = req.uri().path();

    if let Some(rest) = path.strip_prefix(FUNCTION_PATH_PREFIX) {
        let name = rest.strip_suffix('/').unwrap_or(rest);
        return validate_name(name)
            .map(str::to_string)
            .map_err(GatewayError::BadRequest);
    }

    if path == "/" {
        let header = req
            .headers()
            .get(X_FUNCTION)
            .ok_or_else(|| GatewayError::BadRequest("missing X-Function header".to_string()))?;
        let name = header
            .to_str()
            .map_err(|_| GatewayError::BadRequest("X-Function header is not valid text".to_string()))?;
        return validate_name(name.trim())
            .map(str::to_string)
            .map_err(GatewayError::BadRequest);
    }

    Err(GatewayError::RouteNotFound(path.to_string()))
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Records one invocation outcome when dropped
struct OutcomeGuard {
    metrics: Arc<GatewayMetrics>,
    function_name: String,
    started: Instant,
    status: Option<u16>,
}

impl OutcomeGuard {
    fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            metrics,
            function_name: UNKNOWN_FUNCTION.to_string(),
            started: Instant::now(),
            status: None,
        }
    }

    /// Attribute the outcome to a name known to be a function
    fn identify(&mut self, function_name: &str) {
        self.function_name = function_name.to_string();
    }

    fn complete(&mut self, status: u16) -> Duration {
        self.status = Some(status);
        self.started.elapsed()
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        let status = self.status.unwrap_or(CLIENT_CLOSED_REQUEST);
        if self.status.is_none() {
            debug!(function = %self.function_name, "Dispatch abandoned before completion");
        }
        self.metrics.record_invocation(&InvocationOutcome {
            function_name: std::mem::take(&mut self.function_name),
            status,
            latency: self.started.elapsed(),
        });
    }
}

pub struct Dispatcher {
    orchestrator: SharedOrchestrator,
    replicas: ReplicaReader,
    metrics: Arc<GatewayMetrics>,
    pool: Arc<ConnectionPool>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        orchestrator: SharedOrchestrator,
        replicas: ReplicaReader,
        metrics: Arc<GatewayMetrics>,
        pool: Arc<ConnectionPool>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            orchestrator,
            replicas,
            metrics,
            pool,
            config,
        }
    }

    /// Extract the function name and dispatch. Requests without a usable
    /// name are rejected before dispatch and record no invocation.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let extracted = extract_function_name(&req);
        match extracted {
            Ok(name) => self.dispatch(&name, req, client_addr).await,
            Err(e) => {
                debug!(path = %req.uri().path(), error = %e, "Rejected invocation");
                e.into_response()
            }
        }
    }

    /// Resolve, proxy and record one invocation of `function_name`
    pub async fn dispatch<B>(
        &self,
        function_name: &str,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut guard = OutcomeGuard::new(Arc::clone(&self.metrics));
        if self.replicas.snapshot().get(function_name).is_some() {
            guard.identify(function_name);
        }

        let result = match self.resolve(function_name).await {
            Ok(target) => {
                guard.identify(function_name);
                self.forward(&target, req, client_addr).await
            }
            Err(e) => Err(e),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(function = function_name, error = %e, "Invocation failed");
                e.into_response()
            }
        };

        let elapsed = guard.complete(response.status().as_u16());
        if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
            response.headers_mut().insert(X_DURATION_SECONDS, value);
        }
        debug!(
            function = function_name,
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Invocation dispatched"
        );
        response
    }

    /// Resolve a function name to its backend.
    ///
    /// A snapshot entry younger than the freshness threshold is used as is.
    /// Otherwise the orchestrator is asked directly; if that call fails, a
    /// stale snapshot entry is still preferred over an error.
    pub async fn resolve(&self, function_name: &str) -> Result<RouteTarget, GatewayError> {
        let snapshot = self.replicas.snapshot();
        let cached = snapshot.get(function_name);

        if let Some(entry) = cached {
            if entry.age() <= self.config.freshness {
                return Ok(RouteTarget {
                    function_name: function_name.to_string(),
                    backend_address: entry.backend_address.clone(),
                    last_resolved: entry.last_updated,
                });
            }
        }

        match self.orchestrator.get_service(function_name).await {
            Ok(Some(service)) if service.is_function(&self.config.function_label) => {
                Ok(RouteTarget {
                    function_name: function_name.to_string(),
                    backend_address: service.backend_address,
                    last_resolved: Instant::now(),
                })
            }
            Ok(_) => Err(GatewayError::FunctionNotFound(function_name.to_string())),
            Err(e) => match cached {
                Some(entry) => {
                    warn!(
                        function = function_name,
                        error = %e,
                        age_secs = entry.age().as_secs(),
                        "Orchestrator lookup failed, using stale route"
                    );
                    Ok(RouteTarget {
                        function_name: function_name.to_string(),
                        backend_address: entry.backend_address.clone(),
                        last_resolved: entry.last_updated,
                    })
                }
                None => Err(GatewayError::from(e)),
            },
        }
    }

    async fn forward<B>(
        &self,
        target: &RouteTarget,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let function_name = target.function_name.as_str();
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let backend_req = build_backend_request(target, req, client_addr, &request_id)?;

        let result = tokio::time::timeout(
            self.config.write_timeout,
            self.pool.send_request(backend_req),
        )
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(GatewayError::UpstreamUnreachable {
                    function: function_name.to_string(),
                    detail: e.to_string(),
                });
            }
            Err(_) => {
                return Err(GatewayError::UpstreamTimeout {
                    function: function_name.to_string(),
                    timeout: self.config.write_timeout,
                });
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(X_REQUEST_ID) {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                parts.headers.insert(X_REQUEST_ID, value);
            }
        }

        let body = DeadlineBody::new(body.map_err(BoxError::from).boxed(), self.config.read_timeout);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn build_backend_request<B>(
    target: &RouteTarget,
    req: Request<B>,
    client_addr: SocketAddr,
    request_id: &str,
) -> Result<Request<ProxyBody>, GatewayError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();

    let uri = match parts.uri.query() {
        Some(query) => format!("{}/?{}", target.backend_address.trim_end_matches('/'), query),
        None => format!("{}/", target.backend_address.trim_end_matches('/')),
    };

    let mut headers = parts.headers;
    let original_host = headers.remove(HOST);
    strip_hop_by_hop(&mut headers);

    // Overwrite rather than append so callers cannot spoof the chain
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    let body: ProxyBody = body.map_err(Into::into).boxed_unsync();
    let mut backend_req = Request::builder()
        .method(parts.method)
        .uri(&uri)
        .body(body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid backend request: {}", e)))?;
    *backend_req.headers_mut() = headers;

    Ok(backend_req)
}
