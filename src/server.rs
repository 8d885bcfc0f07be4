//! HTTP front end: invocation routes, management API and metrics endpoint

use crate::config::Config;
use crate::credential::RegistryCredential;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::{full_body, BoxError, GatewayBody, GatewayError};
use crate::function::FunctionDescriptor;
use crate::lifecycle::{AlertPayload, FunctionManager};
use crate::metrics::GatewayMetrics;
use crate::orchestrator::SharedOrchestrator;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::watcher::ReplicaReader;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest management request body accepted
const MAX_MANAGEMENT_BODY: usize = 1024 * 1024;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything a request handler needs, shared across connections
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub functions: FunctionManager,
    pub metrics: Arc<GatewayMetrics>,
    pub credential: RegistryCredential,
    /// Bearer token guarding /system/* when set
    pub admin_token: Option<String>,
}

impl GatewayState {
    /// Wire the dispatcher and lifecycle manager from configuration
    pub fn new(
        config: &Config,
        orchestrator: SharedOrchestrator,
        metrics: Arc<GatewayMetrics>,
        replicas: ReplicaReader,
        credential: RegistryCredential,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&orchestrator),
            replicas,
            Arc::clone(&metrics),
            pool,
            DispatchConfig::from_config(config),
        );
        let functions = FunctionManager::new(
            orchestrator,
            config.orchestrator.function_label.clone(),
            config.scaling.clone(),
        );

        Self {
            dispatcher,
            functions,
            metrics,
            credential,
            admin_token: config.server.admin_token.clone(),
        }
    }
}

/// Listing entry: the descriptor plus its invocation total
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionStatus {
    #[serde(flatten)]
    descriptor: FunctionDescriptor,
    invocation_count: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteFunctionRequest {
    #[serde(rename = "functionName", alias = "name")]
    function_name: String,
}

pub struct GatewayServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
    header_read_timeout: Duration,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<GatewayState>,
        shutdown_rx: watch::Receiver<bool>,
        header_read_timeout: Duration,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            header_read_timeout,
        }
    }

    /// Bind the configured address; failures surface before anything is spawned
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let header_read_timeout = self.header_read_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, state, header_read_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    header_read_timeout: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, state, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);
    builder
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, client = %client_addr, "Incoming request");

    if path.starts_with("/system/") {
        if let Some(token) = state.admin_token.as_deref() {
            if !check_auth(&req, token) {
                warn!(%path, "Unauthorized management request");
                return GatewayError::Unauthorized.into_response();
            }
        }
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "text/plain", "ok"),

        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            state.metrics.render_exposition(),
        ),
        (_, "/metrics") | (_, "/healthz") => method_not_allowed(&method),

        (&Method::GET, "/system/functions") => list_functions(&state).await,
        (&Method::POST, "/system/functions") => deploy_function(req, &state).await,
        (&Method::PUT, "/system/functions") => update_function(req, &state).await,
        (&Method::DELETE, "/system/functions") => delete_function(req, &state).await,
        (_, "/system/functions") => method_not_allowed(&method),

        (&Method::POST, "/system/alert") => handle_alert(req, &state).await,
        (_, "/system/alert") => method_not_allowed(&method),

        (_, p) if p.starts_with("/function/") => state.dispatcher.handle(req, client_addr).await,
        (&Method::POST, "/") => state.dispatcher.handle(req, client_addr).await,
        (_, "/") => method_not_allowed(&method),

        _ => GatewayError::RouteNotFound(path.clone()).into_response(),
    }
}

fn method_not_allowed(method: &Method) -> Response<GatewayBody> {
    GatewayError::MethodNotAllowed(method.to_string()).into_response()
}

/// Read and decode a bounded JSON request body
async fn read_json<B, T>(req: Request<B>) -> Result<T, GatewayError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
    T: DeserializeOwned,
{
    let body = Limited::new(req.into_body(), MAX_MANAGEMENT_BODY)
        .collect()
        .await
        .map_err(|e| GatewayError::BadRequest(format!("failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid JSON: {}", e)))
}

async fn list_functions(state: &GatewayState) -> Response<GatewayBody> {
    let functions = match state.functions.list().await {
        Ok(functions) => functions,
        Err(e) => {
            error!(error = %e, "Failed to list functions");
            return e.into_response();
        }
    };

    let statuses: Vec<FunctionStatus> = functions
        .into_iter()
        .map(|descriptor| {
            let invocation_count = state.metrics.invocation_count(&descriptor.name);
            FunctionStatus {
                descriptor,
                invocation_count,
            }
        })
        .collect();

    match serde_json::to_vec(&statuses) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => GatewayError::OrchestratorError(format!("failed to encode listing: {}", e)).into_response(),
    }
}

async fn deploy_function<B>(req: Request<B>, state: &GatewayState) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let descriptor: FunctionDescriptor = match read_json(req).await {
        Ok(descriptor) => descriptor,
        Err(e) => return e.into_response(),
    };
    let name = descriptor.name.clone();

    match state.functions.create(descriptor, &state.credential).await {
        Ok(()) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "name": name }).to_string(),
        ),
        Err(e) => {
            warn!(function = %name.escape_default(), error = %e, "Deploy failed");
            e.into_response()
        }
    }
}

async fn update_function<B>(req: Request<B>, state: &GatewayState) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let descriptor: FunctionDescriptor = match read_json(req).await {
        Ok(descriptor) => descriptor,
        Err(e) => return e.into_response(),
    };
    let name = descriptor.name.clone();

    match state.functions.update(descriptor, &state.credential).await {
        Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "name": name }).to_string()),
        Err(e) => {
            warn!(function = %name.escape_default(), error = %e, "Update failed");
            e.into_response()
        }
    }
}

async fn delete_function<B>(req: Request<B>, state: &GatewayState) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let request: DeleteFunctionRequest = match read_json(req).await {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    match state.functions.delete(&request.function_name).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "name": request.function_name }).to_string(),
        ),
        Err(e) => {
            warn!(function = %request.function_name.escape_default(), error = %e, "Delete failed");
            e.into_response()
        }
    }
}

async fn handle_alert<B>(req: Request<B>, state: &GatewayState) -> Response<GatewayBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let payload: AlertPayload = match read_json(req).await {
        Ok(payload) => payload,
        Err(e) => return e.into_response(),
    };
    info!(status = %payload.status, alerts = payload.alerts.len(), "Received alert");

    let outcomes = state.functions.scale_from_alerts(&payload).await;
    let body = serde_json::json!({
        "status": payload.status,
        "scaled": outcomes,
    });
    json_response(StatusCode::OK, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalingConfig;
    use crate::error::X_GATEWAY_ERROR;
    use crate::orchestrator::memory::InMemoryOrchestrator;
    use crate::watcher::ReplicaWatcher;
    use http_body_util::Full;

    fn state(admin_token: Option<&str>) -> (Arc<InMemoryOrchestrator>, Arc<GatewayState>) {
        let orchestrator = Arc::new(InMemoryOrchestrator::new("http://127.0.0.1:1"));
        let metrics = Arc::new(GatewayMetrics::new());
        let watcher = ReplicaWatcher::new(
            orchestrator.clone(),
            Arc::clone(&metrics),
            "function",
            Duration::from_secs(5),
        );
        let dispatcher = Dispatcher::new(
            orchestrator.clone(),
            watcher.reader(),
            Arc::clone(&metrics),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            DispatchConfig {
                read_timeout: Duration::from_secs(1),
                write_timeout: Duration::from_secs(1),
                freshness: Duration::from_secs(10),
                function_label: "function".to_string(),
            },
        );
        let state = GatewayState {
            dispatcher,
            functions: FunctionManager::new(orchestrator.clone(), "function", ScalingConfig::default()),
            metrics,
            credential: RegistryCredential::empty(),
            admin_token: admin_token.map(String::from),
        };
        (orchestrator, Arc::new(state))
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(state: &Arc<GatewayState>, req: Request<Full<Bytes>>) -> (StatusCode, String) {
        let response = handle_request(req, Arc::clone(state), "127.0.0.1:4000".parse().unwrap()).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn test_check_auth() {
        let mut req = request(Method::GET, "/system/functions", "");
        assert!(!check_auth(&req, "secret"));

        req.headers_mut()
            .insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(check_auth(&req, "secret"));
        assert!(!check_auth(&req, "other"));

        req.headers_mut()
            .insert(AUTHORIZATION, "secret".parse().unwrap());
        assert!(!check_auth(&req, "secret"));
    }

    #[tokio::test]
    async fn test_deploy_list_delete() {
        let (_orchestrator, state) = state(None);

        let (status, _) = call(
            &state,
            request(Method::POST, "/system/functions", r#"{"service":"echo","image":"echo:latest","envVars":{"fprocess":"cat"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&state, request(Method::GET, "/system/functions", "")).await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed[0]["name"], "echo");
        assert_eq!(listed[0]["image"], "echo:latest");
        assert_eq!(listed[0]["envVars"]["fprocess"], "cat");
        assert_eq!(listed[0]["replicas"], 1);
        assert_eq!(listed[0]["invocationCount"], 0);

        let (status, _) = call(
            &state,
            request(Method::DELETE, "/system/functions", r#"{"functionName":"echo"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&state, request(Method::GET, "/system/functions", "")).await;
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_deploy_errors() {
        let (orchestrator, state) = state(None);

        let (status, body) = call(
            &state,
            request(Method::POST, "/system/functions", r#"{"service":"bad name!","image":"x"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("BAD_REQUEST"));
        assert_eq!(orchestrator.call_count(), 0);

        let (status, _) = call(&state, request(Method::POST, "/system/functions", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let deploy = r#"{"name":"echo","image":"echo:latest"}"#;
        call(&state, request(Method::POST, "/system/functions", deploy)).await;
        let (status, body) = call(&state, request(Method::POST, "/system/functions", deploy)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("SERVICE_CONFLICT"));

        orchestrator.set_failing(true);
        let (status, _) = call(
            &state,
            request(Method::POST, "/system/functions", r#"{"name":"other","image":"x"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown() {
        let (_orchestrator, state) = state(None);

        let (status, _) = call(
            &state,
            request(Method::PUT, "/system/functions", r#"{"name":"ghost","image":"x"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &state,
            request(Method::DELETE, "/system/functions", r#"{"functionName":"ghost"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("FUNCTION_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_management_requires_token_when_configured() {
        let (_orchestrator, state) = state(Some("secret"));

        let response = handle_request(
            request(Method::GET, "/system/functions", ""),
            Arc::clone(&state),
            "127.0.0.1:4000".parse().unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(X_GATEWAY_ERROR).unwrap(), "UNAUTHORIZED");

        let mut req = request(Method::GET, "/system/functions", "");
        req.headers_mut()
            .insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);

        // Metrics stay public
        let (status, _) = call(&state, request(Method::GET, "/metrics", "")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_alert_endpoint() {
        let (orchestrator, state) = state(None);
        call(
            &state,
            request(Method::POST, "/system/functions", r#"{"name":"echo","image":"echo:latest"}"#),
        )
        .await;

        let alert = r#"{"status":"firing","alerts":[{"status":"firing","labels":{"alertname":"APIHighInvocationRate","function_name":"echo"}}]}"#;
        let (status, body) = call(&state, request(Method::POST, "/system/alert", alert)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"replicas\":6"));
        assert_eq!(orchestrator.service("echo").unwrap().desired_replicas, 6);

        for malformed in ["[]", "{}", r#"{"status":"firing"}"#, "not json"] {
            let (status, _) = call(&state, request(Method::POST, "/system/alert", malformed)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "payload {malformed}");
        }
        assert_eq!(orchestrator.service("echo").unwrap().desired_replicas, 6);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_orchestrator, state) = state(None);
        state.metrics.set_replica_gauge("echo", 2);

        let response = handle_request(
            request(Method::GET, "/metrics", ""),
            Arc::clone(&state),
            "127.0.0.1:4000".parse().unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), PROMETHEUS_CONTENT_TYPE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("gateway_service_count"));
    }

    #[tokio::test]
    async fn test_routing_fallbacks() {
        let (_orchestrator, state) = state(None);

        let (status, _) = call(&state, request(Method::GET, "/healthz", "")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, request(Method::GET, "/nope", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("ROUTE_NOT_FOUND"));

        let (status, _) = call(&state, request(Method::PATCH, "/system/functions", "")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _) = call(&state, request(Method::GET, "/", "")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, body) = call(&state, request(Method::POST, "/", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("X-Function"));

        let (status, _) = call(&state, request(Method::GET, "/function/ghost", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_when_shutdown_sender_dropped() {
        let (_orchestrator, state) = state(None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = GatewayServer::new(
            listener.local_addr().unwrap(),
            state,
            shutdown_rx,
            Duration::from_secs(1),
        );

        let handle = tokio::spawn(server.serve(listener));
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let (_orchestrator, state) = state(None);
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = GatewayServer::new(
            taken.local_addr().unwrap(),
            state,
            shutdown_rx,
            Duration::from_secs(1),
        );

        let err = server.bind().await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to bind"));
    }
}
