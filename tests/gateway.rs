//! Integration tests for the gateway HTTP surface

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use swarmgate::config::Config;
use swarmgate::credential::RegistryCredential;
use swarmgate::metrics::GatewayMetrics;
use swarmgate::orchestrator::memory::InMemoryOrchestrator;
use swarmgate::orchestrator::SharedOrchestrator;
use swarmgate::server::{GatewayServer, GatewayState};
use swarmgate::watcher::ReplicaWatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Start an HTTP/1.1 backend that echoes the request body after `delay`
async fn start_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    let body = req.into_body().collect().await?.to_bytes();
                    Ok::<_, hyper::Error>(Response::new(Full::new(body)))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Address nothing is listening on
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct TestGateway {
    addr: SocketAddr,
    orchestrator: Arc<InMemoryOrchestrator>,
    watcher: Arc<ReplicaWatcher>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_gateway(default_backend: SocketAddr, admin_token: Option<&str>) -> TestGateway {
    let mut config = Config::default();
    config.server.read_timeout_secs = 2;
    config.server.write_timeout_secs = 1;
    config.server.admin_token = admin_token.map(String::from);
    config.validate().unwrap();

    let orchestrator = Arc::new(InMemoryOrchestrator::new(format!("http://{}", default_backend)));
    let shared: SharedOrchestrator = orchestrator.clone();
    let metrics = Arc::new(GatewayMetrics::new());
    let watcher = Arc::new(ReplicaWatcher::new(
        Arc::clone(&shared),
        Arc::clone(&metrics),
        config.orchestrator.function_label.clone(),
        config.watcher.interval(),
    ));
    let state = Arc::new(GatewayState::new(
        &config,
        shared,
        metrics,
        watcher.reader(),
        RegistryCredential::empty(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(addr, state, shutdown_rx, config.server.read_timeout());
    let handle = tokio::spawn(server.serve(listener));

    TestGateway {
        addr,
        orchestrator,
        watcher,
        shutdown_tx,
        handle,
    }
}

struct HttpResponse {
    status: u16,
    head: String,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

fn decode_chunked(mut raw: &str) -> String {
    let mut out = String::new();
    while let Some((size, rest)) = raw.split_once("\r\n") {
        let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        out.push_str(&rest[..size]);
        raw = &rest[size + 2..];
    }
    out
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut response = HttpResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    };
    if response
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        response.body = decode_chunked(body);
    }
    response
}

async fn deploy(gateway: &TestGateway, name: &str, image: &str) -> HttpResponse {
    let body = format!(r#"{{"service":"{}","image":"{}"}}"#, name, image);
    http_request(gateway.addr, "POST", "/system/functions", &[], &body).await
}

#[tokio::test]
async fn test_deploy_then_invoke_echo() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;

    let response = deploy(&gateway, "echo", "echo:latest").await;
    assert_eq!(response.status, 201);

    gateway.watcher.tick().await.unwrap();
    let snapshot = gateway.watcher.snapshot();
    assert!(snapshot.get("echo").unwrap().replicas >= 1);

    let response = http_request(gateway.addr, "GET", "/function/echo", &[], "hi").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hi");
    assert!(response.header("x-duration-seconds").is_some());
    assert!(response.header("x-request-id").is_some());

    // Trailing slash is the same route
    let response = http_request(gateway.addr, "POST", "/function/echo/", &[], "again").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "again");
}

#[tokio::test]
async fn test_invoke_via_function_header() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;
    deploy(&gateway, "echo", "echo:latest").await;

    let response = http_request(gateway.addr, "POST", "/", &[("X-Function", "echo")], "watchdog").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "watchdog");

    let response = http_request(gateway.addr, "POST", "/", &[], "nobody").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("x-gateway-error"), Some("BAD_REQUEST"));
}

#[tokio::test]
async fn test_bad_name_deploy_makes_no_orchestrator_call() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;

    let response = deploy(&gateway, "bad name!", "echo:latest").await;
    assert_eq!(response.status, 400);
    assert_eq!(gateway.orchestrator.call_count(), 0);
}

#[tokio::test]
async fn test_duplicate_deploy_conflicts() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;

    assert_eq!(deploy(&gateway, "echo", "echo:latest").await.status, 201);
    let response = deploy(&gateway, "echo", "echo:v2").await;
    assert_eq!(response.status, 409);
    assert!(response.body.contains("SERVICE_CONFLICT"));
    assert_eq!(gateway.orchestrator.service("echo").unwrap().image, "echo:latest");
}

#[tokio::test]
async fn test_unknown_function_is_not_found() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;

    let started = Instant::now();
    let response = http_request(gateway.addr, "GET", "/function/ghost", &[], "").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-gateway-error"), Some("FUNCTION_NOT_FOUND"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_stalled_backend_times_out() {
    let fast = start_backend(Duration::ZERO).await;
    let slow = start_backend(Duration::from_secs(5)).await;
    let gateway = start_gateway(fast, None).await;

    deploy(&gateway, "echo", "echo:latest").await;
    gateway.orchestrator.set_backend("echo", format!("http://{}", slow));
    gateway.watcher.tick().await.unwrap();

    let started = Instant::now();
    let response = http_request(gateway.addr, "GET", "/function/echo", &[], "hi").await;
    assert_eq!(response.status, 504);
    assert_eq!(response.header("x-gateway-error"), Some("UPSTREAM_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(4));

    // The cached route survives the timeout
    assert!(gateway.watcher.snapshot().get("echo").is_some());
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let gone = closed_port().await;
    let gateway = start_gateway(gone, None).await;
    deploy(&gateway, "echo", "echo:latest").await;

    let response = http_request(gateway.addr, "GET", "/function/echo", &[], "").await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-gateway-error"), Some("UPSTREAM_UNREACHABLE"));
}

#[tokio::test]
async fn test_list_and_delete() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;
    deploy(&gateway, "echo", "echo:latest").await;
    deploy(&gateway, "figlet", "figlet:latest").await;

    http_request(gateway.addr, "GET", "/function/echo", &[], "x").await;

    let response = http_request(gateway.addr, "GET", "/system/functions", &[], "").await;
    assert_eq!(response.status, 200);
    let listed: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 2);
    assert_eq!(listed[0]["name"], "echo");
    assert_eq!(listed[0]["invocationCount"], 1);
    assert_eq!(listed[1]["invocationCount"], 0);

    let response = http_request(
        gateway.addr,
        "DELETE",
        "/system/functions",
        &[],
        r#"{"functionName":"echo"}"#,
    )
    .await;
    assert_eq!(response.status, 200);

    let response = http_request(gateway.addr, "GET", "/system/functions", &[], "").await;
    let listed: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "figlet");

    let response = http_request(
        gateway.addr,
        "DELETE",
        "/system/functions",
        &[],
        r#"{"functionName":"echo"}"#,
    )
    .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_metrics_endpoint_counts_invocations() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;
    deploy(&gateway, "echo", "echo:latest").await;
    gateway.watcher.tick().await.unwrap();

    for _ in 0..3 {
        http_request(gateway.addr, "GET", "/function/echo", &[], "hi").await;
    }
    http_request(gateway.addr, "GET", "/function/ghost", &[], "").await;

    let response = http_request(gateway.addr, "GET", "/metrics", &[], "").await;
    assert_eq!(response.status, 200);

    let counter = response
        .body
        .lines()
        .find(|l| {
            l.starts_with("gateway_function_invocation_total")
                && l.contains("function_name=\"echo\"")
                && l.contains("code=\"200\"")
        })
        .unwrap();
    assert!(counter.ends_with(" 3"));
    assert!(response.body.contains("code=\"404\""));
    assert!(response.body.contains("function_name=\"<unknown>\""));
    assert!(!response.body.contains("ghost"));
    assert!(response.body.contains("gateway_service_count"));
    assert!(response.body.contains("gateway_functions_seconds"));
}

#[tokio::test]
async fn test_management_api_requires_token() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, Some("s3cret")).await;

    let response = http_request(gateway.addr, "GET", "/system/functions", &[], "").await;
    assert_eq!(response.status, 401);

    let response = http_request(
        gateway.addr,
        "GET",
        "/system/functions",
        &[("Authorization", "Bearer s3cret")],
        "",
    )
    .await;
    assert_eq!(response.status, 200);

    // Invocation is not gated
    let response = http_request(gateway.addr, "GET", "/function/ghost", &[], "").await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_alert_scales_function() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;
    deploy(&gateway, "echo", "echo:latest").await;

    let alert = r#"{"status":"firing","alerts":[{"status":"firing","labels":{"function_name":"echo"}}]}"#;
    let response = http_request(gateway.addr, "POST", "/system/alert", &[], alert).await;
    assert_eq!(response.status, 200);

    gateway.watcher.tick().await.unwrap();
    assert_eq!(gateway.watcher.snapshot().get("echo").unwrap().replicas, 6);
}

#[tokio::test]
async fn test_server_stops_on_shutdown() {
    let backend = start_backend(Duration::ZERO).await;
    let gateway = start_gateway(backend, None).await;

    let response = http_request(gateway.addr, "GET", "/healthz", &[], "").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");

    gateway.shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), gateway.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
