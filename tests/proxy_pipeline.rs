// End-to-end tests: client -> gateway router -> real backend sockets
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    http::{HeaderMap, Uri},
};
use bytes::Bytes;
use echoes::{
    GatewayService, HttpClient, HttpClientAdapter, HttpHandler, Pipeline,
    config::{GatewayConfig, HashKey, LoadBalanceStrategy, UpstreamConfig, VHostConfig},
    ports::access_log::{AccessLog, AccessRecord, NullAccessLog, RequestOutcome},
};
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, header::HOST};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

#[derive(Default)]
struct CollectLog(Mutex<Vec<AccessRecord>>);

impl AccessLog for CollectLog {
    fn submit(&self, record: AccessRecord) {
        self.0.lock().unwrap().push(record);
    }
}

impl CollectLog {
    async fn wait_for_record(&self) -> AccessRecord {
        for _ in 0..100 {
            if let Some(record) = self.0.lock().unwrap().first().cloned() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no access record submitted");
    }
}

/// Backend answering every request with a JSON description of what it saw.
async fn spawn_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(move |headers: HeaderMap, uri: Uri| async move {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        (
            [("keep-alive", "timeout=5"), ("x-backend", name)],
            Json(json!({
                "backend": name,
                "uri": uri.to_string(),
                "host": header("host"),
                "x_forwarded_for": header("x-forwarded-for"),
                "x_forwarded_proto": header("x-forwarded-proto"),
                "x_forwarded_host": header("x-forwarded-host"),
                "te": header("te"),
            })),
        )
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn upstream(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig::new(addr.ip().to_string(), addr.port())
}

fn gateway(vhosts: Vec<VHostConfig>) -> Arc<GatewayService> {
    let config = GatewayConfig {
        vhosts,
        ..GatewayConfig::default()
    };
    let gateway = GatewayService::new(Arc::new(config), |vhost| {
        Ok(Arc::new(HttpClientAdapter::for_vhost(vhost)?) as Arc<dyn HttpClient>)
    })
    .unwrap();
    Arc::new(gateway)
}

async fn spawn_proxy(pipeline: Pipeline) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Arc::new(HttpHandler::new(Arc::new(pipeline))).router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn get(proxy: SocketAddr, host: &str, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let req = Request::builder()
        .uri(format!("http://{proxy}{path}"))
        .header(HOST, host)
        .header("te", "trailers")
        .body(Empty::new())
        .unwrap();
    let response = client.request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_is_proxied_with_forwarding_headers() {
    let backend = spawn_backend("app").await;
    let log = Arc::new(CollectLog::default());
    let gateway = gateway(vec![VHostConfig::new(
        "app.example.com",
        vec![upstream(backend)],
    )]);
    let proxy = spawn_proxy(Pipeline::new(gateway, log.clone())).await;

    let (status, headers, body) = get(proxy, "App.Example.com:443", "/users/7?full=1").await;

    assert_eq!(status, StatusCode::OK);
    let seen: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(seen["uri"], "/users/7?full=1");
    assert_eq!(seen["host"], format!("127.0.0.1:{}", backend.port()));
    assert_eq!(seen["x_forwarded_for"], "127.0.0.1");
    assert_eq!(seen["x_forwarded_proto"], "https");
    assert_eq!(seen["x_forwarded_host"], "App.Example.com:443");
    assert_eq!(seen["te"], Value::Null);

    assert_eq!(headers["x-backend"], "app");
    assert!(!headers.contains_key("keep-alive"));
    assert!(
        headers["server"]
            .to_str()
            .unwrap()
            .starts_with("echoes/")
    );
    let request_id = headers["x-request-id"].to_str().unwrap().to_string();

    let record = log.wait_for_record().await;
    assert_eq!(record.request_id, request_id);
    assert_eq!(record.status, 200);
    assert_eq!(record.outcome, RequestOutcome::Completed);
    assert_eq!(record.bytes_sent, body.len() as u64);
    assert_eq!(record.vhost.as_deref(), Some("app.example.com"));
    assert_eq!(
        record.upstream,
        Some(format!("http://127.0.0.1:{}", backend.port()))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_host_gets_not_found() {
    let backend = spawn_backend("app").await;
    let gateway = gateway(vec![VHostConfig::new(
        "app.example.com",
        vec![upstream(backend)],
    )]);
    let proxy = spawn_proxy(Pipeline::new(gateway, Arc::new(NullAccessLog))).await;

    let (status, headers, body) = get(proxy, "nobody.example.com", "/").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["content-type"], "application/json");
    let abort: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(abort["status"], "404");
    assert!(abort["msg"].as_str().unwrap().contains("nobody.example.com"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_upstream_aborts_with_500() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let log = Arc::new(CollectLog::default());
    let mut vhost = VHostConfig::new("down.example.com", vec![upstream(dead)]);
    vhost.max_timeout = 1;
    let proxy = spawn_proxy(Pipeline::new(gateway(vec![vhost]), log.clone())).await;

    let (status, _, body) = get(proxy, "down.example.com", "/").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let abort: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(abort["status"], "500");
    assert!(abort["msg"].as_str().unwrap().contains("backend request failed"));

    let record = log.wait_for_record().await;
    assert_eq!(record.outcome, RequestOutcome::Aborted);
    assert_eq!(record.status, 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_weighted_round_robin_spreads_by_weight() {
    let heavy = spawn_backend("heavy").await;
    let light = spawn_backend("light").await;
    let vhost = VHostConfig::new(
        "wrr.example.com",
        vec![upstream(heavy).with_weight(3), upstream(light).with_weight(1)],
    )
    .with_strategy(LoadBalanceStrategy::WeightedRoundRobin);
    let proxy = spawn_proxy(Pipeline::new(gateway(vec![vhost]), Arc::new(NullAccessLog))).await;

    let mut heavy_hits = 0;
    let mut light_hits = 0;
    for _ in 0..8 {
        let (status, headers, _) = get(proxy, "wrr.example.com", "/").await;
        assert_eq!(status, StatusCode::OK);
        match headers["x-backend"].to_str().unwrap() {
            "heavy" => heavy_hits += 1,
            "light" => light_hits += 1,
            other => panic!("unexpected backend {other}"),
        }
    }

    assert_eq!(heavy_hits, 6);
    assert_eq!(light_hits, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hash_on_path_is_sticky() {
    let first = spawn_backend("first").await;
    let second = spawn_backend("second").await;
    let mut vhost = VHostConfig::new("hash.example.com", vec![upstream(first), upstream(second)])
        .with_strategy(LoadBalanceStrategy::Hash);
    vhost.hash_key = HashKey::Path;
    let proxy = spawn_proxy(Pipeline::new(gateway(vec![vhost]), Arc::new(NullAccessLog))).await;

    let (_, headers, _) = get(proxy, "hash.example.com", "/cart/42").await;
    let chosen = headers["x-backend"].clone();
    for _ in 0..5 {
        let (_, headers, _) = get(proxy, "hash.example.com", "/cart/42").await;
        assert_eq!(headers["x-backend"], chosen);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_disconnect_aborts_backend_call() {
    // Backend reads the request, never answers, and reports when its socket closes
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "proxy closed before sending the request");
            seen.extend_from_slice(&buf[..n]);
        }
        let _ = received_tx.send(());
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    let log = Arc::new(CollectLog::default());
    let vhost = VHostConfig::new("slow.example.com", vec![upstream(backend_addr)]);
    let proxy = spawn_proxy(Pipeline::new(gateway(vec![vhost]), log.clone())).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /slow HTTP/1.1\r\nHost: slow.example.com\r\n\r\n")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), received_rx)
        .await
        .expect("backend never saw the request")
        .unwrap();

    drop(client);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("backend connection was not closed after the client left")
        .unwrap();

    let record = log.wait_for_record().await;
    assert_eq!(record.outcome, RequestOutcome::Cancelled);
    assert_eq!(record.status, 499);
    assert_eq!(record.path, "/slow");
}
