//! End-to-end coverage driving the real hyper listener through a real
//! `reqwest::Client`, for properties that span config, health, body, and
//! handler together rather than any single module in isolation.

use bytes::Bytes;
use failover_gateway::config::{GatewayConfig, HealthCheckConfig};
use failover_gateway::proxy::handle_request;
use failover_gateway::server::GatewayState;
use failover_gateway::upstream::{HealthcheckManager, Target};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::net::SocketAddr;
use tokio::net::TcpListener;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    use http_body_util::{BodyExt, Full};
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// `Metrics::install()` sets a process-wide global recorder and panics if
/// called twice; share one instance across every test in this binary.
static METRICS: OnceLock<failover_gateway::metrics::Metrics> = OnceLock::new();
fn test_metrics() -> failover_gateway::metrics::Metrics {
    METRICS
        .get_or_init(failover_gateway::metrics::Metrics::install)
        .clone()
}

fn test_state(targets: Vec<Target>) -> GatewayState {
    GatewayState {
        config: Arc::new(arc_swap::ArcSwap::new(Arc::new(GatewayConfig::default()))),
        metrics: test_metrics(),
        health: HealthcheckManager::new(targets, HealthCheckConfig::default()),
        client: reqwest::Client::new(),
    }
}

/// A fake upstream that echoes back whatever bytes it received, reporting
/// the request's `Content-Encoding` header alongside them, separated by `|`.
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| async move {
                    use http_body_util::BodyExt;
                    let encoding = req
                        .headers()
                        .get(http::header::CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let mut out = encoding.into_bytes();
                    out.push(b'|');
                    out.extend_from_slice(&body);
                    Ok::<_, hyper::Error>(Response::builder().status(200).body(full_body(out)).unwrap())
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });

    addr
}

async fn spawn_status_upstream(status: u16) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let hits = hits_clone.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |_req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, hyper::Error>(
                            Response::builder().status(status).body(full_body("x")).unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });

    (addr, hits)
}

fn spawn_proxy(state: GatewayState) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let listener = TcpListener::from_std(listener).unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move { handle_request(req, state, peer_addr).await }
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn failover_tries_targets_in_declared_order() {
    let (t1_addr, t1_hits) = spawn_status_upstream(500).await;
    let (t2_addr, t2_hits) = spawn_status_upstream(500).await;
    let (t3_addr, t3_hits) = spawn_status_upstream(200).await;

    let state = test_state(vec![
        Target {
            name: "t1".into(),
            url: format!("http://{}", t1_addr),
            accepts_compressed_requests: false,
        },
        Target {
            name: "t2".into(),
            url: format!("http://{}", t2_addr),
            accepts_compressed_requests: false,
        },
        Target {
            name: "t3".into(),
            url: format!("http://{}", t3_addr),
            accepts_compressed_requests: false,
        },
    ]);
    let proxy_addr = spawn_proxy(state);

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/", proxy_addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(t1_hits.load(Ordering::SeqCst), 1);
    assert_eq!(t2_hits.load(Ordering::SeqCst), 1);
    assert_eq!(t3_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gzip_body_is_decompressed_for_a_non_compression_target() {
    use async_compression::tokio::bufread::GzipEncoder;
    use tokio::io::AsyncReadExt;

    let plain = b"the quick brown fox jumps over the lazy dog";
    let mut encoder = GzipEncoder::new(&plain[..]);
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await.unwrap();

    let upstream_addr = spawn_echo_upstream().await;
    let state = test_state(vec![Target {
        name: "only".into(),
        url: format!("http://{}", upstream_addr),
        accepts_compressed_requests: false,
    }]);
    let proxy_addr = spawn_proxy(state);

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/", proxy_addr))
        .header("content-encoding", "gzip")
        .body(compressed)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.bytes().await.unwrap();
    let (encoding, payload) = {
        let s = std::str::from_utf8(&body).unwrap();
        let (enc, rest) = s.split_once('|').unwrap();
        (enc.to_string(), rest.as_bytes().to_vec())
    };
    assert_eq!(encoding, "");
    assert_eq!(payload, plain);
}

#[tokio::test]
async fn malformed_gzip_body_returns_400_without_an_upstream_attempt() {
    let (upstream_addr, hits) = spawn_status_upstream(200).await;
    let state = test_state(vec![Target {
        name: "only".into(),
        url: format!("http://{}", upstream_addr),
        accepts_compressed_requests: false,
    }]);
    let proxy_addr = spawn_proxy(state);

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/", proxy_addr))
        .header("content-encoding", "gzip")
        .body(b"not actually gzip".to_vec())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_candidates_exhausted_yields_synthesized_503() {
    let (t1_addr, _) = spawn_status_upstream(500).await;
    let (t2_addr, _) = spawn_status_upstream(503).await;

    let state = test_state(vec![
        Target {
            name: "t1".into(),
            url: format!("http://{}", t1_addr),
            accepts_compressed_requests: false,
        },
        Target {
            name: "t2".into(),
            url: format!("http://{}", t2_addr),
            accepts_compressed_requests: false,
        },
    ]);
    let proxy_addr = spawn_proxy(state);

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/", proxy_addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 503);
    let body = resp.text().await.unwrap();
    assert!(body.contains("all upstream targets failed"));
}
