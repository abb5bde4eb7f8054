use crate::proxy::body::materialize;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::server::GatewayState;
use crate::upstream::Target;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Headers that apply only to a single transport hop and must never be
/// forwarded by an intermediary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Copy client headers onto the outbound reqwest request, stripping
/// hop-by-hop headers and the ones the body buffer derives per target.
fn build_upstream_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lname = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lname)
            || lname == "content-encoding"
            || lname == "content-length"
            || lname == "host"
        {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

/// Copy upstream response headers onto the client-facing response, stripping
/// hop-by-hop headers.
fn copy_response_headers(
    mut builder: http::response::Builder,
    headers: &reqwest::header::HeaderMap,
) -> http::response::Builder {
    for (name, value) in headers.iter() {
        let lname = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lname) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }
    builder
}

/// Entry point wired into the hyper service: replay one client request
/// against the configured targets in order, stopping at the first usable
/// success.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let mut ctx = RequestContext::new(req.method().to_string(), peer_addr.ip());
    metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();

    let body = match materialize(req.into_body(), &headers).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "proxy: body materialization failed");
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "malformed request body"));
        }
    };

    let targets = state.health.targets();
    let usable: Vec<&Target> = targets
        .iter()
        .filter(|t| state.health.is_healthy(&t.name))
        .collect();
    // Bootstrap pass-through: if nothing is yet known reachable (e.g. the
    // health manager hasn't completed a probe round), try everything.
    let candidates: Vec<&Target> = if usable.is_empty() {
        targets.iter().collect()
    } else {
        usable
    };

    if candidates.is_empty() {
        return Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "no targets configured"));
    }

    let upstream_timeout = state.config.load().proxy.upstream_timeout_secs;
    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

    for target in candidates {
        ctx.target_name = target.name.clone();
        let attempt_start = std::time::Instant::now();

        let (body_bytes, content_encoding, content_length) = match body.for_target(target).await {
            Ok(v) => v,
            Err(e) => {
                warn!(target = %target.name, error = %e, "proxy: decompression failed for target, skipping");
                continue;
            }
        };

        let url = format!("{}{}", target.url, path_and_query);
        let mut req_headers = build_upstream_headers(&headers);
        if let Some(enc) = content_encoding {
            req_headers.insert(
                reqwest::header::CONTENT_ENCODING,
                reqwest::header::HeaderValue::from_static(enc),
            );
        }
        req_headers.insert(
            reqwest::header::CONTENT_LENGTH,
            reqwest::header::HeaderValue::from_str(&content_length.to_string())
                .expect("content length is always ASCII digits"),
        );

        let mut builder = state
            .client
            .request(reqwest_method.clone(), url)
            .headers(req_headers)
            .body(body_bytes);
        if upstream_timeout > 0 {
            builder = builder.timeout(Duration::from_secs(upstream_timeout));
        }

        match builder.send().await {
            Ok(resp) if resp.status().as_u16() < 500 => {
                record_attempt(&target.name, "success", attempt_start);

                let status =
                    StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::OK);
                let response_headers = resp.headers().clone();
                let body_bytes = match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(target = %target.name, error = %e, "proxy: reading upstream response body failed");
                        state.health.store().taint(&target.name);
                        continue;
                    }
                };

                let response_builder =
                    copy_response_headers(Response::builder().status(status), &response_headers);
                info!(target = %target.name, status = status.as_u16(), "proxy: attempt succeeded");
                ctx.finalize_metrics(status.as_u16());
                return Ok(response_builder.body(full_body(body_bytes)).unwrap());
            }
            Ok(resp) => {
                warn!(target = %target.name, status = resp.status().as_u16(), "proxy: attempt failed, server error status");
                state.health.store().taint(&target.name);
                record_attempt(&target.name, "failure", attempt_start);
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "proxy: attempt failed, transport error");
                state.health.store().taint(&target.name);
                record_attempt(&target.name, "failure", attempt_start);
            }
        }
    }

    warn!("proxy: all candidate targets exhausted");
    Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "all upstream targets failed"))
}

fn record_attempt(target_name: &str, outcome: &'static str, start: std::time::Instant) {
    metrics::counter!(
        "gateway_upstream_attempts_total",
        "target" => target_name.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
    metrics::histogram!(
        "gateway_upstream_request_duration_seconds",
        "target" => target_name.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
}
