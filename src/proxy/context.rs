use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through the failover loop and records the
/// final metrics exactly once, however the request terminates.
pub struct RequestContext {
    pub method: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    /// Name of the target the current (or most recent) attempt targeted.
    pub target_name: String,
}

impl RequestContext {
    pub fn new(method: String, client_ip: IpAddr) -> Self {
        Self {
            method,
            client_ip,
            start: Instant::now(),
            target_name: String::new(),
        }
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for every error path in the failover loop.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.record_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a successful response.
    pub fn finalize_metrics(&self, resp_status: u16) {
        self.record_metrics(resp_status);
    }

    fn record_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "gateway_http_requests_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "target" => self.target_name.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "target" => self.target_name.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}
