use crate::error::GatewayError;
use crate::upstream::Target;
use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;

/// A client request body, read exactly once and held in memory so it can be
/// replayed across multiple upstream attempts.
///
/// Stores whatever form the client sent (`bytes` + `original_encoding`) and
/// lazily derives the opposite form (decompressed) the first time a target
/// needs it, memoizing the result so repeated attempts against
/// same-compression targets never re-inflate the payload.
pub struct ReplayableBody {
    bytes: Bytes,
    original_encoding: String,
    decompressed: OnceLock<Bytes>,
}

impl ReplayableBody {
    pub fn new(bytes: Bytes, original_encoding: String) -> Self {
        Self {
            bytes,
            original_encoding,
            decompressed: OnceLock::new(),
        }
    }

    /// Derive the body bytes, `Content-Encoding` header value, and byte
    /// length to send to `target`.
    pub async fn for_target(
        &self,
        target: &Target,
    ) -> Result<(Bytes, Option<&'static str>, usize), GatewayError> {
        if !self.original_encoding.eq_ignore_ascii_case("gzip") {
            return Ok((self.bytes.clone(), None, self.bytes.len()));
        }

        if target.accepts_compressed_requests {
            return Ok((self.bytes.clone(), Some("gzip"), self.bytes.len()));
        }

        let plain = self.decompressed().await?;
        let len = plain.len();
        Ok((plain, None, len))
    }

    async fn decompressed(&self) -> Result<Bytes, GatewayError> {
        if let Some(cached) = self.decompressed.get() {
            return Ok(cached.clone());
        }

        let mut decoder = GzipDecoder::new(self.bytes.as_ref());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .await
            .map_err(|e| GatewayError::Decompress(e.to_string()))?;

        let decoded = Bytes::from(out);
        // A racing second caller just re-decodes; cheap and harmless since
        // materialization always happens on a single request's task anyway.
        let _ = self.decompressed.set(decoded.clone());
        Ok(decoded)
    }
}

/// Read the full client body exactly once, recording the `Content-Encoding`
/// the client sent so `for_target` can decide whether to decompress.
pub async fn materialize(
    body: Incoming,
    headers: &HeaderMap,
) -> Result<ReplayableBody, GatewayError> {
    let original_encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let collected = body
        .collect()
        .await
        .map_err(|e| GatewayError::Decompress(e.to_string()))?
        .to_bytes();

    // Fail fast on a malformed gzip stream rather than discovering it lazily
    // on the first target that requires decompression.
    if original_encoding.eq_ignore_ascii_case("gzip") {
        let mut decoder = GzipDecoder::new(collected.as_ref());
        let mut sink = Vec::new();
        decoder
            .read_to_end(&mut sink)
            .await
            .map_err(|e| GatewayError::Decompress(e.to_string()))?;
    }

    Ok(ReplayableBody::new(collected, original_encoding))
}
