//! Authenticated HTTP request primitive.
//!
//! One [`RestClient`] serves all requests of a container handle.  It owns
//! the pooled `reqwest` client, attaches the service headers, enforces the
//! connect deadline at the transport level and the read deadline through a
//! progress watchdog, and reduces every outcome to either a successful
//! [`RestResponse`] or a classified attempt failure.
//!
//! The watchdog mirrors the classic no-byte rule: a request is aborted only
//! when *neither* direction has moved a byte within the read timeout.
//! Upload bodies are fed to the transport in small chunks through a
//! progress-counting stream so send progress is observable; response bodies
//! are consumed chunk-by-chunk with a per-chunk deadline.

use std::convert::Infallible;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Method, StatusCode};
use tracing::debug;

use crate::errors::{AzError, Result, TransportError};
use crate::retry::AttemptFailure;
use crate::xml;

/// Blob service REST API version attached to every storage request.
pub const API_VERSION: &str = "2021-08-06";

/// Interval at which the watchdog samples send progress.
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Upload chunk size; small enough that the watchdog sees steady progress
/// on a healthy link.
const UPLOAD_CHUNK_BYTES: usize = 256 * 1024;

/// A collected response: status, headers, and the full body.
#[derive(Debug)]
pub(crate) struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP client bound to one handle's timeouts.
#[derive(Debug)]
pub(crate) struct RestClient {
    http: reqwest::Client,
    read_timeout: Duration,
    verbosity: u8,
}

impl RestClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, verbosity: u8) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AzError::HttpClient(e.to_string()))?;
        Ok(RestClient {
            http,
            read_timeout,
            verbosity,
        })
    }

    /// Issue an authenticated storage request and collect the response.
    ///
    /// Non-2xx responses come back as `AttemptFailure::Http` carrying the
    /// parsed inner error code and any `Retry-After` value.
    pub async fn storage_request(
        &self,
        method: Method,
        url: &str,
        bearer: &str,
        headers: &[(&'static str, String)],
        body: Option<Bytes>,
    ) -> std::result::Result<RestResponse, AttemptFailure> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
            .header("x-ms-version", API_VERSION);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let sent = Arc::new(AtomicU64::new(0));
        if let Some(data) = body {
            request = request.header(CONTENT_LENGTH, data.len());
            request = request.body(progress_body(data, Arc::clone(&sent)));
        }

        if self.verbosity > 0 {
            debug!(%method, url, "issuing request");
        }

        let response = self.execute(request, sent).await?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(AttemptFailure::Http {
                status: response.status,
                code: xml::parse_error_code(&response.body),
                retry_after: retry_after_of(&response.headers),
            })
        }
    }

    /// POST a url-encoded form without service headers (token endpoint).
    pub async fn form_post(
        &self,
        url: &str,
        body: String,
    ) -> std::result::Result<RestResponse, AttemptFailure> {
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);
        let response = self.execute(request, Arc::new(AtomicU64::new(0))).await?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(AttemptFailure::Http {
                status: response.status,
                code: None,
                retry_after: retry_after_of(&response.headers),
            })
        }
    }

    /// Streaming GET that writes the response body directly into `out`.
    ///
    /// Fails with a retryable `Receive` error when the service sends more or
    /// fewer bytes than `out` holds.
    pub async fn get_into(
        &self,
        url: &str,
        bearer: &str,
        headers: &[(&'static str, String)],
        out: &mut [u8],
    ) -> std::result::Result<(), AttemptFailure> {
        let mut request = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
            .header("x-ms-version", API_VERSION);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        if self.verbosity > 0 {
            debug!(url, len = out.len(), "issuing streaming read");
        }

        let response = self
            .send_guarded(request, Arc::new(AtomicU64::new(0)))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let response_headers = response.headers().clone();
            let body = self.collect_body(response).await?;
            return Err(AttemptFailure::Http {
                status,
                code: xml::parse_error_code(&body),
                retry_after: retry_after_of(&response_headers),
            });
        }

        let mut filled = 0usize;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    return Err(AttemptFailure::Transport(TransportError::Stalled(
                        self.read_timeout.as_secs(),
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk
                    .map_err(|e| AttemptFailure::Transport(TransportError::from_reqwest(&e)))?,
            };
            if filled + chunk.len() > out.len() {
                return Err(AttemptFailure::Transport(TransportError::Receive(format!(
                    "service sent more bytes than requested ({} > {})",
                    filled + chunk.len(),
                    out.len()
                ))));
            }
            out[filled..filled + chunk.len()].copy_from_slice(&chunk);
            filled += chunk.len();
        }
        if filled != out.len() {
            return Err(AttemptFailure::Transport(TransportError::Receive(format!(
                "short body: got {filled} of {} bytes",
                out.len()
            ))));
        }
        Ok(())
    }

    // -- Internals ------------------------------------------------------------

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        sent: Arc<AtomicU64>,
    ) -> std::result::Result<RestResponse, AttemptFailure> {
        let response = self.send_guarded(request, sent).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = self.collect_body(response).await?;
        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }

    /// Drive the request until response headers arrive, aborting when the
    /// send side makes no progress for a full read timeout.
    async fn send_guarded(
        &self,
        request: reqwest::RequestBuilder,
        sent: Arc<AtomicU64>,
    ) -> std::result::Result<reqwest::Response, AttemptFailure> {
        let future = request.send();
        tokio::pin!(future);
        let mut last_observed = 0u64;
        let mut last_progress = Instant::now();
        loop {
            tokio::select! {
                outcome = &mut future => {
                    return outcome
                        .map_err(|e| AttemptFailure::Transport(TransportError::from_reqwest(&e)));
                }
                _ = tokio::time::sleep(WATCHDOG_TICK) => {
                    let sent_now = sent.load(Ordering::Relaxed);
                    if sent_now > last_observed {
                        last_observed = sent_now;
                        last_progress = Instant::now();
                    } else if last_progress.elapsed() >= self.read_timeout {
                        return Err(AttemptFailure::Transport(TransportError::Stalled(
                            self.read_timeout.as_secs(),
                        )));
                    }
                }
            }
        }
    }

    /// Collect a response body, enforcing the per-chunk read deadline.
    async fn collect_body(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<Bytes, AttemptFailure> {
        let mut stream = response.bytes_stream();
        let mut body = BytesMut::new();
        loop {
            match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    return Err(AttemptFailure::Transport(TransportError::Stalled(
                        self.read_timeout.as_secs(),
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    let chunk = chunk
                        .map_err(|e| AttemptFailure::Transport(TransportError::from_reqwest(&e)))?;
                    body.extend_from_slice(&chunk);
                }
            }
        }
        Ok(body.freeze())
    }
}

/// Wrap `data` in a body that counts bytes into `sent` as the transport
/// pulls them.  The explicit Content-Length header set by the caller keeps
/// the request length-framed.
fn progress_body(data: Bytes, sent: Arc<AtomicU64>) -> Body {
    let chunks: Vec<Bytes> = chunk_spans(data.len())
        .into_iter()
        .map(|span| data.slice(span))
        .collect();
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok::<Bytes, Infallible>(chunk)
    }));
    Body::wrap_stream(stream)
}

/// Split `[0, len)` into consecutive spans of at most [`UPLOAD_CHUNK_BYTES`].
fn chunk_spans(len: usize) -> Vec<Range<usize>> {
    (0..len)
        .step_by(UPLOAD_CHUNK_BYTES.max(1))
        .map(|start| start..len.min(start + UPLOAD_CHUNK_BYTES))
        .collect()
}

/// Parse a `Retry-After` header as whole seconds.
fn retry_after_of(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_chunk_spans_cover_everything() {
        let len = UPLOAD_CHUNK_BYTES * 3 + 17;
        let spans = chunk_spans(len);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0], 0..UPLOAD_CHUNK_BYTES);
        assert_eq!(spans[3].end, len);
        let total: usize = spans.iter().map(|s| s.end - s.start).sum();
        assert_eq!(total, len);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_chunk_spans_empty() {
        assert!(chunk_spans(0).is_empty());
    }

    #[test]
    fn test_chunk_spans_single_small() {
        assert_eq!(chunk_spans(10), vec![0..10]);
    }

    #[test]
    fn test_retry_after_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_static("17"));
        assert_eq!(retry_after_of(&headers), Some(17));
    }

    #[test]
    fn test_retry_after_absent_or_unparseable() {
        assert_eq!(retry_after_of(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(
            "Retry-After",
            HeaderValue::from_static("Fri, 01 Jan 2027 00:00:00 GMT"),
        );
        assert_eq!(retry_after_of(&headers), None);
    }
}
