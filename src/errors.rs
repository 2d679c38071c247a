//! Client error types.
//!
//! Every fallible operation returns [`AzError`].  Transient outcomes
//! (throttling, 5xx responses, transport hiccups) are retried inside the
//! transfer engine and only surface as [`AzError::RetriesExhausted`] once
//! the retry budget is spent; everything else maps to one variant per
//! abstract failure kind.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AzError>;

/// A transport-layer failure, split into the kinds the retry policy
/// distinguishes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS resolution failed.  Name-not-found is permanent; every other
    /// resolver failure is transient.
    #[error("dns resolution failed: {message}")]
    Dns { message: String, permanent: bool },

    /// TCP connect failed or was refused.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// A transport-level deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The progress watchdog aborted the request: no byte moved in either
    /// direction within the read timeout.
    #[error("transfer stalled for {0} s")]
    Stalled(u64),

    /// Sending the request or its body failed mid-flight.
    #[error("failed sending request: {0}")]
    Send(String),

    /// Receiving the response body failed, including EOF and short reads.
    #[error("failed receiving response body: {0}")]
    Receive(String),

    /// Anything the transport reports that fits none of the above.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map a `reqwest` error onto a transport kind.
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        let chain = chain_text(err);
        classify_transport(
            err.is_timeout(),
            err.is_connect(),
            err.is_body() || err.is_decode(),
            err.is_request(),
            &chain,
        )
    }
}

/// Concatenated, lowercased messages of an error and all its sources.
fn chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string().to_lowercase();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

/// Kind classification over the flags `reqwest` exposes plus the message
/// chain.  Separated from [`TransportError::from_reqwest`] so the string
/// heuristics are testable without constructing real transport failures.
fn classify_transport(
    is_timeout: bool,
    is_connect: bool,
    is_body: bool,
    is_request: bool,
    chain: &str,
) -> TransportError {
    if is_timeout {
        return TransportError::Timeout;
    }
    if is_connect {
        if chain.contains("dns") || chain.contains("lookup address") {
            // getaddrinfo surfaces EAI_NONAME with one of these messages.
            let permanent = chain.contains("name or service not known")
                || chain.contains("nodename nor servname")
                || chain.contains("no such host");
            return TransportError::Dns {
                message: chain.to_string(),
                permanent,
            };
        }
        if chain.contains("tls") || chain.contains("certificate") || chain.contains("handshake") {
            return TransportError::TlsHandshake(chain.to_string());
        }
        return TransportError::Connect(chain.to_string());
    }
    if is_body {
        return TransportError::Receive(chain.to_string());
    }
    if is_request {
        return TransportError::Send(chain.to_string());
    }
    TransportError::Other(chain.to_string())
}

/// Errors surfaced by container and blob operations.
#[derive(Debug, Error)]
pub enum AzError {
    /// The service rejected the request with a non-retryable status.
    #[error("{operation} on {resource} failed: HTTP {status} ({})", .code.as_deref().unwrap_or("no error code"))]
    Service {
        operation: &'static str,
        resource: String,
        status: u16,
        code: Option<String>,
    },

    /// The request never produced a usable response and the failure is not
    /// retryable.
    #[error("{operation} on {resource} failed")]
    Transport {
        operation: &'static str,
        resource: String,
        #[source]
        source: TransportError,
    },

    /// The retry budget was exhausted; carries the final attempt's outcome.
    #[error("{operation} on {resource} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        resource: String,
        attempts: u32,
        #[source]
        source: Box<AzError>,
    },

    /// The payload cannot fit within the service's block-count and
    /// block-size limits.
    #[error("payload of {n_bytes} bytes exceeds the maximum blob size")]
    PayloadTooLarge { n_bytes: u64 },

    /// The session holds neither a refresh token nor a client secret, so an
    /// expired bearer token cannot be renewed.
    #[error("unable to refresh tokens without either a refresh token or a client secret")]
    NoRefreshableCredential,

    /// The token endpoint rejected the refresh request.
    #[error("token refresh failed: HTTP {status} {detail}")]
    Auth { status: u16, detail: String },

    /// The service answered with a body this client could not interpret.
    #[error("{operation}: malformed service response: {detail}")]
    InvalidResponse {
        operation: &'static str,
        detail: String,
    },

    /// A spawned transfer worker terminated abnormally.
    #[error("transfer worker failed: {0}")]
    Worker(String),

    /// The HTTP client could not be constructed.
    #[error("http client construction failed: {0}")]
    HttpClient(String),

    /// Local filesystem failure in the copy pipeline.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AzError {
    /// HTTP status of a service rejection, if this error carries one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AzError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Inner service error code (e.g. `BlobNotFound`), if present.
    pub fn service_code(&self) -> Option<&str> {
        match self {
            AzError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_takes_precedence() {
        let err = classify_transport(true, true, false, false, "connection timed out");
        assert!(matches!(err, TransportError::Timeout));
    }

    #[test]
    fn test_dns_name_not_found_is_permanent() {
        let err = classify_transport(
            false,
            true,
            false,
            false,
            "dns error: failed to lookup address information: name or service not known",
        );
        match err {
            TransportError::Dns { permanent, .. } => assert!(permanent),
            other => panic!("expected dns error, got {other:?}"),
        }
    }

    #[test]
    fn test_dns_transient_failure() {
        let err = classify_transport(
            false,
            true,
            false,
            false,
            "dns error: failed to lookup address information: temporary failure in name resolution",
        );
        match err {
            TransportError::Dns { permanent, .. } => assert!(!permanent),
            other => panic!("expected dns error, got {other:?}"),
        }
    }

    #[test]
    fn test_tls_handshake_detected() {
        let err = classify_transport(false, true, false, false, "error: tls handshake eof");
        assert!(matches!(err, TransportError::TlsHandshake(_)));
    }

    #[test]
    fn test_plain_connect_failure() {
        let err = classify_transport(false, true, false, false, "connection refused");
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[test]
    fn test_body_failure_is_receive() {
        let err = classify_transport(false, false, true, false, "unexpected eof during body");
        assert!(matches!(err, TransportError::Receive(_)));
    }

    #[test]
    fn test_request_failure_is_send() {
        let err = classify_transport(false, false, false, true, "connection reset by peer");
        assert!(matches!(err, TransportError::Send(_)));
    }

    #[test]
    fn test_unclassified_is_other() {
        let err = classify_transport(false, false, false, false, "builder error");
        assert!(matches!(err, TransportError::Other(_)));
    }

    #[test]
    fn test_http_status_accessor() {
        let err = AzError::Service {
            operation: "read blob",
            resource: "ct/obj".to_string(),
            status: 404,
            code: Some("BlobNotFound".to_string()),
        };
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(err.service_code(), Some("BlobNotFound"));
        assert_eq!(AzError::NoRefreshableCredential.http_status(), None);
    }
}
