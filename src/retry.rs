//! Retry classification and backoff policy.
//!
//! Every outbound request runs through [`with_retry`]: each failed attempt
//! is classified as transient or fatal, transient failures sleep through an
//! exponential backoff (or the service-supplied `Retry-After`, which takes
//! precedence), and the retry budget counts the first try.  Exhausting the
//! budget surfaces the final attempt's outcome wrapped in
//! [`AzError::RetriesExhausted`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tracing::warn;

use crate::errors::{AzError, Result, TransportError};
use crate::metrics;

/// HTTP statuses that indicate a transient service condition.
pub const HTTP_RETRY_STATUSES: [u16; 3] = [429, 500, 503];

/// Upper bound on the exponential backoff term, in seconds.
pub const MAXIMUM_BACKOFF_SECONDS: f64 = 256.0;

/// Outcome of one attempt that did not succeed.
#[derive(Debug)]
pub(crate) enum AttemptFailure {
    /// The service answered with a non-2xx status.
    Http {
        status: StatusCode,
        code: Option<String>,
        retry_after: Option<u64>,
    },
    /// The request never produced a usable response.
    Transport(TransportError),
    /// A failure outside the request itself (e.g. the token refresh already
    /// spent its own retry budget); surfaces immediately.
    Fatal(AzError),
}

/// Classifier verdict for a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Retry { after: Option<u64> },
    Fatal,
}

/// What kind of wait a retry sleep counts as, for the performance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    Throttled,
    TimedOut,
    Other,
}

/// Decide whether a failed attempt is worth retrying.
pub(crate) fn classify(failure: &AttemptFailure) -> Verdict {
    match failure {
        AttemptFailure::Http {
            status,
            retry_after,
            ..
        } => {
            if HTTP_RETRY_STATUSES.contains(&status.as_u16()) {
                Verdict::Retry {
                    after: *retry_after,
                }
            } else {
                Verdict::Fatal
            }
        }
        AttemptFailure::Transport(transport) => match transport {
            TransportError::Dns { permanent, .. } => {
                if *permanent {
                    Verdict::Fatal
                } else {
                    Verdict::Retry { after: None }
                }
            }
            TransportError::Connect(_)
            | TransportError::TlsHandshake(_)
            | TransportError::Timeout
            | TransportError::Stalled(_)
            | TransportError::Send(_)
            | TransportError::Receive(_) => Verdict::Retry { after: None },
            TransportError::Other(_) => Verdict::Fatal,
        },
        AttemptFailure::Fatal(_) => Verdict::Fatal,
    }
}

impl AttemptFailure {
    /// Convert into the user-facing error, attaching operation context.
    pub(crate) fn into_error(self, operation: &'static str, resource: &str) -> AzError {
        match self {
            AttemptFailure::Http { status, code, .. } => AzError::Service {
                operation,
                resource: resource.to_string(),
                status: status.as_u16(),
                code,
            },
            AttemptFailure::Transport(source) => AzError::Transport {
                operation,
                resource: resource.to_string(),
                source,
            },
            AttemptFailure::Fatal(err) => err,
        }
    }

    pub(crate) fn wait_kind(&self) -> WaitKind {
        match self {
            AttemptFailure::Http {
                status,
                retry_after,
                ..
            } if status.as_u16() == 429 || retry_after.is_some() => WaitKind::Throttled,
            AttemptFailure::Transport(TransportError::Timeout)
            | AttemptFailure::Transport(TransportError::Stalled(_)) => WaitKind::TimedOut,
            _ => WaitKind::Other,
        }
    }
}

/// Wrap the final attempt's outcome once the retry budget is spent.
pub(crate) fn exhausted(
    operation: &'static str,
    resource: &str,
    attempts: u32,
    failure: AttemptFailure,
) -> AzError {
    AzError::RetriesExhausted {
        operation,
        resource: resource.to_string(),
        attempts,
        source: Box::new(failure.into_error(operation, resource)),
    }
}

/// Backoff interval before retry `attempt` (1-based, first try counted).
///
/// `min(2^(attempt-1), 256) + jitter` seconds, or `after + jitter` when the
/// service supplied a `Retry-After` value.  `jitter` is a sample of U[0,1).
pub(crate) fn backoff_interval(attempt: u32, after: Option<u64>, jitter: f64) -> Duration {
    let seconds = match after {
        Some(after) => after as f64 + jitter,
        None => {
            let exponent = attempt.saturating_sub(1).min(62) as i32;
            2f64.powi(exponent).min(MAXIMUM_BACKOFF_SECONDS) + jitter
        }
    };
    Duration::from_secs_f64(seconds)
}

/// Sleep through the backoff for `attempt` and record the wait.
pub(crate) async fn sleep_before_retry(attempt: u32, after: Option<u64>, kind: WaitKind) {
    let jitter: f64 = rand::rng().random::<f64>();
    let interval = backoff_interval(attempt, after, jitter);
    tokio::time::sleep(interval).await;
    match kind {
        WaitKind::Throttled => metrics::record_throttle_wait(interval),
        WaitKind::TimedOut => metrics::record_timeout_wait(interval),
        WaitKind::Other => {}
    }
}

/// Drive `attempt_fn` until it succeeds, fails fatally, or the budget of
/// `n_retries` total attempts is spent.
pub(crate) async fn with_retry<T, F, Fut>(
    operation: &'static str,
    resource: &str,
    n_retries: u32,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptFailure>>,
{
    let n_retries = n_retries.max(1);
    let mut attempt = 1u32;
    loop {
        let failure = match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        match classify(&failure) {
            Verdict::Fatal => return Err(failure.into_error(operation, resource)),
            Verdict::Retry { after } => {
                if attempt >= n_retries {
                    return Err(exhausted(operation, resource, attempt, failure));
                }
                warn!(
                    operation,
                    resource,
                    attempt,
                    n_retries,
                    failure = ?failure,
                    "transient failure, backing off"
                );
                sleep_before_retry(attempt, after, failure.wait_kind()).await;
                attempt += 1;
            }
        }
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn http_failure(status: u16, retry_after: Option<u64>) -> AttemptFailure {
        AttemptFailure::Http {
            status: StatusCode::from_u16(status).unwrap(),
            code: None,
            retry_after,
        }
    }

    #[test]
    fn test_retryable_http_statuses() {
        for status in [429, 500, 503] {
            assert!(
                matches!(classify(&http_failure(status, None)), Verdict::Retry { .. }),
                "expected {status} to be retryable"
            );
        }
    }

    #[test]
    fn test_fatal_http_statuses() {
        for status in [400, 401, 403, 404, 409, 412, 501] {
            assert_eq!(
                classify(&http_failure(status, None)),
                Verdict::Fatal,
                "expected {status} to be fatal"
            );
        }
    }

    #[test]
    fn test_retry_after_hint_carried() {
        assert_eq!(
            classify(&http_failure(429, Some(17))),
            Verdict::Retry { after: Some(17) }
        );
    }

    #[test]
    fn test_retryable_transport_kinds() {
        let retryable = [
            TransportError::Dns {
                message: "temporary failure".to_string(),
                permanent: false,
            },
            TransportError::Connect("refused".to_string()),
            TransportError::TlsHandshake("eof".to_string()),
            TransportError::Timeout,
            TransportError::Stalled(30),
            TransportError::Send("reset".to_string()),
            TransportError::Receive("eof".to_string()),
        ];
        for transport in retryable {
            assert!(
                matches!(
                    classify(&AttemptFailure::Transport(transport)),
                    Verdict::Retry { .. }
                ),
                "expected retryable"
            );
        }
    }

    #[test]
    fn test_permanent_dns_is_fatal() {
        let failure = AttemptFailure::Transport(TransportError::Dns {
            message: "name or service not known".to_string(),
            permanent: true,
        });
        assert_eq!(classify(&failure), Verdict::Fatal);
    }

    #[test]
    fn test_other_transport_is_fatal() {
        let failure = AttemptFailure::Transport(TransportError::Other("builder".to_string()));
        assert_eq!(classify(&failure), Verdict::Fatal);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_interval(1, None, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_interval(2, None, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_interval(5, None, 0.0), Duration::from_secs(16));
        assert_eq!(backoff_interval(9, None, 0.0), Duration::from_secs(256));
        // Past the cap the interval stays pinned.
        assert_eq!(backoff_interval(40, None, 0.0), Duration::from_secs(256));
    }

    #[test]
    fn test_retry_after_takes_precedence() {
        assert_eq!(
            backoff_interval(9, Some(5), 0.0),
            Duration::from_secs(5),
            "Retry-After must replace the exponential term"
        );
    }

    #[test]
    fn test_backoff_jitter_added() {
        let interval = backoff_interval(1, None, 0.5);
        assert_eq!(interval, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn test_wait_kind_classification() {
        assert_eq!(http_failure(429, None).wait_kind(), WaitKind::Throttled);
        assert_eq!(http_failure(503, Some(3)).wait_kind(), WaitKind::Throttled);
        assert_eq!(
            AttemptFailure::Transport(TransportError::Timeout).wait_kind(),
            WaitKind::TimedOut
        );
        assert_eq!(
            AttemptFailure::Transport(TransportError::Stalled(30)).wait_kind(),
            WaitKind::TimedOut
        );
        assert_eq!(http_failure(500, None).wait_kind(), WaitKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_counts_first_try() {
        // Fails transiently forever: n_retries = 3 means exactly 3 attempts.
        let mut attempts = 0u32;
        let outcome: Result<()> = with_retry("op", "resource", 3, || {
            attempts += 1;
            async { Err(http_failure(503, None)) }
        })
        .await;
        assert_eq!(attempts, 3);
        match outcome {
            Err(AzError::RetriesExhausted {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.http_status(), Some(503));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers() {
        let mut attempts = 0u32;
        let outcome = with_retry("op", "resource", 10, || {
            attempts += 1;
            let succeed = attempts >= 3;
            async move {
                if succeed {
                    Ok(42u32)
                } else {
                    Err(AttemptFailure::Transport(TransportError::Timeout))
                }
            }
        })
        .await;
        assert_eq!(outcome.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_with_retry_fatal_short_circuits() {
        let mut attempts = 0u32;
        let outcome: Result<()> = with_retry("op", "resource", 10, || {
            attempts += 1;
            async { Err(http_failure(404, None)) }
        })
        .await;
        assert_eq!(attempts, 1);
        assert_eq!(outcome.unwrap_err().http_status(), Some(404));
    }

    #[tokio::test]
    async fn test_with_retry_fatal_wrapper_passthrough() {
        let outcome: Result<()> = with_retry("op", "resource", 10, || async {
            Err(AttemptFailure::Fatal(AzError::NoRefreshableCredential))
        })
        .await;
        assert!(matches!(outcome, Err(AzError::NoRefreshableCredential)));
    }
}
