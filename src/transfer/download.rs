//! Range-sliced parallel download engine.
//!
//! `readbytes_into` fills a caller-provided buffer with a byte range of a
//! blob.  The range is partitioned near-equally across an effective worker
//! count derived from the buffer size, each worker issuing its own
//! `Range` GET with independent retries.  A single effective worker uses
//! the streaming variant, which copies response chunks straight into the
//! caller's buffer.

use bytes::Bytes;
use reqwest::Method;
use tokio::task::JoinSet;
use tracing::debug;

use crate::container::Container;
use crate::errors::{AzError, Result, TransportError};
use crate::retry::{
    classify, exhausted, sleep_before_retry, with_retry, AttemptFailure, Verdict,
};
use crate::transfer::plan::{partition_range, MIN_BLOCK_BYTES};

/// Fill `out` with the bytes of `blob` starting at `offset`.
///
/// On success the buffer holds exactly the requested range; after a failure
/// its contents are unspecified.
pub(crate) async fn readbytes_into(
    container: &Container,
    blob: &str,
    out: &mut [u8],
    offset: u64,
) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let len = out.len() as u64;
    let workers = effective_workers(len, container.options().n_threads);
    if workers == 1 {
        return read_streaming(container, blob, out, offset).await;
    }

    debug!(blob, len, workers, "starting sliced read");
    let mut tasks = JoinSet::new();
    for index in 0..workers {
        let range = partition_range(len, workers, index);
        let container = container.clone();
        let blob = blob.to_string();
        tasks.spawn(async move {
            let chunk =
                read_range(&container, &blob, offset + range.start, range.end - range.start)
                    .await?;
            Ok::<(u64, Bytes), AzError>((range.start, chunk))
        });
    }

    // Completion order does not matter: every worker owns a disjoint slice.
    while let Some(joined) = tasks.join_next().await {
        let (start, chunk) = joined.unwrap_or_else(|e| Err(AzError::Worker(e.to_string())))?;
        let start = start as usize;
        out[start..start + chunk.len()].copy_from_slice(&chunk);
    }
    Ok(())
}

/// Worker count for a read of `len` bytes: one worker per 32 MiB slice,
/// bounded by the handle's thread budget.
fn effective_workers(len: u64, n_threads: usize) -> u64 {
    (len / MIN_BLOCK_BYTES).clamp(1, n_threads.max(1) as u64)
}

/// GET one range with independent retries, returning its bytes.
async fn read_range(container: &Container, blob: &str, offset: u64, len: u64) -> Result<Bytes> {
    let url = container.blob_url(blob);
    let resource = container.blob_resource(blob);
    let range_header = range_header(offset, len);
    let n_retries = container.options().n_retries;
    with_retry("read blob", &resource, n_retries, || {
        let range_header = range_header.clone();
        let url = &url;
        async move {
            let bearer = container
                .fresh_token()
                .await
                .map_err(AttemptFailure::Fatal)?;
            let response = container
                .rest()
                .storage_request(
                    Method::GET,
                    url,
                    &bearer,
                    &[("Range", range_header)],
                    None,
                )
                .await?;
            if response.body.len() as u64 != len {
                // A truncated body re-enters the retry loop like any other
                // interrupted read.
                return Err(AttemptFailure::Transport(TransportError::Receive(format!(
                    "short body: got {} of {len} bytes",
                    response.body.len()
                ))));
            }
            Ok(response.body)
        }
    })
    .await
}

/// Single-worker path: stream the ranged response directly into `out`.
///
/// The retry loop is unrolled here because the attempt borrows the caller's
/// buffer mutably.
async fn read_streaming(
    container: &Container,
    blob: &str,
    out: &mut [u8],
    offset: u64,
) -> Result<()> {
    let url = container.blob_url(blob);
    let resource = container.blob_resource(blob);
    let range_header = range_header(offset, out.len() as u64);
    let n_retries = container.options().n_retries.max(1);

    let mut attempt = 1u32;
    loop {
        let bearer = container.fresh_token().await?;
        let headers = [("Range", range_header.clone())];
        let failure = match container.rest().get_into(&url, &bearer, &headers, out).await {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        match classify(&failure) {
            Verdict::Fatal => return Err(failure.into_error("read blob", &resource)),
            Verdict::Retry { after } => {
                if attempt >= n_retries {
                    return Err(exhausted("read blob", &resource, attempt, failure));
                }
                sleep_before_retry(attempt, after, failure.wait_kind()).await;
                attempt += 1;
            }
        }
    }
}

/// Inclusive-inclusive range header for `len` bytes at `offset`.
fn range_header(offset: u64, len: u64) -> String {
    format!("bytes={}-{}", offset, offset + len - 1)
}

// -- Tests --------------------------------------------------------------------
