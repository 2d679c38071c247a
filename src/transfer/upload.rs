//! Block-oriented parallel upload engine.
//!
//! An upload runs PLAN -> UPLOAD_BLOCKS -> COMMIT.  Blocks are staged by up
//! to `n_threads` concurrent workers, each retrying independently and each
//! consulting the shared session before every attempt so a token that
//! expires mid-transfer is refreshed exactly once.  The commit PUTs the
//! ordered block list; a 400 `InvalidBlockList` answer is checked against
//! the committed set and reclassified as success when a concurrent uploader
//! already committed the identical plan.  Payloads that plan to a single
//! block (and all uploads on single-threaded handles) skip the block
//! protocol entirely with one whole-blob PUT.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::utf8_percent_encode;
use reqwest::Method;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::container::{Container, QUERY_ENCODE_SET};
use crate::errors::{AzError, Result};
use crate::retry::{with_retry, AttemptFailure};
use crate::transfer::plan::{plan_blocks, BlockPlan};
use crate::xml;

pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

/// Write `data` as the full contents of `blob`.
pub(crate) async fn writebytes(
    container: &Container,
    blob: &str,
    data: Bytes,
    content_type: &str,
) -> Result<()> {
    let n_threads = container.options().n_threads;
    if n_threads <= 1 {
        return put_single(container, blob, data, content_type).await;
    }
    let plan = plan_blocks(n_threads, data.len() as u64, None)?;
    if plan.block_count() == 1 {
        return put_single(container, blob, data, content_type).await;
    }
    debug!(
        blob,
        bytes = data.len(),
        blocks = plan.block_count(),
        "starting blocked upload"
    );
    upload_block_span(container, blob, &plan, 0..plan.block_count(), data).await?;
    commit_block_list(container, blob, plan.block_ids()).await
}

/// Whole-blob PUT fast path.
pub(crate) async fn put_single(
    container: &Container,
    blob: &str,
    data: Bytes,
    content_type: &str,
) -> Result<()> {
    let url = container.blob_url(blob);
    let resource = container.blob_resource(blob);
    let n_retries = container.options().n_retries;
    with_retry("write blob", &resource, n_retries, || {
        let data = data.clone();
        let url = &url;
        async move {
            let bearer = container
                .fresh_token()
                .await
                .map_err(AttemptFailure::Fatal)?;
            container
                .rest()
                .storage_request(
                    Method::PUT,
                    url,
                    &bearer,
                    &[
                        ("x-ms-blob-type", "BlockBlob".to_string()),
                        ("Content-Type", content_type.to_string()),
                    ],
                    Some(data),
                )
                .await?;
            Ok(())
        }
    })
    .await
}

/// Stage the blocks of `span`, whose bytes are held contiguously in `data`.
///
/// `data` must start at the first byte of `span`'s first block; the copy
/// pipeline uses this to upload one buffered batch of a larger plan.  All
/// workers drain before the aggregate outcome is decided.
pub(crate) async fn upload_block_span(
    container: &Container,
    blob: &str,
    plan: &BlockPlan,
    span: Range<usize>,
    data: Bytes,
) -> Result<()> {
    let base_offset = plan.range(span.start).start;
    let semaphore = Arc::new(Semaphore::new(container.options().n_threads));
    let mut workers = JoinSet::new();

    for index in span {
        let range = plan.range(index);
        let chunk = data.slice((range.start - base_offset) as usize..(range.end - base_offset) as usize);
        let block_id = plan.block_ids()[index].clone();
        let container = container.clone();
        let blob = blob.to_string();
        let semaphore = Arc::clone(&semaphore);
        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            put_block(&container, &blob, &block_id, chunk).await
        });
    }

    let mut first_error: Option<AzError> = None;
    while let Some(joined) = workers.join_next().await {
        let outcome = joined.unwrap_or_else(|e| Err(AzError::Worker(e.to_string())));
        if let Err(err) = outcome {
            match &first_error {
                None => first_error = Some(err),
                Some(_) => warn!(error = %err, "additional block upload failure"),
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// PUT one staged block, retrying independently.
async fn put_block(container: &Container, blob: &str, block_id: &str, chunk: Bytes) -> Result<()> {
    let url = format!(
        "{}?comp=block&blockid={}",
        container.blob_url(blob),
        utf8_percent_encode(block_id, QUERY_ENCODE_SET)
    );
    let resource = container.blob_resource(blob);
    let n_retries = container.options().n_retries;
    with_retry("put block", &resource, n_retries, || {
        let chunk = chunk.clone();
        let url = &url;
        async move {
            let bearer = container
                .fresh_token()
                .await
                .map_err(AttemptFailure::Fatal)?;
            container
                .rest()
                .storage_request(
                    Method::PUT,
                    url,
                    &bearer,
                    &[("Content-Type", OCTET_STREAM.to_string())],
                    Some(chunk),
                )
                .await?;
            Ok(())
        }
    })
    .await
}

/// PUT the ordered block list, recovering the duplicate-commit race.
pub(crate) async fn commit_block_list(
    container: &Container,
    blob: &str,
    block_ids: &[String],
) -> Result<()> {
    let document = Bytes::from(xml::render_block_list(block_ids));
    let url = format!("{}?comp=blocklist", container.blob_url(blob));
    let resource = container.blob_resource(blob);
    let n_retries = container.options().n_retries;

    let outcome = with_retry("commit block list", &resource, n_retries, || {
        let document = document.clone();
        let url = &url;
        async move {
            let bearer = container
                .fresh_token()
                .await
                .map_err(AttemptFailure::Fatal)?;
            container
                .rest()
                .storage_request(
                    Method::PUT,
                    url,
                    &bearer,
                    &[("Content-Type", "application/xml".to_string())],
                    Some(document),
                )
                .await?;
            Ok(())
        }
    })
    .await;

    let Err(err) = outcome else { return Ok(()) };
    let commit_raced = matches!(
        &err,
        AzError::Service {
            status: 400,
            code: Some(code),
            ..
        } if code == "InvalidBlockList"
    );
    if !commit_raced {
        return Err(err);
    }

    debug!(resource, "commit answered InvalidBlockList, comparing committed set");
    if committed_matches_plan(container, blob, block_ids).await? {
        debug!(resource, "identical block list already committed, treating commit as won");
        Ok(())
    } else {
        Err(err)
    }
}

/// Query the committed block list and compare it against the plan.
async fn committed_matches_plan(
    container: &Container,
    blob: &str,
    block_ids: &[String],
) -> Result<bool> {
    let url = format!("{}?comp=blocklist", container.blob_url(blob));
    let resource = container.blob_resource(blob);
    let n_retries = container.options().n_retries;
    let response = with_retry("query block list", &resource, n_retries, || {
        let url = &url;
        async move {
            let bearer = container
                .fresh_token()
                .await
                .map_err(AttemptFailure::Fatal)?;
            container
                .rest()
                .storage_request(Method::GET, url, &bearer, &[], None)
                .await
        }
    })
    .await?;
    let committed = xml::parse_committed_blocks(&response.body)?;
    Ok(same_id_set(&committed, block_ids))
}

/// Sorted-set equality of block ids.
fn same_id_set(committed: &[String], planned: &[String]) -> bool {
    let mut committed = committed.to_vec();
    let mut planned = planned.to_vec();
    committed.sort();
    planned.sort();
    committed == planned
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_same_id_set_ignores_order() {
        let committed = ids(&["MDI=", "MDA=", "MDE="]);
        let planned = ids(&["MDA=", "MDE=", "MDI="]);
        assert!(same_id_set(&committed, &planned));
    }

    #[test]
    fn test_same_id_set_detects_missing_block() {
        let committed = ids(&["MDA=", "MDE="]);
        let planned = ids(&["MDA=", "MDE=", "MDI="]);
        assert!(!same_id_set(&committed, &planned));
    }

    #[test]
    fn test_same_id_set_detects_foreign_block() {
        let committed = ids(&["MDA=", "ZZZ="]);
        let planned = ids(&["MDA=", "MDE="]);
        assert!(!same_id_set(&committed, &planned));
    }

    #[test]
    fn test_same_id_set_empty_plans_match() {
        assert!(same_id_set(&[], &[]));
    }

    #[test]
    fn test_block_id_query_escaping() {
        // Base64 padding must be escaped in the blockid query component.
        let escaped = utf8_percent_encode("MDA=", QUERY_ENCODE_SET).to_string();
        assert_eq!(escaped, "MDA%3D");
        let escaped = utf8_percent_encode("a+b/c=", QUERY_ENCODE_SET).to_string();
        assert_eq!(escaped, "a%2Bb%2Fc%3D");
    }
}
