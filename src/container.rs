//! Container and blob addressing plus the POSIX-like verb set.
//!
//! A [`Container`] is pure addressing: `(storage_account, container_name,
//! prefix)` plus a shared [`Session`] and per-handle options.  Handles are
//! cheap to clone and compare equal on the addressing triple alone.  Blob
//! names are virtual paths under the handle's prefix; the service has no
//! real directories, so listing filters on that prefix and `remove` only
//! deletes the container once nothing else lives in it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ContainerOptions;
use crate::errors::{AzError, Result};
use crate::rest::{RestClient, RestResponse};
use crate::retry::{with_retry, AttemptFailure};
use crate::session::Session;
use crate::transfer::{download, pipeline, upload};
use crate::xml;

const BLOB_ENDPOINT_SUFFIX: &str = "blob.core.windows.net";

/// Percent-encoding set for blob paths: unreserved characters and `/` pass
/// through (the service expects `/` unencoded in blob paths).
pub(crate) const BLOB_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Encoding set for query components (block ids, markers, prefixes).
pub(crate) const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Minimal serializable identity of a container handle.  Reconstructing a
/// usable handle additionally needs a session, which is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub storage_account: String,
    pub container_name: String,
    pub prefix: String,
}

/// Handle to one container (optionally scoped to a virtual directory).
#[derive(Debug, Clone)]
pub struct Container {
    storage_account: String,
    container_name: String,
    prefix: String,
    session: Session,
    rest: Arc<RestClient>,
    options: ContainerOptions,
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.storage_account == other.storage_account
            && self.container_name == other.container_name
            && self.prefix == other.prefix
    }
}

impl Eq for Container {}

impl Container {
    /// Create a handle for `container_name` in `storage_account`.
    ///
    /// A `container_name` containing `/` is split: the first segment is the
    /// container, the remainder is appended to `prefix`.
    pub fn new(
        storage_account: impl Into<String>,
        container_name: &str,
        prefix: &str,
        session: Session,
        mut options: ContainerOptions,
    ) -> Result<Self> {
        if cfg!(target_family = "wasm") && options.n_threads > 1 {
            warn!("multi-threaded transport unavailable on this platform, forcing n_threads = 1");
            options.n_threads = 1;
        }
        let (container_name, name_suffix) = split_container_name(container_name);
        let prefix = join_prefix(prefix, &name_suffix);
        let rest = Arc::new(RestClient::new(
            Duration::from_secs(options.connect_timeout_s),
            Duration::from_secs(options.read_timeout_s),
            options.verbosity,
        )?);
        Ok(Container {
            storage_account: storage_account.into(),
            container_name,
            prefix,
            session,
            rest,
            options,
        })
    }

    /// Rebuild a handle from its persisted identity and an external session.
    pub fn from_ref(
        reference: &ContainerRef,
        session: Session,
        options: ContainerOptions,
    ) -> Result<Self> {
        Container::new(
            reference.storage_account.clone(),
            &reference.container_name,
            &reference.prefix,
            session,
            options,
        )
    }

    /// Persisted identity of this handle.
    pub fn to_ref(&self) -> ContainerRef {
        ContainerRef {
            storage_account: self.storage_account.clone(),
            container_name: self.container_name.clone(),
            prefix: self.prefix.clone(),
        }
    }

    pub fn storage_account(&self) -> &str {
        &self.storage_account
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Container plus prefix as one virtual path.
    pub fn dirname(&self) -> String {
        if self.prefix.is_empty() {
            self.container_name.clone()
        } else {
            format!("{}/{}", self.container_name, self.prefix)
        }
    }

    pub(crate) fn options(&self) -> &ContainerOptions {
        &self.options
    }

    pub(crate) fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub(crate) async fn fresh_token(&self) -> Result<String> {
        self.session
            .fresh_token(&self.rest, self.options.n_retries)
            .await
    }

    // -- Addressing -----------------------------------------------------------

    fn account_url(&self) -> String {
        format!("https://{}.{}", self.storage_account, BLOB_ENDPOINT_SUFFIX)
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.account_url(), self.container_name)
    }

    /// Full URL of `blob` under this handle's prefix.
    pub(crate) fn blob_url(&self, blob: &str) -> String {
        self.qualified_blob_url(&addprefix(&self.prefix, blob))
    }

    fn qualified_blob_url(&self, qualified: &str) -> String {
        format!(
            "{}/{}",
            self.container_url(),
            utf8_percent_encode(qualified, BLOB_PATH_ENCODE_SET)
        )
    }

    /// Error-context path of `blob`.
    pub(crate) fn blob_resource(&self, blob: &str) -> String {
        format!("{}/{}", self.container_name, addprefix(&self.prefix, blob))
    }

    // -- Container operations -------------------------------------------------

    /// Create the container.  Idempotent: an existing container (whether
    /// found by listing or lost to a concurrent creator) is success.
    pub async fn create(&self) -> Result<()> {
        let existing = list_account_containers(
            &self.rest,
            &self.session,
            &self.storage_account,
            self.options.n_retries,
        )
        .await?;
        if existing.iter().any(|name| name == &self.container_name) {
            debug!(container = %self.container_name, "container already present");
            return Ok(());
        }
        let url = format!("{}?restype=container", self.container_url());
        match self
            .simple_request(
                "create container",
                Method::PUT,
                &url,
                self.container_name.clone(),
                Vec::new(),
                Some(Bytes::new()),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.http_status() == Some(409) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Whether the container exists on the service.
    pub async fn exists(&self) -> Result<bool> {
        let url = format!("{}?restype=container", self.container_url());
        match self
            .simple_request(
                "stat container",
                Method::GET,
                &url,
                self.container_name.clone(),
                Vec::new(),
                None,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.http_status() == Some(404) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove the handle's scope.
    ///
    /// With a prefix, every blob under it is deleted and the container
    /// itself only goes away once no other blobs remain.  Without a prefix
    /// the container is deleted outright.
    pub async fn remove(&self) -> Result<()> {
        if !self.prefix.is_empty() {
            for name in self.list_qualified(Some(&self.prefix)).await? {
                self.delete_qualified(&name).await?;
            }
            let remaining = self.list_qualified(None).await?;
            if remaining.is_empty() {
                self.delete_container().await?;
            } else {
                debug!(
                    container = %self.container_name,
                    remaining = remaining.len(),
                    "container kept: blobs remain outside the prefix"
                );
            }
            return Ok(());
        }
        self.delete_container().await
    }

    async fn delete_container(&self) -> Result<()> {
        let url = format!("{}?restype=container", self.container_url());
        self.simple_request(
            "remove container",
            Method::DELETE,
            &url,
            self.container_name.clone(),
            Vec::new(),
            None,
        )
        .await
        .map(|_| ())
    }

    /// List blob names under the handle's prefix.
    ///
    /// With `filterlist`, names come back relative to the prefix; without
    /// it, fully qualified.
    pub async fn list_blobs(&self, filterlist: bool) -> Result<Vec<String>> {
        let filter = if self.prefix.is_empty() {
            None
        } else {
            Some(self.prefix.as_str())
        };
        let names = self.list_qualified(filter).await?;
        if filterlist {
            Ok(strip_listing_prefix(names, &self.prefix))
        } else {
            Ok(names)
        }
    }

    /// One paginated listing pass, optionally filtered to `prefix/`.
    async fn list_qualified(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = format!("{}?restype=container&comp=list", self.container_url());
            if let Some(prefix) = prefix {
                url.push_str(&format!(
                    "&prefix={}",
                    utf8_percent_encode(&format!("{prefix}/"), QUERY_ENCODE_SET)
                ));
            }
            if let Some(marker) = &marker {
                url.push_str(&format!(
                    "&marker={}",
                    utf8_percent_encode(marker, QUERY_ENCODE_SET)
                ));
            }
            let response = self
                .simple_request(
                    "list blobs",
                    Method::GET,
                    &url,
                    self.container_name.clone(),
                    Vec::new(),
                    None,
                )
                .await?;
            let page = xml::parse_blob_list(&response.body)?;
            names.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(names)
    }

    // -- Blob operations ------------------------------------------------------

    /// Size of `blob` in bytes, or `None` when it does not exist.
    pub async fn stat(&self, blob: &str) -> Result<Option<u64>> {
        let url = self.blob_url(blob);
        let response = match self
            .simple_request(
                "stat blob",
                Method::HEAD,
                &url,
                self.blob_resource(blob),
                Vec::new(),
                None,
            )
            .await
        {
            Ok(response) => response,
            Err(err) if err.http_status() == Some(404) => return Ok(None),
            Err(err) => return Err(err),
        };
        let length = response
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| AzError::InvalidResponse {
                operation: "stat blob",
                detail: "missing or unparseable Content-Length".to_string(),
            })?;
        Ok(Some(length))
    }

    /// Size of `blob`, failing when it does not exist.
    pub async fn blob_size(&self, blob: &str) -> Result<u64> {
        self.stat(blob).await?.ok_or_else(|| AzError::Service {
            operation: "stat blob",
            resource: self.blob_resource(blob),
            status: 404,
            code: Some("BlobNotFound".to_string()),
        })
    }

    /// Whether `blob` exists.  Any failure other than 404 propagates.
    pub async fn blob_exists(&self, blob: &str) -> Result<bool> {
        let url = format!("{}?comp=metadata", self.blob_url(blob));
        match self
            .simple_request(
                "stat blob",
                Method::GET,
                &url,
                self.blob_resource(blob),
                Vec::new(),
                None,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.http_status() == Some(404) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete `blob`.  Deleting an absent blob is not an error.
    pub async fn delete_blob(&self, blob: &str) -> Result<()> {
        self.delete_qualified(&addprefix(&self.prefix, blob)).await
    }

    async fn delete_qualified(&self, qualified: &str) -> Result<()> {
        let url = self.qualified_blob_url(qualified);
        let resource = format!("{}/{qualified}", self.container_name);
        match self
            .simple_request("delete blob", Method::DELETE, &url, resource, Vec::new(), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.http_status() == Some(404) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Replicate every blob under this handle's scope into `destination`
    /// via server-side copies, preserving names relative to each prefix.
    /// Returns the number of blobs copied.
    pub async fn copy_all_to(&self, destination: &Container) -> Result<usize> {
        let names = self.list_blobs(true).await?;
        for name in &names {
            self.copy_blob_to(name, destination, name).await?;
        }
        Ok(names.len())
    }

    /// Server-side copy of `blob` into `destination`.
    pub async fn copy_blob_to(
        &self,
        blob: &str,
        destination: &Container,
        destination_blob: &str,
    ) -> Result<()> {
        let source_url = self.blob_url(blob);
        let url = destination.blob_url(destination_blob);
        destination
            .simple_request(
                "copy blob",
                Method::PUT,
                &url,
                destination.blob_resource(destination_blob),
                vec![("x-ms-copy-source", source_url)],
                Some(Bytes::new()),
            )
            .await
            .map(|_| ())
    }

    /// Write `data` as the full contents of `blob`, creating or overwriting
    /// it.
    pub async fn write(&self, blob: &str, data: impl Into<Bytes>) -> Result<()> {
        upload::writebytes(self, blob, data.into(), upload::OCTET_STREAM).await
    }

    /// Write `text` as the full contents of `blob` with a text content type.
    pub async fn write_string(&self, blob: &str, text: &str) -> Result<()> {
        upload::writebytes(
            self,
            blob,
            Bytes::copy_from_slice(text.as_bytes()),
            "text/plain",
        )
        .await
    }

    /// Create `blob` with a single null byte.
    ///
    /// A zero-length PUT is accepted by the service but indistinguishable
    /// from an absent blob on some query paths, so touch writes one byte.
    pub async fn touch(&self, blob: &str) -> Result<()> {
        self.write(blob, Bytes::from_static(&[0u8])).await
    }

    /// Read the full contents of `blob`.
    pub async fn read(&self, blob: &str) -> Result<Bytes> {
        let size = self.blob_size(blob).await?;
        let mut buffer = vec![0u8; size as usize];
        download::readbytes_into(self, blob, &mut buffer, 0).await?;
        Ok(Bytes::from(buffer))
    }

    /// Read the full contents of `blob` as UTF-8 text.
    pub async fn read_string(&self, blob: &str) -> Result<String> {
        let data = self.read(blob).await?;
        String::from_utf8(data.to_vec()).map_err(|e| AzError::InvalidResponse {
            operation: "read blob",
            detail: format!("blob is not valid utf-8: {e}"),
        })
    }

    /// Fill `buffer` with `buffer.len()` bytes of `blob` starting at
    /// `offset`.  On failure the buffer's contents are unspecified.
    pub async fn read_into(&self, blob: &str, buffer: &mut [u8], offset: u64) -> Result<()> {
        download::readbytes_into(self, blob, buffer, offset).await
    }

    /// Copy a local file into `blob` through the double-buffered pipeline.
    pub async fn upload_from_file(&self, blob: &str, path: impl AsRef<Path>) -> Result<()> {
        pipeline::upload_from_file(self, blob, path.as_ref(), None).await
    }

    /// Like [`Container::upload_from_file`] with an explicit total scratch
    /// buffer size in bytes.
    pub async fn upload_from_file_buffered(
        &self,
        blob: &str,
        path: impl AsRef<Path>,
        buffer_bytes: u64,
    ) -> Result<()> {
        pipeline::upload_from_file(self, blob, path.as_ref(), Some(buffer_bytes)).await
    }

    /// Copy `blob` into a local file through the double-buffered pipeline.
    pub async fn download_to_file(&self, blob: &str, path: impl AsRef<Path>) -> Result<()> {
        pipeline::download_to_file(self, blob, path.as_ref(), None).await
    }

    /// Like [`Container::download_to_file`] with an explicit total scratch
    /// buffer size in bytes.
    pub async fn download_to_file_buffered(
        &self,
        blob: &str,
        path: impl AsRef<Path>,
        buffer_bytes: u64,
    ) -> Result<()> {
        pipeline::download_to_file(self, blob, path.as_ref(), Some(buffer_bytes)).await
    }

    // -- Plumbing -------------------------------------------------------------

    /// One retried request through the handle's session and rest client.
    async fn simple_request(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        resource: String,
        headers: Vec<(&'static str, String)>,
        body: Option<Bytes>,
    ) -> Result<RestResponse> {
        with_retry(operation, &resource, self.options.n_retries, || {
            let method = method.clone();
            let headers = headers.clone();
            let body = body.clone();
            async move {
                let bearer = self.fresh_token().await.map_err(AttemptFailure::Fatal)?;
                self.rest
                    .storage_request(method, url, &bearer, &headers, body)
                    .await
            }
        })
        .await
    }
}

/// List the containers of `storage_account` visible to `session`.
pub async fn list_containers(
    storage_account: &str,
    session: &Session,
    options: &ContainerOptions,
) -> Result<Vec<String>> {
    let rest = RestClient::new(
        Duration::from_secs(options.connect_timeout_s),
        Duration::from_secs(options.read_timeout_s),
        options.verbosity,
    )?;
    list_account_containers(&rest, session, storage_account, options.n_retries).await
}

/// Marker-paginated account-scope container listing.
async fn list_account_containers(
    rest: &RestClient,
    session: &Session,
    storage_account: &str,
    n_retries: u32,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let mut url = format!("https://{storage_account}.{BLOB_ENDPOINT_SUFFIX}/?comp=list");
        if let Some(marker) = &marker {
            url.push_str(&format!(
                "&marker={}",
                utf8_percent_encode(marker, QUERY_ENCODE_SET)
            ));
        }
        let response = with_retry("list containers", storage_account, n_retries, || {
            let url = &url;
            async move {
                let bearer = session
                    .fresh_token(rest, n_retries)
                    .await
                    .map_err(AttemptFailure::Fatal)?;
                rest.storage_request(Method::GET, url, &bearer, &[], None)
                    .await
            }
        })
        .await?;
        let page = xml::parse_container_list(&response.body)?;
        names.extend(page.names);
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => break,
        }
    }
    Ok(names)
}

// -- Naming helpers -----------------------------------------------------------

/// Split a raw container name on its first `/`: the head is the container,
/// the tail joins the prefix.
fn split_container_name(raw: &str) -> (String, String) {
    match raw.split_once('/') {
        Some((container, rest)) => (container.to_string(), rest.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

fn join_prefix(base: &str, extra: &str) -> String {
    let joined = match (base.is_empty(), extra.is_empty()) {
        (true, true) => return String::new(),
        (true, false) => extra.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{extra}"),
    };
    normalize_path(&joined.replace('\\', "/"))
}

/// Prepend the handle prefix to an object name.
///
/// With an empty prefix the name passes through untouched; otherwise the
/// joined path is normalized with backslashes rewritten to forward slashes.
pub(crate) fn addprefix(prefix: &str, object: &str) -> String {
    if prefix.is_empty() {
        return object.to_string();
    }
    normalize_path(&format!("{prefix}/{object}").replace('\\', "/"))
}

/// Collapse `.`, `..`, and duplicate separators.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Strip `prefix/` from names that carry it; used by filtered listings.
fn strip_listing_prefix(names: Vec<String>, prefix: &str) -> Vec<String> {
    if prefix.is_empty() {
        return names;
    }
    let strip = format!("{prefix}/");
    names
        .into_iter()
        .map(|name| match name.strip_prefix(&strip) {
            Some(stripped) => stripped.to_string(),
            None => name,
        })
        .collect()
}

// -- Tests --------------------------------------------------------------------
