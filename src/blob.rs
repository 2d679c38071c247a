//! Blob handles.
//!
//! A [`Blob`] is a container handle plus a name: pure addressing, no open
//! file state and no position cursor.  Every operation delegates to the
//! container's verb set, so two handles built from equal containers and
//! equal names behave identically.

use std::path::Path;

use bytes::Bytes;

use crate::container::Container;
use crate::errors::Result;

/// Handle to one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    container: Container,
    name: String,
}

impl Blob {
    pub fn new(container: Container, name: impl Into<String>) -> Self {
        Blob {
            container,
            name: name.into(),
        }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified path of this blob, prefix included.
    pub fn path(&self) -> String {
        format!("{}/{}", self.container.dirname(), self.name)
    }

    /// Write `data` as the blob's full contents, creating or overwriting it.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.container.write(&self.name, data).await
    }

    /// Write `text` with a text content type.
    pub async fn write_string(&self, text: &str) -> Result<()> {
        self.container.write_string(&self.name, text).await
    }

    /// Read the blob's full contents.
    pub async fn read(&self) -> Result<Bytes> {
        self.container.read(&self.name).await
    }

    /// Read the blob's full contents as UTF-8 text.
    pub async fn read_string(&self) -> Result<String> {
        self.container.read_string(&self.name).await
    }

    /// Fill `buffer` with `buffer.len()` bytes starting at `offset`.
    pub async fn read_into(&self, buffer: &mut [u8], offset: u64) -> Result<()> {
        self.container.read_into(&self.name, buffer, offset).await
    }

    /// Size in bytes, or `None` when the blob does not exist.
    pub async fn stat(&self) -> Result<Option<u64>> {
        self.container.stat(&self.name).await
    }

    /// Size in bytes, failing when the blob does not exist.
    pub async fn size(&self) -> Result<u64> {
        self.container.blob_size(&self.name).await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.container.blob_exists(&self.name).await
    }

    /// Delete the blob.  Deleting an absent blob is not an error.
    pub async fn delete(&self) -> Result<()> {
        self.container.delete_blob(&self.name).await
    }

    /// Create the blob with a single null byte.
    pub async fn touch(&self) -> Result<()> {
        self.container.touch(&self.name).await
    }

    /// Server-side copy into `destination`.
    pub async fn copy_to(&self, destination: &Blob) -> Result<()> {
        self.container
            .copy_blob_to(&self.name, &destination.container, &destination.name)
            .await
    }

    /// Copy a local file into the blob through the double-buffered pipeline.
    pub async fn upload_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.container.upload_from_file(&self.name, path).await
    }

    /// Copy the blob into a local file through the double-buffered pipeline.
    pub async fn download_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.container.download_to_file(&self.name, path).await
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerOptions;
    use crate::session::{Credential, Session, SessionConfig};

    fn test_container(name: &str, prefix: &str) -> Container {
        let session = Session::new(SessionConfig {
            tenant: "tenant".to_string(),
            client_id: "client".to_string(),
            scope: "scope".to_string(),
            resource: "https://storage.azure.com".to_string(),
            credential: Credential::ManagedIdentity,
            bearer: "bearer".to_string(),
            refresh_token: None,
            expiry_unix_seconds: u64::MAX,
        });
        Container::new("acct", name, prefix, session, ContainerOptions::default()).unwrap()
    }

    #[test]
    fn test_blob_path_includes_prefix() {
        let blob = Blob::new(test_container("ct", "p"), "k1");
        assert_eq!(blob.path(), "ct/p/k1");
        assert_eq!(blob.name(), "k1");
    }

    #[test]
    fn test_blob_path_without_prefix() {
        let blob = Blob::new(test_container("ct", ""), "k1");
        assert_eq!(blob.path(), "ct/k1");
    }

    #[test]
    fn test_blob_equality_is_addressing() {
        let a = Blob::new(test_container("ct", "p"), "k1");
        let b = Blob::new(test_container("ct", "p"), "k1");
        assert_eq!(a, b);
        assert_ne!(a, Blob::new(test_container("ct", "p"), "k2"));
        assert_ne!(a, Blob::new(test_container("ct", "q"), "k1"));
    }
}
