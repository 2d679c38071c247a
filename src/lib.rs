//! Azure Blob Storage client with parallel block-level transfer.
//!
//! This crate presents blob containers and individual blobs through a
//! POSIX-like surface (create/list/remove containers; read/write/copy/
//! remove blobs) while delivering throughput via block-sliced parallel
//! uploads and range-sliced parallel downloads.  Every request runs through
//! a retry classifier that honors service throttling, and all workers of a
//! handle share one refreshable OAuth2 [`Session`].
//!
//! ```no_run
//! # async fn example() -> azblob::Result<()> {
//! use azblob::{Container, ContainerOptions, Credential, Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig {
//!     tenant: "my-tenant".into(),
//!     client_id: "my-client".into(),
//!     scope: "offline_access".into(),
//!     resource: "https://storage.azure.com".into(),
//!     credential: Credential::ClientCredentials { client_secret: "...".into() },
//!     bearer: "...".into(),
//!     refresh_token: None,
//!     expiry_unix_seconds: 0,
//! });
//!
//! let container = Container::new(
//!     "myaccount",
//!     "mycontainer",
//!     "some/prefix",
//!     session,
//!     ContainerOptions::default(),
//! )?;
//! container.create().await?;
//! container.write("hello.bin", vec![1u8, 2, 3]).await?;
//! let data = container.read("hello.bin").await?;
//! assert_eq!(&data[..], &[1, 2, 3]);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod config;
pub mod container;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod session;
pub mod transfer;
pub mod xml;

mod rest;

pub use blob::Blob;
pub use config::ContainerOptions;
pub use container::{list_containers, Container, ContainerRef};
pub use errors::{AzError, Result, TransportError};
pub use metrics::{get_perf_counters, reset_perf_counters, PerfCounters};
pub use rest::API_VERSION;
pub use session::{Credential, Session, SessionConfig};
pub use transfer::plan::{
    plan_blocks, BlockPlan, MAX_BLOCK_BYTES, MAX_BLOCK_COUNT, MIN_BLOCK_BYTES,
};
