//! # Artifact Drivers
//!
//! Upload, download, list and delete artifacts against pluggable storage
//! backends.
//!
//! ## Overview
//!
//! - [`BlobDriver`]: S3, GCS, Azure Blob and local files through `object_store`
//! - [`WebHdfsDriver`]: HDFS through the WebHDFS REST interface
//! - [`RetryingDriver`]: wraps any driver with the driver backoff profile
//!
//! Missing keys and empty prefixes surface as [`ArtifactError::NotFound`], which
//! is never retried. Network failures surface as `Transient` and are retried
//! up to the profile's step budget.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flowmill_core::artifacts::{Artifact, ArtifactLocation, DefaultDriverFactory, DriverFactory};
//!
//! # async fn example() -> Result<(), flowmill_core::artifacts::ArtifactError> {
//! let location = ArtifactLocation::parse_uri("s3://builds/app/bin.tgz")?;
//! let driver = DefaultDriverFactory::default().driver_for(&location)?;
//! driver
//!     .load(&Artifact::new("bin", location), std::path::Path::new("/tmp/bin.tgz"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod driver;
pub mod errors;
pub mod hdfs;
pub mod retry;
pub mod types;

pub use blob::BlobDriver;
pub use driver::{normalize_key, ArtifactDriver, ByteStream, DriverFactory, SingleDriverFactory};
pub use errors::{ArtifactError, ArtifactResult};
pub use hdfs::WebHdfsDriver;
pub use retry::{DefaultDriverFactory, RetryingDriver};
pub use types::{ArchiveMode, Artifact, ArtifactGcStrategy, ArtifactLocation};
