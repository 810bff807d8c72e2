//! # Garbage collection
//!
//! Background collectors that clean up after finished workflows:
//!
//! - [`TtlController`] deletes completed workflows once their TTL strategy expires
//! - [`ArtifactGcController`] deletes output artifacts with an `artifact_gc`
//!   strategy and removes the artifact-GC finalizer
//! - [`OffloadGc`] periodically drops offloaded node-status maps that no live
//!   workflow references
//! - [`RetentionGc`] caps the number of finished workflows kept per phase
//!
//! Each collector is started with a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and stops when it is cancelled.

pub mod artifact_gc;
pub mod errors;
pub mod offload_gc;
pub mod retention;
pub mod ttl;

pub use artifact_gc::{
    applicable_strategies, ensure_artifact_gc_finalizer, has_artifact_gc, location_for,
    ArtifactGcController, ArtifactGcOutcome,
};
pub use errors::{GcError, GcResult};
pub use offload_gc::OffloadGc;
pub use retention::{RetentionGc, RetentionPolicy};
pub use ttl::{expires_in, TtlController};

/// Work-queue key for a workflow
pub(crate) fn workflow_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
