//! # Lifecycle Events
//!
//! In-process broadcast of workflow, node, deployment and GC lifecycle events.

pub mod publisher;

pub use publisher::{EventPublisher, PublishError, PublishedEvent};
