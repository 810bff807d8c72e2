//! # Workflows
//!
//! The workflow object, its node tree, and the machinery that drives it:
//!
//! - [`types`]: workflow, spec, status and nodes
//! - [`pod`]: pod specs built for container nodes, termination messages
//! - [`runtime`]: the pod runtime seam and its in-memory implementation
//! - [`store`]: the workflow object store
//! - [`operator`]: one reconcile pass
//! - [`controller`]: worker pool and user operations
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowmill_core::config::{ControllerConfig, WorkflowConfig};
//! use flowmill_core::events::publisher::EventPublisher;
//! use flowmill_core::persistence::DisabledOffloadRepo;
//! use flowmill_core::repository::{InMemoryConfigMaps, RepositoryResolver};
//! use flowmill_core::workflow::{
//!     InMemoryPodRuntime, InMemoryWorkflowStore, WorkflowController, WorkflowOperator,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let resolver = RepositoryResolver::new(Arc::new(InMemoryConfigMaps::new()), "flowmill", None);
//! let operator = WorkflowOperator::new(
//!     Arc::new(InMemoryPodRuntime::new()),
//!     Arc::new(DisabledOffloadRepo),
//!     Arc::new(resolver),
//!     EventPublisher::new(100),
//!     WorkflowConfig::default(),
//! );
//! let controller = Arc::new(WorkflowController::new(
//!     Arc::new(InMemoryWorkflowStore::new()),
//!     Arc::new(operator),
//!     ControllerConfig::default(),
//! ));
//! let shutdown = CancellationToken::new();
//! let workers = controller.run(shutdown.clone());
//! # drop(workers);
//! # }
//! ```

pub mod controller;
pub mod errors;
pub mod operator;
pub mod pod;
pub mod runtime;
pub mod store;
pub mod types;

pub use controller::WorkflowController;
pub use errors::{RuntimeError, WorkflowError, WorkflowResult};
pub use operator::{ReconcileOutcome, WorkflowOperator};
pub use pod::{ArtifactDownload, ArtifactUpload, PodSpec};
pub use runtime::{InMemoryPodRuntime, PodObservation, PodPhase, PodRuntime};
pub use store::{InMemoryWorkflowStore, WorkflowStore};
pub use types::{
    node_id, NodeIo, NodeStatus, NodeType, Nodes, TtlStrategy, Workflow, WorkflowSpec,
    WorkflowStatus,
};

pub use crate::state_machine::{NodePhase, WorkflowPhase};
