//! # Deployments
//!
//! Long-running services built from a deployment template. A deployment
//! reserves fixtures and volumes from the fixture manager and cpu/memory
//! from admission control, then asks the runtime to materialize it.
//!
//! ## Lifecycle
//!
//! ```text
//! Init ──► Waiting ──► Active ◄──► Error
//!   │         │          │
//!   │         └──────────┴──► Upgrading ──► Active
//!   │                    │
//!   │                    ├──► Stopping ──► Stopped ──► Waiting
//!   │                    │
//!   └────────────────────┴──► Terminating ──► Terminated
//! ```
//!
//! Every operation on one deployment runs under its key's lock from a shared
//! [`LockGroup`](crate::lock_group::LockGroup), so the monitor, the
//! heartbeat processor and API calls never interleave on the same
//! deployment.
//!
//! ## Components
//!
//! - [`DeploymentManager`]: create, upgrade, scale, stop, start, terminate
//! - [`DeploymentMonitor`]: periodic reconciliation and termination policy
//! - [`ReservationExtender`]: keeps admission reservations from expiring
//! - [`resources`]: reservation envelopes, including rolling-update peaks

pub mod collaborators;
pub mod errors;
pub mod lifecycle;
pub mod monitor;
pub mod resources;
pub mod types;

pub use collaborators::{
    AdmissionControl, DeploymentRuntime, DeploymentStore, FixtureManager, InMemoryAdmission,
    InMemoryDeploymentRuntime, InMemoryDeploymentStore, InMemoryFixtureManager, Reservation,
};
pub use errors::{CollaboratorError, DeploymentError, DeploymentResult};
pub use lifecycle::{commit_state, DeploymentManager};
pub use monitor::{DeploymentMonitor, ReservationExtender};
pub use resources::{calculate_max_resource, max_resources, max_resources_for_upgrade};
pub use types::{Deployment, RuntimeStatus};
