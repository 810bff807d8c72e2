#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flowmill Core
//!
//! Controller core for container workflows and long-running deployments.
//!
//! ## Overview
//!
//! Flowmill reconciles declarative templates against a cluster runtime. Workflows
//! are templates expanded into a node graph that is driven to completion; deployments
//! are long-lived services with an admission-controlled resource reservation that is
//! kept fresh by a monitor loop and by heartbeats from their pods.
//!
//! ## Module Organization
//!
//! - [`template`] - Template model, parsing, parameter substitution and validation
//! - [`artifacts`] - Artifact locations and storage drivers (object stores, HDFS, local files)
//! - [`repository`] - Artifact repository resolution from config maps
//! - [`persistence`] - SQL offload of large node-status maps and the workflow archive
//! - [`workflow`] - Workflow operator, controller and the workflow store
//! - [`deployment`] - Deployment lifecycle, monitor and reservation extender
//! - [`heartbeat`] - Heartbeat ingestion and the per-deployment instance cache
//! - [`gc`] - TTL, artifact, offload and retention garbage collection
//! - [`taskset`] - Task-set agent reporting node results back to workflows
//! - [`plugin`] - RPC executor plugins discovered from config maps
//! - [`state_machine`] - Node, workflow and deployment state machines
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`events`] - Lifecycle event broadcast
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowmill_core::config::ConfigManager;
//! use flowmill_core::logging::init_structured_logging;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! init_structured_logging();
//! let manager = ConfigManager::load()?;
//! println!("workflow workers: {}", manager.config().controller.workflow_workers);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```
//!
//! The SQL persistence tests run only when `FLOWMILL_TEST_DATABASE_URL` is set.

pub mod artifacts;
pub mod config;
pub mod constants;
pub mod deployment;
pub mod error;
pub mod events;
pub mod gc;
pub mod heartbeat;
pub mod lock_group;
pub mod logging;
pub mod objects;
pub mod persistence;
pub mod plugin;
pub mod repository;
pub mod resilience;
pub mod state_machine;
pub mod taskset;
pub mod template;
pub mod workflow;
pub mod workqueue;

pub use config::{ConfigManager, FlowmillConfig};
pub use constants::{StatusCode, TerminalStatus};
pub use error::{ErrorKind, FlowmillError, Result};
pub use state_machine::{DeploymentState, NodePhase, WorkflowPhase};
