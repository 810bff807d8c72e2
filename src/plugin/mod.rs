//! # Plugins
//!
//! Out-of-process extensions reached over HTTP-JSON. A plugin implements any
//! subset of the lifecycle hooks; methods it does not implement are detected
//! from a 404 and skipped from then on.
//!
//! ```rust,no_run
//! use flowmill_core::config::PluginsConfig;
//! use flowmill_core::plugin::PluginSet;
//!
//! # fn example(config: &PluginsConfig) -> Result<(), flowmill_core::plugin::PluginError> {
//! let plugins = PluginSet::from_config(config)?;
//! println!("{} plugins configured", plugins.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod configmap;
pub mod errors;
pub mod hooks;

pub use client::PluginClient;
pub use configmap::{ExecutorPlugin, PluginContainer, PluginSidecar};
pub use errors::{PluginError, PluginResult};
pub use hooks::{PluginSet, WorkflowRef};
