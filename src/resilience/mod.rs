//! # Resilience Module
//!
//! Bounded exponential backoff and transient-failure classification shared by
//! artifact drivers, the persistence layer, task-set updates and reconcilers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flowmill_core::resilience::{retry_on, Backoff};
//!
//! # async fn example() -> Result<(), std::io::Error> {
//! let value = retry_on(&Backoff::DRIVER, |e: &std::io::Error| {
//!     flowmill_core::resilience::classifier::is_transient_io(e)
//! }, || async { Ok::<u32, std::io::Error>(7) })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod classifier;

pub use backoff::{retry_on, Backoff};
