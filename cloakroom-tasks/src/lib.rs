//! Task execution for the Cloakroom session store.
//!
//! Provides the two execution primitives the store's background machinery
//! runs on:
//!
//! - [`TaskScheduler`] - a bounded worker pool plus named periodic jobs,
//!   used by the repository cleanup sweeps and the expiration listener
//! - [`FibonacciBackoff`] - the reconnect delay policy for the blocking
//!   notification subscription
//!
//! The scheduler is an owned, injected service with an explicit lifecycle:
//! the host application constructs it at startup, passes it to the
//! repositories and expiration strategies, and calls
//! [`TaskScheduler::shutdown`] when tearing down.
//!
//! # Examples
//!
//! ```no_run
//! use cloakroom_tasks::TaskScheduler;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), cloakroom_tasks::TaskError> {
//! let scheduler = TaskScheduler::new();
//!
//! scheduler.schedule_periodic(
//!     "expired-session-sweep",
//!     Duration::from_secs(60),
//!     Duration::from_secs(60),
//!     || async {
//!         // scan and purge
//!         Ok(())
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod error;
pub mod scheduler;

pub use backoff::{BackoffAction, FibonacciBackoff};
pub use error::{TaskError, TaskResult};
pub use scheduler::{SchedulerConfig, TaskScheduler};
