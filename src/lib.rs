//! Worker-side client for a Faktory-style TCP job-queue broker.
//!
//! The crate pushes jobs for later execution and, symmetrically, pulls jobs
//! assigned to a worker, dispatches them to registered handlers under a
//! concurrency bound, and reports completion or failure back to the broker.
//! A single control thread drives all socket I/O and engine state; handler
//! executions run on worker pool threads and communicate results only through
//! pollable task handles.

pub mod auth;
pub mod config;
pub mod connection;
pub mod job;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use config::{BrokerUri, ConfigError, WorkerConfig};
pub use connection::{Connection, ConnectionError};
pub use job::{ConnectOptions, Handshake, Job};
pub use pool::{TaskFault, TaskHandle, TaskOutcome, WorkerPool};
pub use registry::{Handler, HandlerError, Task, TaskRegistry};
pub use shutdown::ShutdownHooks;
pub use worker::{Worker, WorkerError};
