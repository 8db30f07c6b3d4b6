//! # queuectl-core - Durable local job queue engine
//!
//! This crate provides the engine behind the `queuectl` tool:
//! - `Store`: SQLite persistence plus the atomic claim/settle primitives
//! - `Executor`: shell command execution with timeout and output capture
//! - `retry`: exponential backoff and the dead-letter threshold
//! - `Worker` / `WorkerPool`: the poll/claim/execute/settle loop and its
//!   supervisor
//! - `DlqManager`: dead-letter inspection and re-enqueue
//!
//! Multiple worker processes may share one database file; all coordination
//! goes through row-level atomic updates, with time-bounded leases standing
//! in for cross-process locks.

mod config;
mod dlq;
mod error;
mod executor;
mod job;
mod pool;
pub mod retry;
mod store;
mod worker;

// Re-export main types
pub use config::{keys, stop_requested, Settings};
pub use dlq::DlqManager;
pub use error::{QueueError, Result};
pub use executor::{ExecOutcome, Executor, MAX_CAPTURED_OUTPUT};
pub use job::{unix_now, Job, JobState, WorkerInfo};
pub use pool::WorkerPool;
pub use retry::RetryDecision;
pub use store::Store;
pub use worker::Worker;
