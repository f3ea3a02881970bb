//! # grv-core
//!
//! Core library for grv - an automated code-review daemon for Gerrit that
//! dispatches new patchsets to an AI CLI backend.
//!
//! This crate provides the building blocks the `grv` binary wires together:
//!
//! - **Event stream**: consume Gerrit `stream-events` over SSH with
//!   automatic reconnect
//! - **Filtering**: project allow/deny rules for incoming events
//! - **Task queue**: bounded, deduplicating queue with an optional
//!   latest-patchset-wins mode
//! - **Review pipeline**: checkout a patchset, drive the AI backend, report
//!   rate-limit failures back to Gerrit
//! - **Worker pool**: concurrent task execution with cooperative shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use grv_core::queue::{Task, TaskQueue};
//!
//! let queue = TaskQueue::new(100, false);
//! let task = Task::new("tools/build", 12345, 3, "Fix flaky test");
//! queue.push(task).expect("queue has capacity");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod events;
pub mod gerrit;
pub mod pool;
pub mod queue;
pub mod repo;
pub mod review;

pub use config::Config;
pub use queue::{Task, TaskQueue};
