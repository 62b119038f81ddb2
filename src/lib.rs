//! Capacity-aware asynchronous task scheduler.
//!
//! This library multiplexes caller-supplied units of work over an abstract
//! *capacity* budget while honoring priority, ageing, per-task and global
//! timeouts, retry policies, and periodic capacity-release rules.
//!
//! ## Key components
//!
//! - **Scheduler**: the admission and dispatch engine, run as a single
//!   background actor so scheduler steps never interleave
//! - **Capacity accounting**: reserve or claim strategies against an
//!   optional `max_capacity`, plus a concurrency ceiling
//! - **Release rules**: periodic reset/reduce rules that hand capacity back,
//!   with catch-up after idle periods
//! - **Failure recovery**: exponential-backoff retries or a custom
//!   per-failure hook
//!
//! ## Ordering guarantees
//!
//! Equal-priority tasks dispatch in admission order; different priorities
//! dispatch in priority order; a task whose waiting limit has elapsed is
//! promoted ahead of every priority, and if it does not fit the remaining
//! capacity the scheduler blocks behind it rather than starve it with
//! smaller tasks.
//!
//! ## What the scheduler never does
//!
//! It never inspects task results, never cancels in-flight work (a timed-out
//! task keeps running in the background; only its result is disowned), and
//! never preempts a running task to free capacity.

#![deny(missing_docs, unsafe_code, unused_qualifications)]
#![warn(clippy::all)]

pub mod scheduler;
pub mod types;

mod capacity;
mod queue;
mod release;
mod retry;

pub use scheduler::{Scheduler, TaskReceipt};
pub use types::*;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
