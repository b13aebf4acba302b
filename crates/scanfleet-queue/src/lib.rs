//! scanfleet-queue — matching queued scans to warm engines.
//!
//! The `QueueMonitor` polls the job queue on a fixed interval, orders the
//! pending scans, and claims an idle engine of the right tier for each one.
//! When no engine is free it claims an unprovisioned slot instead, which
//! wakes the fleet manager to launch it.
//!
//! # Tick
//!
//! ```text
//! list_pending ──► sort_queue ──► for each scan:
//!                                   classify(size) ── none ──► warn, skip
//!                                   allocate(tier, IDLE → SCANNING)
//!                                     hit  ──► dispatch(job, host) ──► assign_job
//!                                     miss ──► claim(tier, UNPROVISIONED → PENDING)
//!                                              unless in-flight covers the backlog
//! ```

pub mod client;
pub mod error;
pub mod memory;
pub mod monitor;

pub use client::JobQueue;
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryQueue;
pub use monitor::{QueueMonitor, TickReport};
