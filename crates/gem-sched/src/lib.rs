//! Asynchronous execution substrate for the mock GEM device.
//!
//! This crate knows nothing about devices. It provides:
//! - [`Workqueue`]: a named pool of worker threads executing queued work items,
//! - [`SchedEngine`]: an ordering front-end that dispatches submitted jobs onto a workqueue with a
//!   fixed concurrency width, and
//! - [`Fence`]: a completion object that callers can poll or block on.
//!
//! Owners hold [`Workqueue`] / [`SchedEngine`] directly. Everything else reaches them through the
//! non-owning [`WorkqueueHandle`] / [`SchedHandle`], which start failing with
//! [`SchedError::Released`] once the owner is gone.
#![forbid(unsafe_code)]

mod cpumask;
mod error;
mod fence;
mod sched_engine;
mod workqueue;

pub use cpumask::CpuMask;
pub use error::{FenceError, Result, SchedError};
pub use fence::Fence;
pub use sched_engine::{Job, SchedEngine, SchedHandle};
pub use workqueue::{Work, Workqueue, WorkqueueFlags, WorkqueueHandle, DEFAULT_MAX_ACTIVE};
