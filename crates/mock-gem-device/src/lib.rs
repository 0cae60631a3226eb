//! A software-only GEM graphics device.
//!
//! [`MockGemDevice`] stands in for real hardware so that memory management, command scheduling
//! and engine registration can be exercised without a GPU. Construction acquires a chain of
//! interdependent collaborators (PCI identity, grouped device resources, register shim,
//! workqueue, command scheduler, global GTT, compute engine). A failure at any step releases
//! exactly what had been acquired, newest first, and no partially built device is returned.
//!
//! Every acquisition and release is recorded on a [`ResourceTracker`], which tests use to check
//! unwind ordering and leak freedom.
#![forbid(unsafe_code)]

pub mod config;
pub mod debugger;
pub mod device;
pub mod device_info;
pub mod devres;
pub mod error;
pub mod gem;
pub mod gt;
pub mod ida;
pub mod inject;
pub mod mode_config;
pub mod pci;
pub mod regions;
pub mod tracker;
pub mod uncore;

pub use config::{MockDeviceConfig, Params};
pub use device::{Diagnostic, MockGemDevice};
pub use error::{DeviceError, Result};
pub use gt::{EngineId, Request};
pub use inject::ProbeStep;
pub use tracker::{ResourceKind, ResourceTracker, TeardownStep, TrackerEvent};
