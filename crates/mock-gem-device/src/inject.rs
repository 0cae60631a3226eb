//! Probe-failure injection.
//!
//! Each fallible step of device construction is a [`ProbeStep`]. When
//! [`Params::inject_probe_failure`](crate::Params::inject_probe_failure) names a step, that step
//! fails with the error its collaborator would naturally report, without the collaborator being
//! called.

use crate::error::errno;
use crate::{DeviceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbeStep {
    AllocIdentity,
    OpenDevresGroup,
    AllocDevice,
    RuntimePmSync,
    UncoreInit,
    AllocWorkqueue,
    CreateScheduler,
    AllocGgtt,
    ConstructEngine,
    InitEngine,
    DebuggerInit,
}

impl ProbeStep {
    /// Every probe point, in the order construction reaches them.
    pub const ALL: [ProbeStep; 11] = [
        ProbeStep::AllocIdentity,
        ProbeStep::OpenDevresGroup,
        ProbeStep::AllocDevice,
        ProbeStep::RuntimePmSync,
        ProbeStep::UncoreInit,
        ProbeStep::AllocWorkqueue,
        ProbeStep::CreateScheduler,
        ProbeStep::AllocGgtt,
        ProbeStep::ConstructEngine,
        ProbeStep::InitEngine,
        ProbeStep::DebuggerInit,
    ];

    /// Best-effort steps are logged on failure and never abort construction.
    pub fn is_best_effort(self) -> bool {
        matches!(self, ProbeStep::RuntimePmSync | ProbeStep::DebuggerInit)
    }

    pub fn injected_error(self) -> DeviceError {
        match self {
            ProbeStep::AllocIdentity => DeviceError::OutOfMemory { what: "pci device" },
            ProbeStep::OpenDevresGroup => DeviceError::OutOfMemory {
                what: "devres group",
            },
            ProbeStep::AllocDevice => DeviceError::OutOfMemory {
                what: "mock gem device",
            },
            ProbeStep::RuntimePmSync => DeviceError::Init {
                component: "runtime pm",
                status: -errno::EIO,
            },
            ProbeStep::UncoreInit => DeviceError::Init {
                component: "uncore",
                status: -errno::ENODEV,
            },
            ProbeStep::AllocWorkqueue => DeviceError::OutOfMemory { what: "workqueue" },
            ProbeStep::CreateScheduler => DeviceError::OutOfMemory {
                what: "sched engine",
            },
            ProbeStep::AllocGgtt => DeviceError::OutOfMemory { what: "ggtt" },
            ProbeStep::ConstructEngine => DeviceError::OutOfMemory { what: "engine" },
            ProbeStep::InitEngine => DeviceError::Init {
                component: "engine",
                status: -errno::ENODEV,
            },
            ProbeStep::DebuggerInit => DeviceError::Init {
                component: "debugger",
                status: -errno::ENODEV,
            },
        }
    }
}

pub(crate) fn inject_probe_point(plan: Option<ProbeStep>, step: ProbeStep) -> Result<()> {
    if plan == Some(step) {
        tracing::info!(?step, "injecting probe failure");
        return Err(step.injected_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_planned_step_fails() {
        for step in ProbeStep::ALL {
            assert!(inject_probe_point(None, step).is_ok());
            assert!(inject_probe_point(Some(step), step).is_err());
        }
        assert!(inject_probe_point(Some(ProbeStep::AllocGgtt), ProbeStep::AllocWorkqueue).is_ok());
    }

    #[test]
    fn all_is_in_probe_order() {
        let mut sorted = ProbeStep::ALL;
        sorted.sort();
        assert_eq!(sorted, ProbeStep::ALL);
    }

    #[test]
    fn injected_errors_match_step_kind() {
        assert_eq!(
            ProbeStep::AllocWorkqueue.injected_error().errno(),
            -errno::ENOMEM
        );
        assert_eq!(ProbeStep::InitEngine.injected_error().errno(), -errno::ENODEV);
        assert!(ProbeStep::RuntimePmSync.is_best_effort());
        assert!(!ProbeStep::UncoreInit.is_best_effort());
    }
}
