use gem_sched::SchedError;
use thiserror::Error;

use crate::gt::EngineId;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Negative errno values reported by [`DeviceError::errno`].
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of memory allocating {what}")]
    OutOfMemory { what: &'static str },

    #[error("{component} initialisation failed with status {status}")]
    Init { component: &'static str, status: i32 },

    #[error("scheduler error: {0}")]
    Sched(#[from] SchedError),

    #[error("no space left in {0}")]
    NoSpace(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine {0:?} is not registered")]
    NoSuchEngine(EngineId),

    #[error("{0} is busy")]
    Busy(&'static str),

    #[error("gt is wedged")]
    Wedged,
}

impl DeviceError {
    /// Kernel-style negative errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => -errno::ENOMEM,
            Self::Init { status, .. } => *status,
            Self::Sched(SchedError::Spawn { .. }) => -errno::ENOMEM,
            Self::Sched(_) => -errno::EIO,
            Self::NoSpace(_) => -errno::ENOSPC,
            Self::InvalidArgument(_) => -errno::EINVAL,
            Self::NoSuchEngine(_) => -errno::ENODEV,
            Self::Busy(_) => -errno::EBUSY,
            Self::Wedged => -errno::EIO,
        }
    }
}
