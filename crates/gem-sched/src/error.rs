use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedError>;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("failed to spawn worker thread for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("scheduler width must be non-zero")]
    InvalidWidth,

    #[error("{0} has been released")]
    Released(&'static str),
}

/// Reason a fence completed without its work running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("request cancelled before execution")]
    Cancelled,

    #[error("engine wedged while request was outstanding")]
    Wedged,

    #[error("request payload panicked")]
    Aborted,
}
