use thiserror::Error;

use crate::shell::ShellState;

/// Errors surfaced to the control plane. Everything here is a
/// dispatcher-level failure; pty and OS failures inside a running shell are
/// converted into terminal state transitions instead (callers always own a
/// shell once `start_shell` returns).
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid arguments: {0}")]
    BadArguments(String),

    #[error("label '{0}' is already in use")]
    DuplicateLabel(String),

    #[error("no shell with label '{0}'")]
    NotFound(String),

    #[error("operation not permitted while shell is {0}")]
    WrongState(ShellState),

    #[error("pty closed")]
    PtyClosed,

    #[error("internal supervisor error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// Stable kind name used as the error-envelope prefix on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::BadArguments(_) => "BadArguments",
            SupervisorError::DuplicateLabel(_) => "DuplicateLabel",
            SupervisorError::NotFound(_) => "NotFound",
            SupervisorError::WrongState(_) => "WrongState",
            SupervisorError::PtyClosed => "PtyClosed",
            SupervisorError::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
