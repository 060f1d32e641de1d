// Caller-contract outcomes for the try_* entry points.
// The plain entry points fold these into None / no-op.

use core::fmt;

use crate::kernel::fiber::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// init() has not run on this scheduler.
    NotInitialized,
    /// Block cannot hold the control block and the first register frame.
    StackTooSmall { needed: usize, got: usize },
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::NotInitialized => write!(f, "scheduler not initialized"),
            CreateError::StackTooSmall { needed, got } => {
                write!(f, "stack too small: {} bytes, need at least {}", got, needed)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    NotInitialized,
    /// A fiber cannot wait for itself.
    SelfJoin,
    /// The main fiber has no result storage.
    MainFiber,
    /// Target was already terminal when join() was called.
    Finished(Status),
    /// Target was cancelled while we waited.
    Cancelled,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::NotInitialized => write!(f, "scheduler not initialized"),
            JoinError::SelfJoin => write!(f, "fiber tried to join itself"),
            JoinError::MainFiber => write!(f, "main fiber has no result"),
            JoinError::Finished(status) => write!(f, "fiber already {}", status),
            JoinError::Cancelled => write!(f, "fiber cancelled while joined"),
        }
    }
}
