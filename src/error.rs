//! Unified error taxonomy shared across components.
//!
//! Each component returns the subset of [`Error`] relevant to its own
//! operations. Variants are tagged with the POSIX errno they mirror.

use thiserror::Error;

/// Result alias used across every component in this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error kind. Usage errors are caller bugs and are never retried;
/// resource errors may be retried; timeout/cancellation are expected
/// control flow; environmental errors indicate the backend cannot comply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller passed a nonsensical argument (bad handle, zero threshold, ...). Maps to `EINVAL`.
    #[error("invalid argument")]
    InvalidArgument,
    /// Operation cannot proceed because of the object's current state (e.g. try-lock contended,
    /// thread not in the expected lifecycle state). Maps to `EBUSY`.
    #[error("busy")]
    Busy,
    /// Backing resource (kernel object, heap allocation, handle table slot) could not be obtained.
    /// Maps to `ENOMEM`/`EAGAIN`.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Calling context does not own the object it tried to mutate (unlock by non-owner). Maps to `EPERM`.
    #[error("not permitted")]
    NotPermitted,
    /// Platform backend failed in a way that is not one of the other documented kinds.
    #[error("internal error")]
    Internal,
    /// A deadline elapsed before the operation completed.
    #[error("timed out")]
    TimedOut,
    /// Platform detected self-deadlock (error-checking mutex re-lock). Maps to `EDEADLK`.
    #[error("deadlock detected")]
    Deadlock,
    /// Operation requires the thread to have been started, but it is still `Fresh`.
    #[error("thread not started")]
    NotStarted,
    /// Operation is forbidden because the thread has already been detached.
    #[error("thread is detached")]
    Detached,
    /// Operation is forbidden because the object already reached a terminal state
    /// (already joined, ghost already finished, barrier already destroyed).
    #[error("already finished")]
    Finished,
    /// Operation was rejected because the collaborator is shutting down (worker pool submit
    /// after `destroy`).
    #[error("cancelled")]
    Cancelled,
    /// The requested variant of a primitive (e.g. recursive mutex) is not available from this
    /// backend.
    #[error("unsupported")]
    Unsupported,
}

impl Error {
    /// The POSIX errno this variant mirrors, for callers bridging to C-style return codes.
    #[must_use]
    pub const fn as_errno(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::Busy => libc::EBUSY,
            Error::ResourceExhausted => libc::ENOMEM,
            Error::NotPermitted => libc::EPERM,
            Error::Internal => libc::EIO,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Deadlock => libc::EDEADLK,
            Error::NotStarted => libc::EINVAL,
            Error::Detached => libc::EINVAL,
            Error::Finished => libc::EINVAL,
            Error::Cancelled => libc::ECANCELED,
            Error::Unsupported => libc::ENOTSUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(Error::Busy.as_errno(), libc::EBUSY);
        assert_eq!(Error::Deadlock.as_errno(), libc::EDEADLK);
        assert_eq!(Error::NotPermitted.as_errno(), libc::EPERM);
        assert_eq!(Error::TimedOut.as_errno(), libc::ETIMEDOUT);
    }
}
