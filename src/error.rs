//! Error taxonomy for the ring object model.
//!
//! Kernel failures are never retried here: every failed system call is
//! reported once, to the caller of the operation that triggered it.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by [`Ring`](crate::io::Ring), [`Operation`](crate::io::Operation)
/// and [`Completion`](crate::io::Completion).
///
/// `Clone` so a descriptor can keep a copy in its deferred-error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The kernel reported a failure. `code` is the positive errno.
    #[error("system call failed: {}", io::Error::from_raw_os_error(*code))]
    SystemCall { code: i32 },

    /// No submission slot is free; submit or reap completions first.
    #[error("submission queue is full")]
    QueueFull,

    /// The caller violated the operation lifecycle.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A completion result could not be projected for its opcode.
    #[error("cannot project completion result: {0}")]
    ResultProjection(&'static str),
}

impl Error {
    /// Builds a [`SystemCall`](Self::SystemCall) from a negative kernel result.
    ///
    /// # Panics
    ///
    /// Panics if `result` is not negative.
    #[inline]
    pub fn from_result(result: i32) -> Self {
        assert!(result < 0, "only negative results carry an errno");
        Error::SystemCall {
            code: result.checked_neg().unwrap_or(i32::MAX),
        }
    }

    /// The errno carried by a [`SystemCall`](Self::SystemCall), if any.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        match *self {
            Error::SystemCall { code } => Some(code),
            _ => None,
        }
    }

    /// `true` when a bounded wait expired before enough completions arrived.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(libc::ETIME)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::SystemCall {
            code: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::SystemCall { code } => io::Error::from_raw_os_error(code),
            Error::QueueFull => io::Error::new(io::ErrorKind::WouldBlock, err),
            Error::InvalidState(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::ResultProjection(_) => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_negates() {
        assert_eq!(
            Error::from_result(-libc::EAGAIN),
            Error::SystemCall { code: libc::EAGAIN }
        );
    }

    #[test]
    fn from_result_min_does_not_overflow() {
        assert_eq!(Error::from_result(i32::MIN).code(), Some(i32::MAX));
    }

    #[test]
    #[should_panic(expected = "only negative results carry an errno")]
    fn from_result_rejects_success() {
        let _ = Error::from_result(0);
    }

    #[test]
    fn timeout_is_distinct() {
        assert!(Error::SystemCall { code: libc::ETIME }.is_timeout());
        assert!(!Error::SystemCall { code: libc::EINTR }.is_timeout());
        assert!(!Error::QueueFull.is_timeout());
    }

    #[test]
    fn io_error_round_trip_keeps_errno() {
        let err: Error = io::Error::from_raw_os_error(libc::ENOMEM).into();
        assert_eq!(err.code(), Some(libc::ENOMEM));

        let back: io::Error = err.into();
        assert_eq!(back.raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn non_os_io_error_maps_to_eio() {
        let err: Error = io::Error::other("boom").into();
        assert_eq!(err.code(), Some(libc::EIO));
    }

    #[test]
    fn display_names_the_errno() {
        let msg = Error::SystemCall { code: libc::EBADF }.to_string();
        assert!(msg.starts_with("system call failed"));
    }
}
