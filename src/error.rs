//! USB stack error types
//!
//! Every fallible operation returns [`Result`]. The [`Error`] variants mirror
//! the small negative integers that the stack's C ABI used, and
//! [`Error::errno()`] recovers that number when you need to hand a status to
//! foreign code.

use core::fmt;

/// USB stack result type
pub type Result<T> = core::result::Result<T, Error>;

/// USB stack errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// Invalid argument
    Inval,
    /// Object not initialized
    NoInit,
    /// Resource busy
    Busy,
    /// Try again; the resource is temporarily unavailable (e.g. a stalled endpoint)
    Again,
    /// No such device or resource
    NoDev,
    /// Resource already exists
    Exist,
    /// Operation not permitted in the current state
    Perm,
    /// Out of memory
    NoMem,
    /// Size doesn't fit
    Size,
    /// Value overflow
    Overflow,
    /// Malformed data
    BadF,
    /// Illegal request
    Illegal,
    /// Protocol error
    Proto,
    /// Bad address or descriptor reference
    Fault,
    /// Timed out
    Time,
    /// Transfer was cancelled
    Cancel,
    /// Operation not supported
    NotSup,
    /// Write failed
    Write,
    /// Read failed
    Read,
    /// Data error
    Data,
    /// Operation still in progress
    InProgress,
}

impl Error {
    /// Returns the negative error number for this error
    pub const fn errno(self) -> i32 {
        -(match self {
            Self::Perm => 1,
            Self::BadF => 9,
            Self::Again => 11,
            Self::NoMem => 12,
            Self::Fault => 14,
            Self::Busy => 16,
            Self::Exist => 17,
            Self::NoDev => 19,
            Self::Inval => 22,
            Self::Time => 62,
            Self::Proto => 71,
            Self::Overflow => 75,
            Self::NotSup => 95,
            Self::InProgress => 115,
            Self::Cancel => 125,
            Self::NoInit => 200,
            Self::Size => 201,
            Self::Illegal => 202,
            Self::Write => 203,
            Self::Read => 204,
            Self::Data => 205,
        })
    }

    /// Recover an error from its negative error number
    ///
    /// Returns `None` for zero, positive numbers and unknown codes.
    pub fn from_errno(errno: i32) -> Option<Self> {
        const ALL: [Error; 21] = [
            Error::Inval,
            Error::NoInit,
            Error::Busy,
            Error::Again,
            Error::NoDev,
            Error::Exist,
            Error::Perm,
            Error::NoMem,
            Error::Size,
            Error::Overflow,
            Error::BadF,
            Error::Illegal,
            Error::Proto,
            Error::Fault,
            Error::Time,
            Error::Cancel,
            Error::NotSup,
            Error::Write,
            Error::Read,
            Error::Data,
            Error::InProgress,
        ];
        ALL.iter().copied().find(|err| err.errno() == errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inval => write!(f, "invalid argument"),
            Self::NoInit => write!(f, "not initialized"),
            Self::Busy => write!(f, "resource busy"),
            Self::Again => write!(f, "resource temporarily unavailable"),
            Self::NoDev => write!(f, "no such device"),
            Self::Exist => write!(f, "already exists"),
            Self::Perm => write!(f, "operation not permitted"),
            Self::NoMem => write!(f, "out of memory"),
            Self::Size => write!(f, "size mismatch"),
            Self::Overflow => write!(f, "value overflow"),
            Self::BadF => write!(f, "malformed data"),
            Self::Illegal => write!(f, "illegal request"),
            Self::Proto => write!(f, "protocol error"),
            Self::Fault => write!(f, "bad reference"),
            Self::Time => write!(f, "timed out"),
            Self::Cancel => write!(f, "cancelled"),
            Self::NotSup => write!(f, "not supported"),
            Self::Write => write!(f, "write error"),
            Self::Read => write!(f, "read error"),
            Self::Data => write!(f, "data error"),
            Self::InProgress => write!(f, "in progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_round_trip() {
        assert_eq!(Error::Inval.errno(), -22);
        assert_eq!(Error::Time.errno(), -62);
        assert_eq!(Error::from_errno(-125), Some(Error::Cancel));
        assert_eq!(Error::from_errno(0), None);
        assert_eq!(Error::from_errno(22), None);
    }

    #[test]
    fn errnos_are_unique() {
        let errors = [
            Error::Inval,
            Error::NoInit,
            Error::Busy,
            Error::Again,
            Error::NoDev,
            Error::Exist,
            Error::Perm,
            Error::NoMem,
            Error::Size,
            Error::Overflow,
            Error::BadF,
            Error::Illegal,
            Error::Proto,
            Error::Fault,
            Error::Time,
            Error::Cancel,
            Error::NotSup,
            Error::Write,
            Error::Read,
            Error::Data,
            Error::InProgress,
        ];
        for err in errors {
            assert!(err.errno() < 0);
            assert_eq!(Error::from_errno(err.errno()), Some(err));
        }
    }
}
