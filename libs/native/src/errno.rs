//! Native error codes
//!
//! Error numbers reported by the messaging library, including the library
//! specific codes that live above `HAUSNUMERO`.

use std::fmt;
use thiserror::Error;

/// Base for library specific error numbers
pub const HAUSNUMERO: i32 = 156_384_712;

/// Error number reported by a failing native call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Operation cannot be accomplished in current state
    EFSM,
    /// Transport protocol is not compatible with the socket type
    ENOCOMPATPROTO,
    /// The context was terminated
    ETERM,
    /// No I/O thread is available
    EMTHREAD,
    EADDRINUSE,
    EAGAIN,
    EINTR,
    ETIMEDOUT,
    EINVAL,
    ENOTSOCK,
    ENOTSUP,
    EPROTONOSUPPORT,
    ECONNREFUSED,
    ENOENT,
    EFAULT,
    Other(i32),
}

impl Errno {
    pub fn code(self) -> i32 {
        match self {
            Errno::EFSM => HAUSNUMERO + 51,
            Errno::ENOCOMPATPROTO => HAUSNUMERO + 52,
            Errno::ETERM => HAUSNUMERO + 53,
            Errno::EMTHREAD => HAUSNUMERO + 54,
            Errno::EADDRINUSE => 98,
            Errno::EAGAIN => 11,
            Errno::EINTR => 4,
            Errno::ETIMEDOUT => 110,
            Errno::EINVAL => 22,
            Errno::ENOTSOCK => 88,
            Errno::ENOTSUP => 95,
            Errno::EPROTONOSUPPORT => 93,
            Errno::ECONNREFUSED => 111,
            Errno::ENOENT => 2,
            Errno::EFAULT => 14,
            Errno::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            c if c == HAUSNUMERO + 51 => Errno::EFSM,
            c if c == HAUSNUMERO + 52 => Errno::ENOCOMPATPROTO,
            c if c == HAUSNUMERO + 53 => Errno::ETERM,
            c if c == HAUSNUMERO + 54 => Errno::EMTHREAD,
            98 => Errno::EADDRINUSE,
            11 => Errno::EAGAIN,
            4 => Errno::EINTR,
            110 => Errno::ETIMEDOUT,
            22 => Errno::EINVAL,
            88 => Errno::ENOTSOCK,
            95 => Errno::ENOTSUP,
            93 => Errno::EPROTONOSUPPORT,
            111 => Errno::ECONNREFUSED,
            2 => Errno::ENOENT,
            14 => Errno::EFAULT,
            other => Errno::Other(other),
        }
    }

    /// `strerror` text for this error number
    pub fn description(self) -> &'static str {
        match self {
            Errno::EFSM => "Operation cannot be accomplished in current state",
            Errno::ENOCOMPATPROTO => "The protocol is not compatible with the socket type",
            Errno::ETERM => "Context was terminated",
            Errno::EMTHREAD => "No thread available",
            Errno::EADDRINUSE => "Address already in use",
            Errno::EAGAIN => "Resource temporarily unavailable",
            Errno::EINTR => "Interrupted system call",
            Errno::ETIMEDOUT => "Connection timed out",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOTSOCK => "Socket operation on non-socket",
            Errno::ENOTSUP => "Operation not supported",
            Errno::EPROTONOSUPPORT => "Protocol not supported",
            Errno::ECONNREFUSED => "Connection refused",
            Errno::ENOENT => "No such file or directory",
            Errno::EFAULT => "Bad address",
            Errno::Other(_) => "Unknown error",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Failure returned by a native call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NativeError {
    pub errno: Errno,
    pub message: String,
}

impl NativeError {
    pub fn new(errno: Errno) -> Self {
        Self {
            errno,
            message: errno.description().to_string(),
        }
    }

    /// Error with extra detail appended to the `strerror` text
    pub fn with_detail(errno: Errno, detail: impl fmt::Display) -> Self {
        Self {
            errno,
            message: format!("{} ({})", errno.description(), detail),
        }
    }
}

impl From<Errno> for NativeError {
    fn from(errno: Errno) -> Self {
        NativeError::new(errno)
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_codes_sit_above_hausnumero() {
        for errno in [Errno::EFSM, Errno::ENOCOMPATPROTO, Errno::ETERM, Errno::EMTHREAD] {
            assert!(errno.code() > HAUSNUMERO);
            assert_eq!(Errno::from_code(errno.code()), errno);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(Errno::from_code(4242), Errno::Other(4242));
        assert_eq!(Errno::Other(4242).code(), 4242);
    }

    #[test]
    fn detail_is_appended_to_strerror_text() {
        let err = NativeError::with_detail(Errno::EADDRINUSE, "inproc://a");
        assert_eq!(err.to_string(), "Address already in use (inproc://a)");
        assert_eq!(err.errno, Errno::EADDRINUSE);
    }
}
