use native::{Errno, NativeError};

/// Bridge error taxonomy
///
/// Native failures are translated once, in [`Error::from_native`], into the
/// variant matching their error number. Everything not singled out there is
/// reported as [`Error::Native`] with the failing primitive's name.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{op}: operation cannot be accomplished in current state: {message}")]
    ProtocolState { op: &'static str, message: String },

    #[error("{op}: transport is not compatible with the socket type: {message}")]
    IncompatibleTransport { op: &'static str, message: String },

    #[error("{op}: context was terminated")]
    Terminated { op: &'static str },

    #[error("{op}: resources exhausted: {message}")]
    ResourceExhausted { op: &'static str, message: String },

    #[error("{op} failed: {message} (errno {code})", code = .errno.code())]
    Native {
        op: &'static str,
        errno: Errno,
        message: String,
    },

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    Type { expected: &'static str, actual: String },

    #[error("Cannot initialize worker thread: {0}")]
    WorkerInit(String),

    #[error("Worker thread {0} has exited")]
    WorkerExited(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Translate a failed native call into the taxonomy
    pub fn from_native(op: &'static str, err: NativeError) -> Self {
        match err.errno {
            Errno::EFSM => Error::ProtocolState {
                op,
                message: err.message,
            },
            Errno::ENOCOMPATPROTO => Error::IncompatibleTransport {
                op,
                message: err.message,
            },
            Errno::ETERM => Error::Terminated { op },
            Errno::EMTHREAD => Error::ResourceExhausted {
                op,
                message: err.message,
            },
            errno => Error::Native {
                op,
                errno,
                message: err.message,
            },
        }
    }

    /// Create an argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    /// Create a worker initialisation error
    pub fn worker_init(msg: impl Into<String>) -> Self {
        Error::WorkerInit(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Expected during shutdown, never worth an error log
    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::Terminated { .. })
    }

    /// Check if retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ProtocolState { .. } | Error::ResourceExhausted { .. } => true,
            Error::Native { errno, .. } => matches!(errno, Errno::EAGAIN | Errno::EINTR),
            _ => false,
        }
    }

    /// Native error number, when the error came from a native call
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::ProtocolState { .. } => Some(Errno::EFSM),
            Error::IncompatibleTransport { .. } => Some(Errno::ENOCOMPATPROTO),
            Error::Terminated { .. } => Some(Errno::ETERM),
            Error::ResourceExhausted { .. } => Some(Errno::EMTHREAD),
            Error::Native { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config_crate::ConfigError> for Error {
    fn from(err: config_crate::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias used across the bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter for `map_err` at native call sites
pub(crate) fn native(op: &'static str) -> impl FnOnce(NativeError) -> Error {
    move |err| Error::from_native(op, err)
}
