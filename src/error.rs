//! Contains the `Error` and `Result` types that `mongodb-sdam` uses.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];

/// The result type for all methods that can return an error in the `mongodb-sdam` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-sdam` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to allow the errors to be
/// cloned and passed around cheaply.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Whether this error is a network error (an I/O failure while communicating with a server).
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
    }

    pub(crate) fn is_recovering(&self) -> bool {
        match self.sdam_code() {
            Some(code) => RECOVERING_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        match self.sdam_code() {
            Some(code) => NOTWRITABLEPRIMARY_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether this error is a "node is recovering" or "not writable primary" error, which
    /// indicates that the server's description is out of date.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// Whether this error indicates a failure to select a server satisfying a read preference
    /// within the server selection timeout.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Whether this error indicates that a server's wire version range is incompatible with
    /// the range supported by this library.
    pub fn is_incompatible_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::IncompatibleServer { .. })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::from(err).into()
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The configured seed list was invalid.
    #[error("Invalid seed list: {message}")]
    #[non_exhaustive]
    InvalidSeedList {
        /// A description of the misconfiguration.
        message: String,
    },

    /// The configured initial topology type was invalid, or the replica set name was
    /// required/forbidden for it.
    #[error("Invalid topology type: {message}")]
    #[non_exhaustive]
    InvalidTopologyType {
        /// A description of the misconfiguration.
        message: String,
    },

    /// The configured heartbeat frequency was below the minimum allowed value.
    #[error("Invalid heartbeat frequency: {message}")]
    #[non_exhaustive]
    InvalidHeartbeatFrequency {
        /// A description of the misconfiguration.
        message: String,
    },

    /// No server satisfying the read preference could be found within the server selection
    /// timeout.
    #[error("Server selection error: {message}")]
    #[non_exhaustive]
    ServerSelection {
        /// A description of the failed selection.
        message: String,
    },

    /// A server's wire version range does not overlap the range this library supports.
    #[error("Incompatible server: {message}")]
    #[non_exhaustive]
    IncompatibleServer {
        /// A description of the incompatibility.
        message: String,
    },

    /// The topology manager was shut down before or during the operation.
    #[error("The topology manager is shutting down")]
    ShuttingDown,

    /// Wrapper around `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An error reported by a server in response to an operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument {
        /// A description of the invalid argument.
        message: String,
    },

    /// A server returned a malformed or unexpected reply.
    #[error("Invalid server response: {message}")]
    #[non_exhaustive]
    InvalidResponse {
        /// A description of the problem with the reply.
        message: String,
    },

    /// An internal error.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal {
        /// A description of the error.
        message: String,
    },
}

/// An error that occurred due to a database command failing. Used by [`failed_host`]
/// (crate::TopologyManager::failed_host) callers to report server-side failures.
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Command failed ({code_name}): {message}")]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl From<CommandError> for Error {
    fn from(error: CommandError) -> Self {
        ErrorKind::Command(error).into()
    }
}
