use std::{error::Error as StdError, fmt::Display, io};

use ppt_protocol::error::ReadError;

/// Errors of a single exchange with the PPT.
#[derive(Debug)]
pub enum Error {
    Connect { address: String, source: io::Error },
    Io(io::Error),
    /// Malformed reply or a reply that does not echo its request.
    Protocol(ReadError),
    Transfer(String),
    /// The PPT did not answer within the receive timeout.
    Timeout,
    Cancelled,
    /// The PPT answered with a nonzero status where zero was required.
    Rejected { command: &'static str, code: u32 },
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(value),
        }
    }
}

impl From<ReadError> for Error {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::IoError(err) => err.into(),
            other => Error::Protocol(other),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connect { address, source } => {
                write!(f, "Could not connect to {}: {}", address, source)
            }
            Error::Io(err) => write!(f, "{}", err),
            Error::Protocol(err) => write!(f, "Protocol error: {}", err),
            Error::Transfer(reason) => write!(f, "File transfer failed: {}", reason),
            Error::Timeout => write!(f, "Timed out waiting for a reply"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Rejected { command, code } => {
                write!(f, "{} was rejected with code {}", command, code)
            }
        }
    }
}

impl StdError for Error {}
