use std::{
    error,
    fmt::{Display, Formatter},
    io,
};

use ppt_protocol::error::FrameError;

use crate::registers::FamilyKind;

#[derive(Debug)]
pub enum Error {
    Transport(ppt_client::Error),
    /// Readback data ran out before every expected bit was extracted.
    InsufficientData {
        needed: usize,
        available: usize,
    },
    /// Misuse of the engine or a topology that does not fit the register model.
    /// Retrying will not help.
    Configuration(String),
    /// Another caller holds the register family.
    Busy(FamilyKind),
    /// The JTAG engine of `module` did not drain its output fifo.
    Engine {
        module: u8,
    },
    Cancelled,
    Io(io::Error),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<ppt_client::Error> for Error {
    fn from(value: ppt_client::Error) -> Self {
        match value {
            ppt_client::Error::Cancelled => Error::Cancelled,
            other => Error::Transport(other),
        }
    }
}

impl From<FrameError> for Error {
    fn from(value: FrameError) -> Self {
        Error::Configuration(value.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "{}", err),
            Error::InsufficientData { needed, available } => write!(
                f,
                "Readback data too short: needed {} bits, but only {} remain",
                needed, available
            ),
            Error::Configuration(reason) => write!(f, "Configuration error: {}", reason),
            Error::Busy(family) => write!(f, "{} registers are in use by another caller", family),
            Error::Engine { module } => write!(
                f,
                "JTAG engine of module {} did not finish programming",
                module
            ),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(Error::Configuration("chain".to_string()).is_fatal());
        assert!(!Error::Engine { module: 1 }.is_fatal());
        assert!(!Error::Busy(FamilyKind::Pixel).is_fatal());
    }

    #[test]
    fn client_cancellation_is_preserved() {
        assert!(matches!(
            Error::from(ppt_client::Error::Cancelled),
            Error::Cancelled
        ));
        assert!(matches!(
            Error::from(ppt_client::Error::Timeout),
            Error::Transport(ppt_client::Error::Timeout)
        ));
    }

    #[test]
    fn frame_errors_are_configuration_errors() {
        let err = Error::from(FrameError::TooManyBits {
            max: 65536,
            got: 70000,
        });
        assert!(err.is_fatal());
    }
}
