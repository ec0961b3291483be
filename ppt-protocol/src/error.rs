use std::{
    error::Error,
    fmt::Display,
    io::{self},
    num::ParseIntError,
    str::Utf8Error,
};

/// Errors that may occur when reading a message from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    InvalidCommand(String),
    InvalidCommandPrefix(String),
    InvalidFormat(String),
    TooManyBytes { max: usize, got: usize },
    /// The reply does not echo the code of the request it answers.
    EchoMismatch { expected: String, got: String },
    /// A vector reply carried a nonzero return code.
    ReturnCode(i64),
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl From<Utf8Error> for ReadError {
    fn from(value: Utf8Error) -> Self {
        ReadError::InvalidFormat(format!("Invalid UTF8: {}", value))
    }
}

impl From<ParseIntError> for ReadError {
    fn from(value: ParseIntError) -> Self {
        ReadError::InvalidFormat(format!("Invalid integer: {}", value))
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::InvalidCommand(cmd) => write!(f, "Received invalid command {}", cmd),
            ReadError::InvalidFormat(format) => write!(f, "{}", format),
            ReadError::InvalidCommandPrefix(prefix) => {
                write!(f, "Received invalid command with prefix {}", prefix)
            }
            ReadError::TooManyBytes { max, got } => {
                write!(f, "Message too large! Maximum is {}, but got {}", max, got)
            }
            ReadError::EchoMismatch { expected, got } => {
                write!(f, "Reply echoes {} but the request was {}", got, expected)
            }
            ReadError::ReturnCode(code) => write!(f, "Device returned error code {}", code),
        }
    }
}

impl Error for ReadError {}

/// Errors raised while building or decoding a JTAG frame.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    /// A frame must address at least one device.
    EmptyChain,
    ChainTooLong { devices: usize, max: usize },
    /// The data register of a frame must hold at least one bit.
    NoData,
    TooManyBits { max: usize, got: usize },
    DeviceOutOfRange { position: usize, chain_len: usize },
    Truncated,
    InvalidHeader(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        if value.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(value)
        }
    }
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(error) => write!(f, "{}", error),
            FrameError::EmptyChain => write!(f, "JTAG frame addresses no device"),
            FrameError::ChainTooLong { devices, max } => {
                write!(f, "JTAG chain of {} devices exceeds the maximum of {}", devices, max)
            }
            FrameError::NoData => write!(f, "JTAG frame carries no data bits"),
            FrameError::TooManyBits { max, got } => {
                write!(f, "JTAG frame too large! Maximum is {} bits, but got {}", max, got)
            }
            FrameError::DeviceOutOfRange {
                position,
                chain_len,
            } => write!(
                f,
                "Chain position {} is outside of a chain of {} devices",
                position, chain_len
            ),
            FrameError::Truncated => write!(f, "JTAG frame ends prematurely"),
            FrameError::InvalidHeader(reason) => write!(f, "Invalid JTAG frame header: {}", reason),
        }
    }
}

impl Error for FrameError {}
