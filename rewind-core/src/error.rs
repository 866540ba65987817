use std::{error, fmt, io};

#[derive(Debug)]
pub enum Error {
    InvalidArg(String),
    NotOpen,
    Closed,
    Aborted,
    RangesNotSupported,
    UnexpectedResponse,
    HttpStatus(u16),
    Network(String),
    NetworkFatal(String),
    BadFormat(String),
    ListenerAlreadySet,
    IoError(io::Error),
    SendError,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg(msg) => write!(f, "Invalid argument: {msg}"),
            Self::NotOpen => write!(f, "File is not open"),
            Self::Closed => write!(f, "File is closed"),
            Self::Aborted => write!(f, "Operation was aborted"),
            Self::RangesNotSupported => write!(f, "Server does not accept byte ranges"),
            Self::UnexpectedResponse => write!(f, "Unknown server response"),
            Self::HttpStatus(code) => write!(f, "HTTP status {code}"),
            Self::Network(msg) => write!(f, "Network error: {msg}"),
            Self::NetworkFatal(msg) => write!(f, "Download failed: {msg}"),
            Self::BadFormat(msg) => write!(f, "Malformed recording: {msg}"),
            Self::ListenerAlreadySet => write!(f, "Player listener is already assigned"),
            Self::IoError(err) => err.fmt(f),
            Self::SendError => write!(f, "Failed to send into a channel"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::SendError
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Error::HttpStatus(code),
            other => Error::Network(other.to_string()),
        }
    }
}
