// src/error.rs

use std::fmt;
use std::io;

/// Errors surfaced by the transport core.
///
/// "No more messages buffered" is not an error; [`Connection::get_next`]
/// reports it as `Ok(None)`.
///
/// [`Connection::get_next`]: crate::connection::Connection::get_next
#[derive(Debug)]
pub enum Error {
    /// An argument was rejected up front (for example a zero-size allocation).
    InvalidArguments,
    /// Heap allocation or mapping failed.
    OutOfMemory,
    /// The outbound descriptor sequence is already at its ancillary-data cap.
    TooManyDescriptors,
    /// An underlying OS call failed.
    System(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArguments => write!(f, "invalid arguments"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::TooManyDescriptors => write!(f, "too many file descriptors staged"),
            Error::System(err) => write!(f, "system error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::System(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_error_keeps_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("peer gone"));
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::InvalidArguments.to_string(), "invalid arguments");
        assert_eq!(
            Error::TooManyDescriptors.to_string(),
            "too many file descriptors staged"
        );
    }
}
