use std::{error, fmt, io};

use arcstr::ArcStr;

use crate::errors::server_error::ServerError;

/// Library generic result type.
pub type RespResult<T> = Result<T, Error>;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The byte stream was malformed. Fatal for the connection: the decode
    /// position cannot be recovered, so the connection is torn down and every
    /// queued command fails.
    Protocol,
    /// A well-formed error reply from the peer. Fails exactly the command it
    /// was correlated with; the connection stays healthy.
    Server,
    /// The socket failed or was closed by the peer.
    ConnectionLost,
    /// The command was cancelled locally, never a connection-level event.
    Cancelled,
    /// A reply arrived that could not be correlated with the head of the
    /// dispatch queue. Defensive: this indicates a driver bug and is always
    /// fatal for the connection.
    OrderingViolation,
    /// A command argument was rejected before any bytes were written.
    Encoding,
    /// The pipeline depth limit was reached and the caller asked to fail
    /// fast instead of waiting for a free slot.
    Backpressure,
    /// The decoded reply did not match the shape the command asked for.
    UnexpectedReturnType,
    /// The client was misconfigured or misused.
    Client,
}

/// Represents a driver error.
///
/// The internal representation is private; inspect it through
/// [`Error::kind`] and the predicate helpers.
pub struct Error {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, ArcStr),
    Io(io::Error),
    Server(ServerError),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Server(a), ErrorRepr::Server(b)) => *a == *b,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error {
            repr: ErrorRepr::Io(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, desc): (ErrorKind, &'static str)) -> Error {
        Error {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> Error {
        Error {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.into()),
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Error {
        Error {
            repr: ErrorRepr::Server(err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Io(err) => Some(err),
            ErrorRepr::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::Io(err) => err.fmt(f),
            ErrorRepr::Server(err) => err.fmt(f),
        }
    }
}

impl Error {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::Io(_) => ErrorKind::ConnectionLost,
            ErrorRepr::Server(_) => ErrorKind::Server,
        }
    }

    /// Returns the error detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail.as_str()),
            ErrorRepr::Server(err) => err.details(),
            _ => None,
        }
    }

    /// Returns the error reply from the peer, if this error wraps one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match &self.repr {
            ErrorRepr::Server(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if this failure was caused by local cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Returns true if the error cannot be recovered on this connection and
    /// the connection must be replaced.
    pub fn is_unrecoverable_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::ConnectionLost | ErrorKind::OrderingViolation
        )
    }

    /// Returns true if the error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match &self.repr {
            ErrorRepr::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Returns true if error was caused by an I/O time out.
    pub fn is_timeout(&self) -> bool {
        match &self.repr {
            ErrorRepr::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Clone the error, throwing away non-cloneable parts of a wrapped
    /// `io::Error`.
    ///
    /// Deriving `Clone` is not possible because the wrapped `io::Error` is
    /// not cloneable. The `ioerror_description` parameter is prepended to the
    /// message in case an `io::Error` is found.
    pub(crate) fn clone_mostly(&self, ioerror_description: &'static str) -> Self {
        let repr = match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(*kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                ErrorRepr::WithDescriptionAndDetail(*kind, desc, detail.clone())
            }
            ErrorRepr::Io(err) => ErrorRepr::Io(io::Error::new(
                err.kind(),
                format!("{ioerror_description}: {err}"),
            )),
            ErrorRepr::Server(err) => ErrorRepr::Server(err.clone()),
        };
        Self { repr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_connection_lost() {
        let err = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert!(err.is_connection_dropped());
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn server_errors_keep_their_payload() {
        let err = Error::from(ServerError::parse("ERR boom"));
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.server_error().unwrap().code(), "ERR");
        assert!(!err.is_unrecoverable_error());
    }

    #[test]
    fn clone_mostly_preserves_kind() {
        let err = Error::from((ErrorKind::Protocol, "parse error"));
        assert_eq!(err.clone_mostly("while failing over").kind(), ErrorKind::Protocol);
    }
}
