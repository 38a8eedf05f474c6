use std::{error, fmt};

/// A well-formed error reply sent by the peer.
///
/// The wire format is an error code (the leading word, `ERR`, `WRONGTYPE`,
/// `MOVED`, ...) optionally followed by free-form detail text. The connection
/// stays healthy after a server error; it fails exactly the command whose
/// reply slot it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    code: String,
    detail: Option<String>,
}

impl ServerError {
    pub(crate) fn parse(line: &str) -> ServerError {
        let mut pieces = line.splitn(2, ' ');
        let code = pieces.next().unwrap_or_default().to_string();
        let detail = pieces.next().map(|detail| detail.to_string());
        ServerError { code, detail }
    }

    /// The error code, i.e. the first word of the error reply.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The detail text following the code, if any.
    pub fn details(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.code, detail),
            None => f.write_str(&self.code),
        }
    }
}

impl error::Error for ServerError {
    fn description(&self) -> &str {
        "an error was signalled by the server"
    }
}
