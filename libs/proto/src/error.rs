use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("line is missing its '\\n' terminator")]
    MissingTerminator,

    #[error("line contains non-ASCII bytes")]
    NotAscii,

    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' takes {expected} argument(s), got {got}")]
    WrongArity {
        command: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("invalid topology update: {0}")]
    InvalidUpdate(&'static str),
}

impl ProtoError {
    /// True for errors caused by the peer sending something malformed, as
    /// opposed to transport failures.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ProtoError::Io(_) | ProtoError::Timeout(_))
    }
}
