use std::fmt;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error` values
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while modelling or parsing SIP messages.
///
/// The parser distinguishes three families so that callers can triage
/// without inspecting error text:
///
/// - syntax errors ([`Error::is_syntax`]): a bad start line or a datagram
///   without a header terminator. The parser resynchronises on its own.
/// - malformed messages ([`Error::is_malformed`]): framing information is
///   missing or ambiguous (no or several `Content-Length` headers on a stream).
/// - broken messages ([`Error::is_broken`]): the body is shorter than declared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The first line is neither a request line nor a status line
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    /// The datagram does not contain a complete header section
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Framing cannot be determined from the message
    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        message: String,
    },

    /// The message body is shorter than its declared length
    #[error("broken message: {reason}")]
    BrokenMessage {
        reason: String,
        message: String,
    },

    /// A header value failed its header-specific grammar
    #[error("invalid '{name}' header: {reason}")]
    InvalidHeader {
        name: String,
        reason: String,
    },

    /// Invalid URI
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Invalid key/value parameter section
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Invalid host or port
    #[error("invalid host/port: {0}")]
    InvalidHostPort(String),

    /// Invalid method token
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// The parser has been stopped and accepts no more input
    #[error("parser is stopped")]
    ParserStopped,

    /// Low-level tokenizer failure
    #[error("parser error: {0}")]
    Parser(String),
}

impl Error {
    /// Builds an [`Error::InvalidHeader`].
    pub fn invalid_header(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds an [`Error::MalformedMessage`].
    pub fn malformed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::MalformedMessage {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Builds an [`Error::BrokenMessage`].
    pub fn broken(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BrokenMessage {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Syntax errors affect a single message only.
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            Error::InvalidStartLine(_)
                | Error::InvalidMessageFormat(_)
                | Error::InvalidHeader { .. }
                | Error::InvalidUri(_)
                | Error::InvalidParams(_)
                | Error::InvalidHostPort(_)
                | Error::InvalidMethod(_)
                | Error::Parser(_)
        )
    }

    /// Framing errors on a stream.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::MalformedMessage { .. })
    }

    /// Short body reads.
    pub fn is_broken(&self) -> bool {
        matches!(self, Error::BrokenMessage { .. })
    }
}

impl<I: fmt::Debug> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Error::Parser("incomplete input".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::Parser(format!("{:?} at {:?}", e.code, e.input))
            }
        }
    }
}
