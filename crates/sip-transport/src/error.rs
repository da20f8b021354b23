use std::io;

use thiserror::Error;

use crate::connection::ConnectionKey;

/// A type alias for handling `Result`s with `Error` values
pub type Result<T> = std::result::Result<T, Error>;

/// Error category used by the pools and the transport layer for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket failure; the connection is unusable
    Network,
    /// Socket operation timed out
    Timeout,
    /// Connection lease ran out
    Expired,
    /// Remote side closed the stream
    Eof,
    /// Bad start line or header, limited to one message
    Syntax,
    /// Framing lost or body too short
    Malformed,
    /// Pool bookkeeping (duplicate or missing key, closed pool)
    Pool,
    /// Unsupported network, bad target, TLS or DNS setup
    Protocol,
    /// The transport layer has been canceled
    Canceled,
}

/// Errors produced by the SIP transport layer
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure on a socket, with the addresses involved
    #[error("{op} {network} {local} <-> {remote}: {source}")]
    Connection {
        op: &'static str,
        network: String,
        local: String,
        remote: String,
        #[source]
        source: io::Error,
    },

    /// The remote side closed the stream
    #[error("{network} connection {key} closed by remote side")]
    Eof { network: String, key: ConnectionKey },

    /// The connection lease ran out
    #[error("connection {0} expired")]
    Expired(ConnectionKey),

    /// Error raised while serving a pooled connection
    #[error("connection handler {key} ({network} {local} <-> {remote}): {source}")]
    ConnectionHandler {
        key: ConnectionKey,
        network: String,
        local: String,
        remote: String,
        #[source]
        source: Box<Error>,
    },

    /// Error raised while serving a pooled listener
    #[error("listener handler {key} ({network} {addr}): {source}")]
    ListenerHandler {
        key: ConnectionKey,
        network: String,
        addr: String,
        #[source]
        source: Box<Error>,
    },

    /// Message parsing failed
    #[error(transparent)]
    Parse(#[from] sipflow_sip_core::Error),

    /// Pool operation failed
    #[error("{op}: {reason}")]
    Pool { op: &'static str, reason: String },

    /// Network name not known to the transport layer
    #[error("protocol {0} is not supported")]
    UnsupportedProtocol(String),

    /// Address could not be turned into a target
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Outgoing message without a Via header
    #[error("missing required 'Via' header in {0}")]
    MissingVia(String),

    /// Operation attempted after cancel
    #[error("{0} is canceled")]
    Canceled(&'static str),

    /// Protocol-level send failure
    #[error("send SIP message through {network} protocol to {target}: {source}")]
    Send {
        network: String,
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// WebSocket handshake or framing failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// DNS lookup failure
    #[error("DNS error: {0}")]
    Dns(String),

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Builds an [`Error::Pool`].
    pub fn pool(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Pool {
            op,
            reason: reason.into(),
        }
    }

    /// Builds an [`Error::Tls`].
    pub fn tls(reason: impl ToString) -> Self {
        Error::Tls(reason.to_string())
    }

    /// Builds an [`Error::WebSocket`].
    pub fn websocket(reason: impl ToString) -> Self {
        Error::WebSocket(reason.to_string())
    }

    /// Category of this error. Wrappers report the category of what they wrap.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { source, .. } | Error::Io(source) => match source.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
                io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
                _ => ErrorKind::Network,
            },
            Error::Eof { .. } => ErrorKind::Eof,
            Error::Expired(_) => ErrorKind::Expired,
            Error::ConnectionHandler { source, .. }
            | Error::ListenerHandler { source, .. }
            | Error::Send { source, .. } => source.kind(),
            Error::Parse(err) if err.is_malformed() || err.is_broken() => ErrorKind::Malformed,
            Error::Parse(_) => ErrorKind::Syntax,
            Error::MissingVia(_) => ErrorKind::Malformed,
            Error::Pool { .. } => ErrorKind::Pool,
            Error::UnsupportedProtocol(_)
            | Error::InvalidTarget(_)
            | Error::Tls(_)
            | Error::Dns(_) => ErrorKind::Protocol,
            Error::WebSocket(_) => ErrorKind::Network,
            Error::Canceled(_) => ErrorKind::Canceled,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Timeout)
    }

    pub fn is_eof(&self) -> bool {
        self.kind() == ErrorKind::Eof
    }

    pub fn is_expired(&self) -> bool {
        self.kind() == ErrorKind::Expired
    }

    /// Connection key of a handler-level error.
    pub fn handler_key(&self) -> Option<&ConnectionKey> {
        match self {
            Error::ConnectionHandler { key, .. } | Error::ListenerHandler { key, .. } => Some(key),
            _ => None,
        }
    }
}
