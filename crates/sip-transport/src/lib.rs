//! SIP transport layer for the sipflow stack
//!
//! This crate moves SIP messages over UDP, TCP, TLS, WebSocket and secure
//! WebSocket. Inbound bytes are framed and parsed by
//! [`sipflow_sip_core::Parser`]; outbound messages reuse pooled connections
//! or dial new ones.
//!
//! The layers, from the bottom up:
//!
//! - [`Connection`]: one socket with stream or datagram semantics
//! - [`ConnectionPool`] / [`ListenerPool`]: keyed handlers that read, parse,
//!   annotate and triage errors
//! - [`Protocol`]: one per network, owning its pools
//! - [`TransportLayer`]: `listen`, `send`, and the `messages`/`errors` channels

pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod dns;
pub mod error;
pub mod layer;
pub mod listener_pool;
pub mod network;
pub mod protocol;
pub mod target;
#[cfg(feature = "tls")]
pub mod tls;

pub use config::{
    CertVerification, ListenOptions, MessageMapper, TlsClientConfig, TlsServerConfig,
    TransportConfig,
};
pub use connection::{Connection, ConnectionKey};
pub use connection_pool::{ConnectionHandler, ConnectionPool};
pub use dns::{DnsResolver, HickoryResolver, SrvRecord, StaticResolver};
pub use error::{Error, ErrorKind, Result};
pub use layer::TransportLayer;
pub use listener_pool::{Listener, ListenerHandler, ListenerPool};
pub use network::Network;
pub use protocol::{Protocol, ProtocolContext, new_protocol};
pub use target::Target;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Error, ErrorKind, ListenOptions, Network, Result, Target, TlsServerConfig,
        TransportConfig, TransportLayer,
    };
    pub use sipflow_sip_core::Message;
}
