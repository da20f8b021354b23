//! Transport configuration
//!
//! All settings are programmatic. The structs derive `serde` traits so a host
//! application can also load them from its own configuration files.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sipflow_sip_core::Message;

/// Default capacity of the transport layer channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
/// Default lease of dialed and accepted stream connections
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(60 * 60);

/// Hook applied to every parsed inbound message before it is forwarded.
pub type MessageMapper = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Top-level transport layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// IP written into the top Via of outgoing requests
    pub host_ip: IpAddr,
    /// Bound of the public message and error channels
    pub channel_capacity: usize,
    /// Lease of stream connections, renewed by inbound traffic
    pub connection_ttl: Duration,
    /// Client side TLS settings for TLS and WSS dialing
    pub tls: TlsClientConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            tls: TlsClientConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(host_ip: IpAddr) -> Self {
        TransportConfig {
            host_ip,
            ..Default::default()
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }
}

/// Server certificate check when dialing TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertVerification {
    /// Verify the chain against the trust store and the server name
    #[default]
    Strict,
    /// Accept any certificate. Only for test setups.
    Insecure,
}

/// TLS client settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    pub verification: CertVerification,
    /// PEM bundle added to the built-in roots
    pub ca_path: Option<PathBuf>,
    /// SNI name to use instead of the target host
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn insecure() -> Self {
        TlsClientConfig {
            verification: CertVerification::Insecure,
            ..Default::default()
        }
    }

    pub fn with_ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Certificate and key of a TLS or WSS listener, both PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsServerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        TlsServerConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// Per-listen options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Required for TLS and WSS listeners
    pub tls: Option<TlsServerConfig>,
}

impl ListenOptions {
    pub fn with_tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Debug helper for structs holding an optional mapper.
pub(crate) struct MapperDebug<'a>(pub &'a Option<MessageMapper>);

impl fmt::Debug for MapperDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Some(<mapper>)"),
            None => f.write_str("None"),
        }
    }
}
