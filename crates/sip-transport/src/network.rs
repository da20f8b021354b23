use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport protocols known to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Network {
    pub const ALL: [Network; 5] = [
        Network::Udp,
        Network::Tcp,
        Network::Tls,
        Network::Ws,
        Network::Wss,
    ];

    /// Lower-case name, as used in connection keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
            Network::Tls => "tls",
            Network::Ws => "ws",
            Network::Wss => "wss",
        }
    }

    /// Upper-case name, as written in the Via transport field
    pub fn as_via_transport(&self) -> &'static str {
        match self {
            Network::Udp => "UDP",
            Network::Tcp => "TCP",
            Network::Tls => "TLS",
            Network::Ws => "WS",
            Network::Wss => "WSS",
        }
    }

    /// Ordered and lossless delivery
    pub fn reliable(&self) -> bool {
        !matches!(self, Network::Udp)
    }

    /// Byte stream rather than framed datagrams
    pub fn streamed(&self) -> bool {
        !matches!(self, Network::Udp)
    }

    /// Runs over TLS
    pub fn secure(&self) -> bool {
        matches!(self, Network::Tls | Network::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Network::Ws | Network::Wss)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Udp | Network::Tcp => 5060,
            Network::Tls => 5061,
            Network::Ws => 80,
            Network::Wss => 443,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Network::Udp),
            "tcp" => Ok(Network::Tcp),
            "tls" => Ok(Network::Tls),
            "ws" => Ok(Network::Ws),
            "wss" => Ok(Network::Wss),
            _ => Err(Error::UnsupportedProtocol(s.to_string())),
        }
    }
}
