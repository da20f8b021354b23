//! # SIP Via Header
//!
//! Each proxy or user agent that handles a request adds a hop to the `Via`
//! header (RFC 3261 Section 20.42). The top-most hop is the one the transport
//! layer rewrites when sending and annotates with `received`/`rport` when
//! receiving.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::param::Params;
use crate::types::uri::format_host;

/// One `sent-protocol sent-by;params` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViaHop {
    /// E.g. `SIP`
    pub protocol_name: String,
    /// E.g. `2.0`
    pub protocol_version: String,
    /// E.g. `UDP`
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl ViaHop {
    /// Creates a `SIP/2.0/<transport>` hop.
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        ViaHop {
            protocol_name: "SIP".to_string(),
            protocol_version: "2.0".to_string(),
            transport: transport.into(),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    /// `host[:port]`
    pub fn sent_by(&self) -> String {
        let mut out = format_host(&self.host);
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").flatten()
    }
}

impl fmt::Display for ViaHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}",
            self.protocol_name,
            self.protocol_version,
            self.transport,
            self.sent_by()
        )?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params.to_string_with(';'))?;
        }
        Ok(())
    }
}

/// Comma-separated list of hops from one `Via` header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via(pub Vec<ViaHop>);

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            hop.fmt(f)?;
        }
        Ok(())
    }
}
