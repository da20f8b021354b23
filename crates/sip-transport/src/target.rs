use std::fmt;
use std::net::IpAddr;

use sipflow_sip_core::parser::parse_host_port;

use crate::error::{Error, Result};
use crate::network::Network;

/// Host and optional port used for listen, dial and send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host name or IP literal, IPv6 without brackets
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `:port` or `[v6]:port`. An empty string is an empty target.
    pub fn from_addr(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Ok(Target::default());
        }

        if let Some(port) = addr.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::InvalidTarget(format!("{}: {}", addr, e)))?;
            return Ok(Target::new("", Some(port)));
        }

        let (host, port) =
            parse_host_port(addr).map_err(|e| Error::InvalidTarget(format!("{}: {}", addr, e)))?;
        Ok(Target { host, port })
    }

    /// Empty host becomes `0.0.0.0`, missing port becomes the network default.
    pub fn fill_defaults(mut self, network: Network) -> Self {
        if self.host.is_empty() {
            self.host = "0.0.0.0".to_string();
        }
        if self.port.is_none() {
            self.port = Some(network.default_port());
        }
        self
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// `host[:port]`, with brackets around IPv6 hosts
    pub fn addr(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_addr() {
        assert_eq!(
            Target::from_addr("example.com:5070").unwrap(),
            Target::new("example.com", Some(5070))
        );
        assert_eq!(Target::from_addr("10.0.0.1").unwrap(), Target::new("10.0.0.1", None));
        assert_eq!(Target::from_addr(":5080").unwrap(), Target::new("", Some(5080)));
        assert_eq!(Target::from_addr("").unwrap(), Target::default());
        assert!(Target::from_addr("host:notaport").is_err());
    }

    #[test]
    fn test_ipv6_target() {
        let target = Target::from_addr("[::1]:5061").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.addr(), "[::1]:5061");
        assert!(target.ip().is_some());
    }

    #[test]
    fn test_fill_defaults() {
        let target = Target::default().fill_defaults(Network::Tls);
        assert_eq!(target.addr(), "0.0.0.0:5061");

        let target = Target::new("example.com", Some(5090)).fill_defaults(Network::Udp);
        assert_eq!(target.addr(), "example.com:5090");
    }
}
