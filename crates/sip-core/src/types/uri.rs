//! SIP and SIPS URIs (RFC 3261 Section 19.1).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::Params;

/// A SIP URI, or the `*` wildcard allowed in `Contact` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Uri {
    Sip(SipUri),
    Wildcard,
}

impl Uri {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Uri::Wildcard)
    }

    pub fn as_sip(&self) -> Option<&SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            Uri::Wildcard => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::Sip(uri) => uri.fmt(f),
            Uri::Wildcard => f.write_str("*"),
        }
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::uri::parse_uri(s)
    }
}

impl From<SipUri> for Uri {
    fn from(uri: SipUri) -> Self {
        Uri::Sip(uri)
    }
}

/// `sip:` or `sips:` URI.
///
/// The host is stored without IPv6 brackets; they are restored on output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipUri {
    /// `true` for `sips:`
    pub encrypted: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub uri_params: Params,
    pub headers: Params,
}

impl SipUri {
    /// Creates `sip:host` with no user part.
    pub fn new(host: impl Into<String>) -> Self {
        SipUri {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// `host[:port]`
    pub fn host_port(&self) -> String {
        let mut out = format_host(&self.host);
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out
    }
}

/// Wraps IPv6 literals in brackets.
pub(crate) fn format_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.encrypted { "sips:" } else { "sip:" })?;

        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            f.write_str(user)?;
            if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }

        f.write_str(&self.host_port())?;

        if !self.uri_params.is_empty() {
            write!(f, ";{}", self.uri_params.to_string_with(';'))?;
        }
        if !self.headers.is_empty() {
            write!(f, "?{}", self.headers.to_string_with('&'))?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::uri::parse_sip_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_full_uri() {
        let mut uri = SipUri::new("example.com").with_user("alice").with_port(5070);
        uri.password = Some("secret".to_string());
        uri.uri_params.add("transport", Some("tcp"));
        uri.uri_params.add("lr", None::<String>);
        uri.headers.add("subject", Some("project"));

        assert_eq!(
            uri.to_string(),
            "sip:alice:secret@example.com:5070;transport=tcp;lr?subject=project"
        );
    }

    #[test]
    fn test_display_ipv6_and_sips() {
        let mut uri = SipUri::new("2001:db8::1").with_port(5061);
        uri.encrypted = true;
        assert_eq!(uri.to_string(), "sips:[2001:db8::1]:5061");
        assert_eq!(Uri::Wildcard.to_string(), "*");
    }
}
