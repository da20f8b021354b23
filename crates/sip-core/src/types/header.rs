//! # SIP Headers
//!
//! [`Header`] is a closed set of the headers the transport layer and its
//! callers inspect, plus [`Header::Generic`] for everything else. Typed
//! headers always serialize under their canonical long name, even when they
//! were received in compact form (`v:` becomes `Via:`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::address::NameAddr;
use crate::types::method::Method;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// A single parsed header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    To(NameAddr),
    From(NameAddr),
    Contact(NameAddr),
    CallId(String),
    CSeq { seq: u32, method: Method },
    Via(Via),
    MaxForwards(u32),
    ContentLength(u32),
    Expires(u32),
    UserAgent(String),
    ContentType(String),
    Accept(String),
    Allow(Vec<Method>),
    Require(Vec<String>),
    Supported(Vec<String>),
    Route(Vec<Uri>),
    RecordRoute(Vec<Uri>),
    /// Header without a registered parser, stored verbatim
    Generic { name: String, value: String },
}

impl Header {
    /// Canonical header name.
    pub fn name(&self) -> &str {
        match self {
            Header::To(_) => "To",
            Header::From(_) => "From",
            Header::Contact(_) => "Contact",
            Header::CallId(_) => "Call-ID",
            Header::CSeq { .. } => "CSeq",
            Header::Via(_) => "Via",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::ContentLength(_) => "Content-Length",
            Header::Expires(_) => "Expires",
            Header::UserAgent(_) => "User-Agent",
            Header::ContentType(_) => "Content-Type",
            Header::Accept(_) => "Accept",
            Header::Allow(_) => "Allow",
            Header::Require(_) => "Require",
            Header::Supported(_) => "Supported",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::Generic { name, .. } => name.as_str(),
        }
    }

    /// Value part of the header line.
    pub fn value(&self) -> String {
        match self {
            Header::To(addr) | Header::From(addr) | Header::Contact(addr) => addr.to_string(),
            Header::CallId(id) => id.clone(),
            Header::CSeq { seq, method } => format!("{} {}", seq, method),
            Header::Via(via) => via.to_string(),
            Header::MaxForwards(n) | Header::ContentLength(n) | Header::Expires(n) => n.to_string(),
            Header::UserAgent(s) | Header::ContentType(s) | Header::Accept(s) => s.clone(),
            Header::Allow(methods) => join(methods.iter().map(|m| m.to_string()), ", "),
            Header::Require(tags) | Header::Supported(tags) => tags.join(", "),
            Header::Route(uris) | Header::RecordRoute(uris) => {
                join(uris.iter().map(|u| format!("<{}>", u)), ", ")
            }
            Header::Generic { value, .. } => value.clone(),
        }
    }
}

fn join(items: impl Iterator<Item = String>, sep: &str) -> String {
    items.collect::<Vec<_>>().join(sep)
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uri::SipUri;
    use crate::types::via::ViaHop;

    #[test]
    fn test_header_display() {
        let cseq = Header::CSeq { seq: 314159, method: Method::Invite };
        assert_eq!(cseq.to_string(), "CSeq: 314159 INVITE");

        let allow = Header::Allow(vec![Method::Invite, Method::Ack, Method::Bye]);
        assert_eq!(allow.to_string(), "Allow: INVITE, ACK, BYE");

        let route = Header::Route(vec![
            Uri::Sip(SipUri::new("p1.example.com")),
            Uri::Sip(SipUri::new("p2.example.com")),
        ]);
        assert_eq!(route.to_string(), "Route: <sip:p1.example.com>, <sip:p2.example.com>");

        let via = Header::Via(Via(vec![ViaHop::new("UDP", "host", None)]));
        assert_eq!(via.name(), "Via");
        assert_eq!(via.to_string(), "Via: SIP/2.0/UDP host");
    }

    #[test]
    fn test_generic_keeps_name() {
        let h = Header::Generic {
            name: "X-Custom".to_string(),
            value: "abc".to_string(),
        };
        assert_eq!(h.to_string(), "X-Custom: abc");
    }
}
