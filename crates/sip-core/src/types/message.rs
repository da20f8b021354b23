//! # SIP Messages
//!
//! [`Request`] and [`Response`] hold the start line, the [`Headers`] and the
//! raw body. Both also carry [`TransportInfo`]: the transport name and the
//! source/destination addresses that the transport layer attaches on receipt
//! and reads when sending.
//!
//! ```rust
//! use sipflow_sip_core::types::{Header, Message, Method, Request, SipUri};
//!
//! let mut request = Request::new(Method::Options, SipUri::new("example.com").into());
//! request.headers.append(Header::CallId("a84b4c76e66710".to_string()));
//! request.set_body("hello", true);
//!
//! let message = Message::Request(request);
//! assert_eq!(
//!     message.to_string(),
//!     "OPTIONS sip:example.com SIP/2.0\r\nCall-ID: a84b4c76e66710\r\nContent-Length: 5\r\n\r\nhello"
//! );
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::header::Header;
use crate::types::headers::Headers;
use crate::types::method::Method;
use crate::types::uri::Uri;
use crate::types::via::ViaHop;

/// Version token written by this crate.
pub const SIP_VERSION: &str = "SIP/2.0";

/// Transport metadata attached to a message.
///
/// Addresses are kept as `host:port` strings because an outgoing
/// destination may still be an unresolved host name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub transport: String,
    pub source: String,
    pub destination: String,
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub recipient: Uri,
    pub sip_version: String,
    pub headers: Headers,
    pub body: Bytes,
    pub transport_info: TransportInfo,
}

impl Request {
    pub fn new(method: Method, recipient: Uri) -> Self {
        Request {
            method,
            recipient,
            sip_version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            transport_info: TransportInfo::default(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.append(header);
        self
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.method, self.recipient, self.sip_version)
    }

    /// Sets the body, optionally replacing or adding `Content-Length`.
    pub fn set_body(&mut self, body: impl Into<Bytes>, set_content_length: bool) {
        self.body = body.into();
        if set_content_length {
            self.headers.replace(Header::ContentLength(self.body.len() as u32));
        }
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub sip_version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
    pub transport_info: TransportInfo,
}

impl Response {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Response {
            sip_version: SIP_VERSION.to_string(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            transport_info: TransportInfo::default(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.append(header);
        self
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.sip_version, self.status_code, self.reason)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>, set_content_length: bool) {
        self.body = body.into();
        if set_content_length {
            self.headers.replace(Header::ContentLength(self.body.len() as u32));
        }
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(req) => Some(req),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(res) => Some(res),
            Message::Request(_) => None,
        }
    }

    pub fn start_line(&self) -> String {
        match self {
            Message::Request(req) => req.start_line(),
            Message::Response(res) => res.start_line(),
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(res) => &res.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(req) => &mut req.headers,
            Message::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(res) => &res.body,
        }
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>, set_content_length: bool) {
        match self {
            Message::Request(req) => req.set_body(body, set_content_length),
            Message::Response(res) => res.set_body(body, set_content_length),
        }
    }

    fn info(&self) -> &TransportInfo {
        match self {
            Message::Request(req) => &req.transport_info,
            Message::Response(res) => &res.transport_info,
        }
    }

    fn info_mut(&mut self) -> &mut TransportInfo {
        match self {
            Message::Request(req) => &mut req.transport_info,
            Message::Response(res) => &mut res.transport_info,
        }
    }

    pub fn transport(&self) -> &str {
        &self.info().transport
    }

    /// Stores the transport name upper-cased, as it appears in Via headers.
    pub fn set_transport(&mut self, transport: &str) {
        self.info_mut().transport = transport.to_ascii_uppercase();
    }

    pub fn source(&self) -> &str {
        &self.info().source
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.info_mut().source = source.into();
    }

    pub fn destination(&self) -> &str {
        &self.info().destination
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.info_mut().destination = destination.into();
    }

    pub fn via_hop(&self) -> Option<&ViaHop> {
        self.headers().via_hop()
    }

    pub fn via_hop_mut(&mut self) -> Option<&mut ViaHop> {
        self.headers_mut().via_hop_mut()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id()
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(self.start_line().as_bytes());
        buf.put_slice(b"\r\n");
        for header in self.headers().iter() {
            buf.put_slice(header.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(self.body());
        buf.freeze()
    }

    /// One-line summary for logs.
    pub fn short(&self) -> String {
        let mut out = self.start_line();
        if let Some(call_id) = self.call_id() {
            out.push_str(&format!(" (Call-ID: {})", call_id));
        }
        if !self.transport().is_empty() {
            out.push_str(&format!(" [{} {} -> {}]", self.transport(), self.source(), self.destination()));
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line())?;
        for header in self.headers().iter() {
            write!(f, "{}\r\n", header)?;
        }
        f.write_str("\r\n")?;
        f.write_str(&String::from_utf8_lossy(self.body()))
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}
