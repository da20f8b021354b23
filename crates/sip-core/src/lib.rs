//! Core SIP message model and parser for sipflow
//!
//! This crate provides the SIP message types, the header registry and the
//! datagram/stream [`Parser`](parser::Parser) used by `sipflow-sip-transport`.

pub mod error;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use parser::{parse_message, HeaderParsers, Parser};
pub use types::{
    Header, Headers, Message, Method, NameAddr, Params, Request, Response, SipUri, TransportInfo,
    Uri, Via, ViaHop, SIP_VERSION,
};

/// Re-export of common types and functions
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::parser::message::{MAX_BODY_SIZE, MAX_LINE_LENGTH};
    pub use crate::parser::{parse_message, HeaderParsers, Parser};
    pub use crate::types::{
        Header, Headers, Message, Method, NameAddr, Params, Request, Response, SipUri, Uri, Via,
        ViaHop,
    };
}
