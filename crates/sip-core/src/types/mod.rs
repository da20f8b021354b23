//! SIP message model
//!
//! Plain data types for requests, responses, headers, URIs and parameters.
//! They carry no parsing logic of their own; see [`crate::parser`].

pub mod address;
pub mod header;
pub mod headers;
pub mod message;
pub mod method;
pub mod param;
pub mod uri;
pub mod via;

pub use address::NameAddr;
pub use header::Header;
pub use headers::Headers;
pub use message::{Message, Request, Response, TransportInfo, SIP_VERSION};
pub use method::Method;
pub use param::Params;
pub use uri::{SipUri, Uri};
pub use via::{Via, ViaHop};
