//! SIP message parsing
//!
//! [`Parser`] frames and parses whole messages; the submodules hold the
//! grammar pieces it is built from (start lines, URIs, addresses, parameter
//! lists) and the pluggable [`HeaderParsers`] registry.

pub mod address;
pub mod headers;
pub mod message;
pub mod params;
pub mod start_line;
pub mod uri;
pub mod utils;

pub use address::{parse_address_value, parse_address_values};
pub use headers::{HeaderParseFn, HeaderParsers, HeaderParsersBuilder};
pub use message::{parse_message, Parser, MAX_BODY_SIZE, MAX_LINE_LENGTH};
pub use params::parse_params;
pub use uri::{parse_host_port, parse_sip_uri, parse_uri};
