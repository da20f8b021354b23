//! # Header parser registry
//!
//! Each header name maps to a function turning the header value into one or
//! more typed [`Header`]s. The registry is an immutable value built once and
//! shared (usually behind an `Arc`) by every parser that uses it, so parsers
//! stay independent and a test can swap in its own table without touching
//! global state.
//!
//! ```
//! use sipflow_sip_core::parser::headers::HeaderParsers;
//! use sipflow_sip_core::types::Header;
//!
//! let parsers = HeaderParsers::default();
//! let headers = parsers.parse_line("l: 42").unwrap();
//! assert_eq!(headers, vec![Header::ContentLength(42)]);
//!
//! let headers = parsers.parse_line("X-Trace: abc").unwrap();
//! assert_eq!(headers[0].to_string(), "X-Trace: abc");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::{take_till, take_till1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::parser::address::parse_address_values;
use crate::parser::params::parse_params;
use crate::parser::uri::parse_host_port;
use crate::parser::utils::{lws, lws1, split_unquoted, word, ABNF_WS};
use crate::types::header::Header;
use crate::types::method::Method;
use crate::types::param::Params;
use crate::types::uri::Uri;
use crate::types::via::{Via, ViaHop};

/// Largest CSeq sequence number allowed by RFC 3261 (2^31 - 1).
pub const MAX_CSEQ: u32 = 2_147_483_647;

/// Parses one header value. Receives the lower-cased header name and the trimmed value.
pub type HeaderParseFn = fn(&str, &str) -> Result<Vec<Header>>;

/// Immutable map of lower-cased header name to parse function.
#[derive(Clone)]
pub struct HeaderParsers {
    parsers: HashMap<String, HeaderParseFn>,
}

impl HeaderParsers {
    /// A registry without any entries; every header becomes [`Header::Generic`].
    pub fn empty() -> Self {
        HeaderParsers {
            parsers: HashMap::new(),
        }
    }

    /// Starts from the default table.
    pub fn builder() -> HeaderParsersBuilder {
        HeaderParsersBuilder {
            parsers: HeaderParsers::default().parsers,
        }
    }

    pub fn get(&self, name: &str) -> Option<HeaderParseFn> {
        self.parsers.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parsers.contains_key(&name.to_ascii_lowercase())
    }

    /// Parses a value with the registered function, or keeps it verbatim.
    pub fn parse(&self, name: &str, value: &str) -> Result<Vec<Header>> {
        let name = name.trim();
        let value = value.trim();
        let key = name.to_ascii_lowercase();
        match self.parsers.get(&key) {
            Some(parse) => parse(&key, value),
            None => Ok(vec![Header::Generic {
                name: name.to_string(),
                value: value.to_string(),
            }]),
        }
    }

    /// Parses an unfolded `Name: value` line.
    pub fn parse_line(&self, line: &str) -> Result<Vec<Header>> {
        let colon = line.find(':').ok_or_else(|| {
            Error::invalid_header(line.trim(), "field name with no value in header")
        })?;
        self.parse(&line[..colon], &line[colon + 1..])
    }
}

impl Default for HeaderParsers {
    fn default() -> Self {
        let table: &[(&str, HeaderParseFn)] = &[
            ("to", parse_address_header),
            ("t", parse_address_header),
            ("from", parse_address_header),
            ("f", parse_address_header),
            ("contact", parse_address_header),
            ("m", parse_address_header),
            ("call-id", parse_call_id),
            ("i", parse_call_id),
            ("cseq", parse_cseq),
            ("via", parse_via),
            ("v", parse_via),
            ("max-forwards", parse_u32_header),
            ("content-length", parse_u32_header),
            ("l", parse_u32_header),
            ("expires", parse_u32_header),
            ("user-agent", parse_string_header),
            ("content-type", parse_string_header),
            ("c", parse_string_header),
            ("accept", parse_string_header),
            ("allow", parse_allow),
            ("require", parse_option_tags),
            ("supported", parse_option_tags),
            ("k", parse_option_tags),
            ("route", parse_route_header),
            ("record-route", parse_route_header),
        ];

        HeaderParsers {
            parsers: table
                .iter()
                .map(|(name, f)| (name.to_string(), *f))
                .collect(),
        }
    }
}

impl fmt::Debug for HeaderParsers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.parsers.keys().collect();
        names.sort();
        f.debug_struct("HeaderParsers").field("names", &names).finish()
    }
}

/// Mutable stage of a [`HeaderParsers`] table.
pub struct HeaderParsersBuilder {
    parsers: HashMap<String, HeaderParseFn>,
}

impl HeaderParsersBuilder {
    /// Adds or overrides the parser for `name`.
    pub fn register(mut self, name: &str, parse: HeaderParseFn) -> Self {
        self.parsers.insert(name.to_ascii_lowercase(), parse);
        self
    }

    /// Makes `name` a generic header again.
    pub fn unregister(mut self, name: &str) -> Self {
        self.parsers.remove(&name.to_ascii_lowercase());
        self
    }

    pub fn build(self) -> HeaderParsers {
        HeaderParsers {
            parsers: self.parsers,
        }
    }
}

/// `To`, `From` and `Contact`.
pub fn parse_address_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let addresses = parse_address_values(value).map_err(|e| Error::invalid_header(name, e))?;
    let mut headers = Vec::with_capacity(addresses.len());

    for (idx, addr) in addresses.into_iter().enumerate() {
        match name {
            "to" | "t" | "from" | "f" => {
                let canonical = if name.starts_with('t') { "To" } else { "From" };
                if idx > 0 {
                    return Err(Error::invalid_header(
                        canonical,
                        format!("multiple {} addresses in a single header", canonical),
                    ));
                }
                if addr.uri.is_wildcard() {
                    return Err(Error::invalid_header(
                        canonical,
                        "wildcard uri not permitted",
                    ));
                }
                if canonical == "To" {
                    headers.push(Header::To(addr));
                } else {
                    headers.push(Header::From(addr));
                }
            }
            "contact" | "m" => {
                if addr.uri.is_wildcard() && (addr.display_name.is_some() || !addr.params.is_empty()) {
                    return Err(Error::invalid_header(
                        "Contact",
                        "wildcard only permitted without display name and parameters",
                    ));
                }
                headers.push(Header::Contact(addr));
            }
            other => {
                return Err(Error::invalid_header(other, "not an address header"));
            }
        }
    }

    Ok(headers)
}

fn call_id(input: &str) -> IResult<&str, &str> {
    all_consuming(take_till1(|c: char| c.is_whitespace() || c == ';'))(input)
}

/// `Call-ID`: an opaque token without whitespace or `;`.
pub fn parse_call_id(_name: &str, value: &str) -> Result<Vec<Header>> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::invalid_header("Call-ID", "empty Call-ID body"));
    }
    let (_, id) = call_id(value).map_err(|_| {
        Error::invalid_header(
            "Call-ID",
            format!("unexpected whitespace or ';' in Call-ID \"{}\"", value),
        )
    })?;
    Ok(vec![Header::CallId(id.to_string())])
}

fn cseq(input: &str) -> IResult<&str, (u32, &str)> {
    all_consuming(delimited(
        lws,
        separated_pair(map_res(digit1, u32::from_str), lws1, word(&[])),
        lws,
    ))(input)
}

/// `CSeq: <seq> <method>`.
pub fn parse_cseq(_name: &str, value: &str) -> Result<Vec<Header>> {
    let (_, (seq, method)) = cseq(value).map_err(|_| {
        Error::invalid_header(
            "CSeq",
            format!("CSeq field should be a sequence number and a method: '{}'", value),
        )
    })?;
    if seq > MAX_CSEQ {
        return Err(Error::invalid_header(
            "CSeq",
            format!("invalid CSeq {}: exceeds maximum permitted value 2**31 - 1", seq),
        ));
    }

    if method.contains(';') {
        return Err(Error::invalid_header(
            "CSeq",
            format!("unexpected ';' in CSeq body: {}", value),
        ));
    }
    let method = Method::from_str(method)?;

    Ok(vec![Header::CSeq { seq, method }])
}

/// `name / version / transport LWS`, returning the three parts.
fn sent_protocol(input: &str) -> IResult<&str, (&str, &str, &str)> {
    const SLASH: &[char] = &['/'];
    let (rest, (name, _, version, _, transport, _)) = preceded(
        lws,
        tuple((
            word(SLASH),
            delimited(lws, char('/'), lws),
            word(SLASH),
            delimited(lws, char('/'), lws),
            word(SLASH),
            lws1,
        )),
    )(input)?;
    Ok((rest, (name, version, transport)))
}

/// `sent-by` up to the first `;`, then the raw params.
fn sent_by(input: &str) -> IResult<&str, &str> {
    take_till(|c: char| c == ';')(input)
}

/// `Via`: comma-separated hops of `name/version/transport sent-by;params`.
pub fn parse_via(_name: &str, value: &str) -> Result<Vec<Header>> {
    let mut hops = Vec::new();

    for section in split_unquoted(value, ',') {
        let (rest, (protocol_name, protocol_version, transport)) =
            sent_protocol(section).map_err(|_| {
                Error::invalid_header(
                    "Via",
                    format!("invalid sent-protocol in via header: '{}'", section),
                )
            })?;

        let (params, host_port) = sent_by(rest.trim_end_matches(ABNF_WS)).map_err(|_| {
            Error::invalid_header("Via", format!("invalid sent-by in via header: '{}'", section))
        })?;
        let (host, port) = parse_host_port(host_port.trim_end_matches(ABNF_WS))
            .map_err(|e| Error::invalid_header("Via", e))?;

        let params = if params.is_empty() {
            Params::new()
        } else {
            parse_params(params, Some(';'), ';', None, true, true)
                .map_err(|e| Error::invalid_header("Via", e))?
                .0
        };

        hops.push(ViaHop {
            protocol_name: protocol_name.to_string(),
            protocol_version: protocol_version.to_string(),
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        });
    }

    Ok(vec![Header::Via(Via(hops))])
}

/// `Max-Forwards`, `Content-Length` and `Expires`.
pub fn parse_u32_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let n = value
        .trim()
        .parse::<u32>()
        .map_err(|e| Error::invalid_header(name, format!("'{}': {}", value, e)))?;
    Ok(vec![match name {
        "max-forwards" => Header::MaxForwards(n),
        "content-length" | "l" => Header::ContentLength(n),
        "expires" => Header::Expires(n),
        other => Header::Generic {
            name: other.to_string(),
            value: n.to_string(),
        },
    }])
}

/// `User-Agent`, `Content-Type` and `Accept`.
pub fn parse_string_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let value = value.trim().to_string();
    Ok(vec![match name {
        "user-agent" => Header::UserAgent(value),
        "content-type" | "c" => Header::ContentType(value),
        "accept" => Header::Accept(value),
        other => Header::Generic {
            name: other.to_string(),
            value,
        },
    }])
}

/// `Allow: INVITE, ACK, ...`
pub fn parse_allow(_name: &str, value: &str) -> Result<Vec<Header>> {
    let methods = value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(Method::from_str)
        .collect::<Result<Vec<_>>>()?;
    Ok(vec![Header::Allow(methods)])
}

/// `Require` and `Supported` option tag lists.
pub fn parse_option_tags(name: &str, value: &str) -> Result<Vec<Header>> {
    let tags: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    Ok(vec![match name {
        "require" => Header::Require(tags),
        _ => Header::Supported(tags),
    }])
}

/// `Route` and `Record-Route`.
pub fn parse_route_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let uris: Vec<Uri> = parse_address_values(value)
        .map_err(|e| Error::invalid_header(name, e))?
        .into_iter()
        .map(|addr| addr.uri)
        .collect();
    Ok(vec![if name == "route" {
        Header::Route(uris)
    } else {
        Header::RecordRoute(uris)
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Vec<Header>> {
        HeaderParsers::default().parse_line(line)
    }

    #[test]
    fn test_compact_forms() {
        assert!(matches!(parse("t: <sip:bob@b.com>").unwrap()[0], Header::To(_)));
        assert!(matches!(parse("f: <sip:a@b.com>;tag=1").unwrap()[0], Header::From(_)));
        assert!(matches!(parse("m: <sip:a@10.0.0.1>").unwrap()[0], Header::Contact(_)));
        assert!(matches!(parse("i: abc@host").unwrap()[0], Header::CallId(_)));
        assert!(matches!(parse("v: SIP/2.0/UDP h").unwrap()[0], Header::Via(_)));
        assert!(matches!(parse("c: application/sdp").unwrap()[0], Header::ContentType(_)));
        assert!(matches!(parse("k: 100rel").unwrap()[0], Header::Supported(_)));
    }

    #[test]
    fn test_to_rejects_multiple_and_wildcard() {
        assert!(parse("To: <sip:a@b.com>, <sip:c@d.com>").is_err());
        assert!(parse("From: *").is_err());
    }

    #[test]
    fn test_contact_wildcard_rules() {
        let headers = parse("Contact: *").unwrap();
        assert_eq!(headers.len(), 1);
        assert!(parse("Contact: *;expires=0").is_err());

        let headers = parse("Contact: <sip:a@1.2.3.4>;expires=60, \"B\" <sip:b@5.6.7.8>").unwrap();
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_cseq_rules() {
        assert_eq!(
            parse("CSeq: 314159 INVITE").unwrap(),
            vec![Header::CSeq { seq: 314159, method: Method::Invite }]
        );
        assert!(parse("CSeq: 2147483647 ACK").is_ok());
        assert!(parse("CSeq: 2147483648 ACK").is_err());
        assert!(parse("CSeq: 1").is_err());
        assert!(parse("CSeq: 1 INVITE extra").is_err());
        assert!(parse("CSeq: 1 INV;ITE").is_err());
        assert!(parse("CSeq: x INVITE").is_err());
        assert_eq!(
            parse("CSeq:  7\tACK ").unwrap(),
            vec![Header::CSeq { seq: 7, method: Method::Ack }]
        );
    }

    #[test]
    fn test_call_id_rules() {
        assert_eq!(
            parse("Call-ID:  a84b4c76e66710@pc33.atlanta.com ").unwrap(),
            vec![Header::CallId("a84b4c76e66710@pc33.atlanta.com".to_string())]
        );
        assert!(parse("Call-ID: ").is_err());
        assert!(parse("Call-ID: a b").is_err());
        assert!(parse("Call-ID: a;b").is_err());
    }

    #[test]
    fn test_via_hops() {
        let headers = parse(
            "Via: SIP/2.0/udp pc33.atlanta.com:5066;branch=z9hG4bK776asdhds;rport, SIP / 2.0 / TCP [::1];received=10.0.0.1",
        )
        .unwrap();
        let via = match &headers[0] {
            Header::Via(via) => via,
            other => panic!("unexpected header {:?}", other),
        };
        assert_eq!(via.0.len(), 2);

        let top = &via.0[0];
        assert_eq!(top.protocol_name, "SIP");
        assert_eq!(top.protocol_version, "2.0");
        assert_eq!(top.transport, "UDP");
        assert_eq!(top.host, "pc33.atlanta.com");
        assert_eq!(top.port, Some(5066));
        assert_eq!(top.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(top.params.get("rport"), Some(None));

        let second = &via.0[1];
        assert_eq!(second.transport, "TCP");
        assert_eq!(second.host, "::1");
        assert_eq!(second.params.get("received"), Some(Some("10.0.0.1")));
    }

    #[test]
    fn test_via_errors() {
        assert!(parse("Via: SIP/2.0 host").is_err());
        assert!(parse("Via: SIP/2.0/UDP").is_err());
        assert!(parse("Via: SIP/2.0/ host").is_err());
        assert!(parse("Via: /2.0/UDP host").is_err());
        assert!(parse("Via: SIP/2.0/UDP host;branch=\"x").is_err());
        assert!(parse("Via: SIP/2.0/UDP ;branch=x").is_err());
        let err = parse("Via: SIP/2.0/ host").unwrap_err();
        assert!(err.to_string().contains("invalid sent-protocol"));
    }

    #[test]
    fn test_numeric_and_list_headers() {
        assert_eq!(parse("Max-Forwards: 70").unwrap(), vec![Header::MaxForwards(70)]);
        assert_eq!(parse("Expires: 3600").unwrap(), vec![Header::Expires(3600)]);
        assert!(parse("Content-Length: -1").is_err());
        assert_eq!(
            parse("Allow: INVITE, ack ,BYE").unwrap(),
            vec![Header::Allow(vec![Method::Invite, Method::Ack, Method::Bye])]
        );
        assert_eq!(
            parse("Require: 100rel, timer").unwrap(),
            vec![Header::Require(vec!["100rel".to_string(), "timer".to_string()])]
        );
    }

    #[test]
    fn test_route_headers() {
        let headers = parse("Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>").unwrap();
        match &headers[0] {
            Header::RecordRoute(uris) => {
                assert_eq!(uris.len(), 2);
                assert_eq!(uris[1].to_string(), "sip:p2.example.com;lr");
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn test_missing_colon() {
        assert!(parse("NoColonHere").is_err());
    }

    #[test]
    fn test_builder_overrides() {
        fn shout(_name: &str, value: &str) -> Result<Vec<Header>> {
            Ok(vec![Header::Generic {
                name: "Subject".to_string(),
                value: value.to_uppercase(),
            }])
        }

        let parsers = HeaderParsers::builder()
            .register("Subject", shout)
            .unregister("allow")
            .build();
        assert_eq!(parsers.parse_line("subject: hi").unwrap()[0].value(), "HI");
        assert!(matches!(
            parsers.parse_line("Allow: INVITE").unwrap()[0],
            Header::Generic { .. }
        ));
        assert!(HeaderParsers::empty().parse_line("To: <sip:a@b.c>").is_ok());
    }
}
