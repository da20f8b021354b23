use std::net::Ipv6Addr;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    sequence::{delimited, pair, preceded},
    IResult,
};

use crate::error::{Error, Result};
use crate::parser::params::parse_params;
use crate::parser::utils::unescape;
use crate::types::uri::{SipUri, Uri};

/// Parses a URI as it appears in a request line or address header.
///
/// Only `sip:` and `sips:` URIs are supported; `*` yields [`Uri::Wildcard`].
pub fn parse_uri(input: &str) -> Result<Uri> {
    let input = input.trim();
    if input == "*" {
        return Ok(Uri::Wildcard);
    }
    parse_sip_uri(input).map(Uri::Sip)
}

/// Parses `sip[s]:[user[:password]@]host[:port][;params][?headers]`.
pub fn parse_sip_uri(input: &str) -> Result<SipUri> {
    let (encrypted, rest) = strip_scheme(input.trim())
        .ok_or_else(|| Error::InvalidUri(format!("unsupported URI scheme in \"{}\"", input)))?;

    let mut uri = SipUri {
        encrypted,
        ..Default::default()
    };

    let mut rest = rest;
    if let Some(at) = rest.find('@') {
        let userinfo = &rest[..at];
        let (user, password) = match userinfo.find(':') {
            Some(colon) => (&userinfo[..colon], Some(&userinfo[colon + 1..])),
            None => (userinfo, None),
        };
        uri.user = Some(unescape(user)?);
        uri.password = password.map(unescape).transpose()?;
        rest = &rest[at + 1..];
    }

    let host_end = rest.find([';', '?']).unwrap_or(rest.len());
    let (host, port) = parse_host_port(&rest[..host_end])?;
    uri.host = host;
    uri.port = port;
    rest = &rest[host_end..];

    if rest.starts_with(';') {
        let (params, consumed) = parse_params(rest, Some(';'), ';', Some('?'), true, true)?;
        uri.uri_params = params;
        rest = &rest[consumed..];
    }

    if rest.starts_with('?') {
        let (headers, consumed) = parse_params(rest, Some('?'), '&', None, true, false)?;
        uri.headers = headers;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        return Err(Error::InvalidUri(format!(
            "unexpected trailing data \"{}\" in \"{}\"",
            rest, input
        )));
    }

    Ok(uri)
}

fn strip_scheme(input: &str) -> Option<(bool, &str)> {
    let colon = input.find(':')?;
    match input[..colon].to_ascii_lowercase().as_str() {
        "sip" => Some((false, &input[colon + 1..])),
        "sips" => Some((true, &input[colon + 1..])),
        _ => None,
    }
}

fn ipv6_reference(input: &str) -> IResult<&str, &str> {
    delimited(
        char('['),
        take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
        char(']'),
    )(input)
}

fn hostname(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '%'))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    preceded(char(':'), map_res(digit1, u16::from_str))(input)
}

/// Splits `host[:port]`. IPv6 hosts may be bracketed (`[::1]:5060`); a bare
/// IPv6 literal without a port is also accepted. Brackets are not kept.
pub fn parse_host_port(input: &str) -> Result<(String, Option<u16>)> {
    let input = input.trim();
    if let Ok(addr) = Ipv6Addr::from_str(input) {
        return Ok((addr.to_string(), None));
    }

    let parsed: IResult<&str, (&str, Option<u16>)> =
        all_consuming(pair(alt((ipv6_reference, hostname)), opt(port)))(input);

    match parsed {
        Ok((_, (host, port))) => Ok((host.to_string(), port)),
        Err(_) => Err(Error::InvalidHostPort(format!("\"{}\"", input))),
    }
}
