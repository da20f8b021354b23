use std::str::FromStr;

use nom::{
    bytes::complete::take_till1,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, rest},
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};
use crate::parser::uri::parse_uri;
use crate::types::method::Method;
use crate::types::uri::Uri;

/// `Method SP Request-URI SP SIP-Version`, split on single spaces.
pub fn is_request_line(line: &str) -> bool {
    if line.matches(' ').count() != 2 {
        return false;
    }
    line.split(' ')
        .nth(2)
        .and_then(|version| version.get(..3))
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("SIP"))
}

/// `SIP-Version SP Status-Code SP Reason-Phrase`, where the reason may contain spaces.
pub fn is_status_line(line: &str) -> bool {
    if line.matches(' ').count() < 2 {
        return false;
    }
    line.get(..3).map_or(false, |prefix| prefix == "SIP")
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c == ' ')(input)
}

fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, (method, _, uri, _, version)) =
        all_consuming(tuple((token, char(' '), token, char(' '), token)))(input)?;
    Ok((input, (method, uri, version)))
}

fn status_line(input: &str) -> IResult<&str, (&str, u16, &str)> {
    let (input, (version, _, code, _, reason)) = all_consuming(tuple((
        token,
        char(' '),
        map_res(digit1, u16::from_str),
        char(' '),
        rest,
    )))(input)?;
    Ok((input, (version, code, reason)))
}

/// Parses a request line into method, recipient URI and version.
///
/// The wildcard URI is not a valid request target.
pub fn parse_request_line(line: &str) -> Result<(Method, Uri, String)> {
    let (_, (method, uri, version)) = request_line(line).map_err(|_| {
        Error::InvalidStartLine(format!("request line should have 2 spaces: '{}'", line))
    })?;

    let method = Method::from_str(method)?;
    let recipient = parse_uri(uri)?;
    if recipient.is_wildcard() {
        return Err(Error::InvalidStartLine(
            "wildcard URI '*' not permitted in request line".to_string(),
        ));
    }

    Ok((method, recipient, version.to_string()))
}

/// Parses a status line into version, status code and reason phrase.
pub fn parse_status_line(line: &str) -> Result<(String, u16, String)> {
    let (_, (version, code, reason)) = status_line(line).map_err(|_| {
        Error::InvalidStartLine(format!("invalid status line: '{}'", line))
    })?;
    Ok((version.to_string(), code, reason.to_string()))
}
