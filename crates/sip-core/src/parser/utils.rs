// Utility functions for parsing

use nom::{
    bytes::complete::{take_till1, take_while, take_while1},
    IResult,
};

use crate::error::{Error, Result};

/// Linear white space characters.
pub const ABNF_WS: &[char] = &[' ', '\t'];

/// Decodes percent-encoding (%HH) in a parameter key, value or URI user part.
pub fn unescape(input: &str) -> Result<String> {
    if !input.contains('%') {
        return Ok(input.to_string());
    }

    let bytes = input.as_bytes();
    let mut unescaped: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 < bytes.len() {
                    let h1 = bytes[i + 1];
                    let h2 = bytes[i + 2];
                    match (hex_val(h1), hex_val(h2)) {
                        (Some(v1), Some(v2)) => {
                            unescaped.push((v1 << 4) | v2);
                            i += 3;
                        }
                        _ => {
                            return Err(Error::Parser(format!(
                                "invalid escape sequence %{}{} in \"{}\"",
                                h1 as char, h2 as char, input
                            )))
                        }
                    }
                } else {
                    return Err(Error::Parser(format!(
                        "incomplete escape sequence in \"{}\"",
                        input
                    )));
                }
            }
            b => {
                unescaped.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(unescaped)
        .map_err(|e| Error::Parser(format!("invalid UTF-8 after unescaping \"{}\": {}", input, e)))
}

// Helper to convert a hex character (byte) to its value (0-15)
fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn is_ws(c: char) -> bool {
    ABNF_WS.contains(&c)
}

/// Optional run of spaces/tabs.
pub fn lws(input: &str) -> IResult<&str, &str> {
    take_while(is_ws)(input)
}

/// At least one space or tab.
pub fn lws1(input: &str) -> IResult<&str, &str> {
    take_while1(is_ws)(input)
}

/// Non-empty run of characters up to whitespace or one of `stop`.
pub fn word<'a>(stop: &'static [char]) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    take_till1(move |c: char| is_ws(c) || stop.contains(&c))
}

/// Splits on `sep` occurrences that are neither inside double quotes nor inside `<...>`.
pub fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut start = 0;

    for (idx, c) in input.char_indices() {
        match c {
            '"' if !in_brackets => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            c if c == sep && !in_quotes && !in_brackets => {
                parts.push(&input[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}
