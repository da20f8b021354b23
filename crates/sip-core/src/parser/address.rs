use crate::error::{Error, Result};
use crate::parser::params::parse_params;
use crate::parser::uri::parse_uri;
use crate::parser::utils::{split_unquoted, ABNF_WS};
use crate::types::address::NameAddr;
use crate::types::param::Params;

/// Parses a comma-separated list of addresses, e.g. a `Contact` or `Route` value.
///
/// Commas inside quoted display names or inside `<...>` do not split.
pub fn parse_address_values(input: &str) -> Result<Vec<NameAddr>> {
    split_unquoted(input, ',')
        .into_iter()
        .map(parse_address_value)
        .collect()
}

/// Parses one `[display-name] <uri>;params` or `uri;params` value.
pub fn parse_address_value(input: &str) -> Result<NameAddr> {
    let mut text = input.trim_matches(ABNF_WS);
    if text.is_empty() {
        return Err(Error::InvalidUri("empty address value".to_string()));
    }

    let mut display_name = None;
    if let Some(bracket) = find_unquoted(text, '<').filter(|&idx| idx > 0) {
        if text.starts_with('"') {
            let closing = text[1..]
                .find('"')
                .ok_or_else(|| Error::InvalidUri(format!("unclosed quotes in \"{}\"", input)))?;
            display_name = Some(text[1..closing + 1].to_string());
            text = &text[closing + 2..];
        } else {
            let name = text[..bracket].trim_matches(ABNF_WS);
            if !name.is_empty() {
                display_name = Some(name.to_string());
            }
            text = &text[bracket..];
        }
    }

    let text = text.trim_matches(ABNF_WS);
    let (uri_text, params_text) = match text.strip_prefix('<') {
        Some(inner) => {
            let close = inner.find('>').ok_or_else(|| {
                Error::InvalidUri(format!("'<' without closing '>' in \"{}\"", input))
            })?;
            (&inner[..close], &inner[close + 1..])
        }
        None => {
            if display_name.is_some() {
                return Err(Error::InvalidUri(format!(
                    "display name without angle brackets in \"{}\"",
                    input
                )));
            }
            let end = text.find(';').unwrap_or(text.len());
            (&text[..end], &text[end..])
        }
    };

    let uri = parse_uri(uri_text)?;

    let params_text = params_text.trim_matches(ABNF_WS);
    let params = if params_text.is_empty() {
        Params::new()
    } else {
        parse_params(params_text, Some(';'), ';', Some(','), true, true)?.0
    };

    Ok(NameAddr {
        display_name,
        uri,
        params,
    })
}

fn find_unquoted(text: &str, target: char) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == target && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}
