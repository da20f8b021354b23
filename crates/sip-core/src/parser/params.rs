//! Generic `key[=value]` parameter section parser.
//!
//! Used for URI parameters (`;transport=tcp`), URI headers (`?subject=x&priority=y`),
//! Via hop parameters and address header parameters. The same state machine
//! serves all of them; callers choose the delimiters and whether quoted values
//! and value-less keys are allowed.

use crate::error::{Error, Result};
use crate::parser::utils::unescape;
use crate::types::param::Params;

/// Parses a parameter section.
///
/// * `start` - character expected at `source[0]`, if any
/// * `sep` - separator between parameters
/// * `end` - character that terminates the section when seen outside quotes
/// * `quote_values` - whether `"..."` values are recognised
/// * `permit_singletons` - whether keys without `=value` are accepted
///
/// Returns the parameters and the number of bytes consumed. When the section
/// stops at `end`, the returned count is the index of that character.
///
/// ```
/// use sipflow_sip_core::parser::params::parse_params;
///
/// let (params, consumed) = parse_params(";lr;tag=\"a;b\"", Some(';'), ';', None, true, true).unwrap();
/// assert!(params.has("lr"));
/// assert_eq!(params.get("tag"), Some(Some("a;b")));
/// assert_eq!(consumed, 13);
/// ```
pub fn parse_params(
    source: &str,
    start: Option<char>,
    sep: char,
    end: Option<char>,
    quote_values: bool,
    permit_singletons: bool,
) -> Result<(Params, usize)> {
    let mut params = Params::new();
    if source.is_empty() {
        return Ok((params, 0));
    }

    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut idx = 0;

    if let Some(start) = start {
        if chars[0].1 != start {
            return Err(Error::InvalidParams(format!(
                "expected {} at start of key-value section; got {}. section was {}",
                start, chars[0].1, source
            )));
        }
        idx = 1;
    }

    let mut buffer = String::new();
    let mut key = String::new();
    let mut parsing_key = true;
    let mut in_quotes = false;

    while idx < chars.len() {
        let c = chars[idx].1;

        if Some(c) == end && !in_quotes {
            break;
        }

        if c == sep && !in_quotes {
            if parsing_key {
                if !permit_singletons {
                    return Err(singleton_error(&buffer, source));
                }
                params.add(unescape(&buffer)?, None::<String>);
            } else {
                params.add(unescape(&key)?, Some(unescape(&buffer)?));
            }
            buffer.clear();
            parsing_key = true;
            idx += 1;
            continue;
        }

        match c {
            '"' if quote_values => {
                if parsing_key {
                    return Err(Error::InvalidParams(format!(
                        "unexpected '\"' in parameter key in params \"{}\"",
                        source
                    )));
                }
                if !in_quotes && !buffer.is_empty() {
                    return Err(Error::InvalidParams(format!(
                        "unexpected '\"' in params \"{}\"",
                        source
                    )));
                }
                if in_quotes {
                    if let Some(&(_, next)) = chars.get(idx + 1) {
                        if next != sep && Some(next) != end {
                            return Err(Error::InvalidParams(format!(
                                "unexpected character {} after quoted param in \"{}\"",
                                next, source
                            )));
                        }
                    }
                }
                in_quotes = !in_quotes;
            }
            '=' if !in_quotes => {
                if buffer.is_empty() {
                    return Err(Error::InvalidParams(format!(
                        "key of length 0 in params \"{}\"",
                        source
                    )));
                }
                if !parsing_key {
                    return Err(Error::InvalidParams(format!(
                        "unexpected '=' char in value token: \"{}\"",
                        source
                    )));
                }
                key = std::mem::take(&mut buffer);
                parsing_key = false;
            }
            ' ' | '\t' if !in_quotes => {}
            c => buffer.push(c),
        }
        idx += 1;
    }

    if in_quotes {
        return Err(Error::InvalidParams(format!(
            "unclosed quotes in parameter string: {}",
            source
        )));
    }

    if parsing_key {
        if !buffer.is_empty() {
            if !permit_singletons {
                return Err(singleton_error(&buffer, source));
            }
            params.add(unescape(&buffer)?, None::<String>);
        }
    } else {
        params.add(unescape(&key)?, Some(unescape(&buffer)?));
    }

    let consumed = chars.get(idx).map(|&(offset, _)| offset).unwrap_or(source.len());
    Ok((params, consumed))
}

fn singleton_error(key: &str, source: &str) -> Error {
    Error::InvalidParams(format!(
        "singleton param '{}' when parsing params which disallow singletons: \"{}\"",
        key, source
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semi(source: &str) -> Result<Params> {
        parse_params(source, Some(';'), ';', None, true, true).map(|(p, _)| p)
    }

    #[test]
    fn test_basic_params() {
        let params = semi(";transport=tcp;lr;maddr=10.0.0.1").unwrap();
        let collected: Vec<_> = params.iter().collect();
        assert_eq!(
            collected,
            vec![
                ("transport", Some("tcp")),
                ("lr", None),
                ("maddr", Some("10.0.0.1")),
            ]
        );
    }

    #[test]
    fn test_quoted_values_keep_separators() {
        let params = semi(";reason=\"busy; call later\";x=1").unwrap();
        assert_eq!(params.get("reason"), Some(Some("busy; call later")));
        assert_eq!(params.get("x"), Some(Some("1")));
    }

    #[test]
    fn test_unquoted_whitespace_is_skipped() {
        let params = semi("; branch = z9hG4bK1 ; rport").unwrap();
        assert_eq!(params.get("branch"), Some(Some("z9hG4bK1")));
        assert!(params.has("rport"));
    }

    #[test]
    fn test_stops_at_end_char() {
        let (params, consumed) =
            parse_params(";user=phone?subject=x", Some(';'), ';', Some('?'), true, true).unwrap();
        assert_eq!(params.get("user"), Some(Some("phone")));
        assert_eq!(consumed, 11);

        let (params, consumed) =
            parse_params(";tag=\"a,b\",next", Some(';'), ';', Some(','), true, true).unwrap();
        assert_eq!(params.get("tag"), Some(Some("a,b")));
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_unescapes_keys_and_values() {
        let params = semi(";na%6De=a%20b").unwrap();
        assert_eq!(params.get("name"), Some(Some("a b")));
    }

    #[test]
    fn test_errors() {
        // wrong start character
        assert!(parse_params("x=1", Some(';'), ';', None, true, true).is_err());
        // quote in key
        assert!(semi(";\"x\"=1").is_err());
        // quote in the middle of a value
        assert!(semi(";x=ab\"c\"").is_err());
        // text after closing quote
        assert!(semi(";x=\"ab\"c").is_err());
        // empty key
        assert!(semi(";=1").is_err());
        // second '='
        assert!(semi(";x=1=2").is_err());
        // unclosed quotes
        assert!(semi(";x=\"abc").is_err());
    }

    #[test]
    fn test_singletons_rejected_when_not_permitted() {
        let err = parse_params("?subject&x=1", Some('?'), '&', None, true, false).unwrap_err();
        assert!(err.to_string().contains("singleton param 'subject'"));

        let (params, _) = parse_params("?subject=a&x=1", Some('?'), '&', None, true, false).unwrap();
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_quotes_literal_when_disabled() {
        let (params, _) = parse_params(";x=\"a\"", Some(';'), ';', None, false, true).unwrap();
        assert_eq!(params.get("x"), Some(Some("\"a\"")));
    }
}
