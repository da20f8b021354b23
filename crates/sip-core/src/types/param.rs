//! # SIP Parameters
//!
//! Parameters attach extra information to URIs and header values, e.g.
//! `sip:alice@example.com;transport=tcp` or `Via: SIP/2.0/UDP host;branch=z9hG4bK1`.
//!
//! [`Params`] keeps keys in insertion order, because parameter order is
//! preserved when a message is re-serialized. A key may carry no value at all
//! (a "singleton" such as `lr` or `rport`).
//!
//! ## Examples
//!
//! ```rust
//! use sipflow_sip_core::types::Params;
//!
//! let mut params = Params::new();
//! params.add("branch", Some("z9hG4bK776asdhds"));
//! params.add("rport", None::<String>);
//!
//! assert_eq!(params.get("branch"), Some(Some("z9hG4bK776asdhds")));
//! assert_eq!(params.get("rport"), Some(None));
//! assert_eq!(params.to_string_with(';'), "branch=z9hG4bK776asdhds;rport");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Characters that force a parameter value to be quoted on output.
const SPECIAL_VALUE_CHARS: &[char] = &[';', ',', '?', '&', '=', '"', '<', '>'];

/// Ordered collection of `key[=value]` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    entries: Vec<(String, Option<String>)>,
}

impl Params {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter.
    ///
    /// A key that is already present keeps its position and gets the new value.
    pub fn add<K, V>(&mut self, key: K, value: Option<V>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let value = value.map(Into::into);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Builder-style variant of [`Params::add`].
    pub fn with<K, V>(mut self, key: K, value: Option<V>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.add(key, value);
        self
    }

    /// Returns `Some(value)` when the key exists; the inner option is `None` for singletons.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Removes a parameter, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the parameters joined with `sep`, without a leading separator.
    pub fn to_string_with(&self, sep: char) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                push_value(&mut out, value);
            }
        }
        out
    }
}

fn push_value(out: &mut String, value: &str) {
    let already_quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
    if already_quoted {
        out.push_str(value);
    } else if value
        .chars()
        .any(|c| c.is_whitespace() || SPECIAL_VALUE_CHARS.contains(&c))
    {
        out.push('"');
        out.push_str(value);
        out.push('"');
    } else {
        out.push_str(value);
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with('&'))
    }
}
