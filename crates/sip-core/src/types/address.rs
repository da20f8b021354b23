use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::param::Params;
use crate::types::uri::Uri;

/// `[display-name] <uri>;params` value shared by `To`, `From` and `Contact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: impl Into<Uri>) -> Self {
        NameAddr {
            display_name: None,
            uri: uri.into(),
            params: Params::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.params.add(key, value);
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").flatten()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.is_empty()) {
            write!(f, "\"{}\" ", name)?;
        }
        match &self.uri {
            Uri::Wildcard => f.write_str("*")?,
            uri => write!(f, "<{}>", uri)?,
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params.to_string_with(';'))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uri::SipUri;

    #[test]
    fn test_name_addr_display() {
        let addr = NameAddr::new(SipUri::new("example.com").with_user("alice"))
            .with_display_name("Alice")
            .with_param("tag", Some("1928301774"));
        assert_eq!(addr.to_string(), "\"Alice\" <sip:alice@example.com>;tag=1928301774");
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn test_wildcard_has_no_brackets() {
        assert_eq!(NameAddr::new(Uri::Wildcard).to_string(), "*");
    }
}
