use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SIP request method.
///
/// Method names are case-sensitive on the wire, but the parser normalises
/// them to upper case, so `invite` and `INVITE` both map to [`Method::Invite`].
/// Anything outside the well-known set is kept as [`Method::Extension`].
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use sipflow_sip_core::types::Method;
///
/// assert_eq!(Method::from_str("invite").unwrap(), Method::Invite);
/// assert_eq!(Method::from_str("FOO").unwrap(), Method::Extension("FOO".to_string()));
/// assert_eq!(Method::Register.to_string(), "REGISTER");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Register,
    Options,
    Subscribe,
    Notify,
    Refer,
    Info,
    Update,
    Prack,
    Message,
    Publish,
    /// Any other token
    Extension(String),
}

impl Method {
    /// Returns the wire representation of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Message => "MESSAGE",
            Method::Publish => "PUBLISH",
            Method::Extension(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        if upper.is_empty() || upper.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidMethod(s.to_string()));
        }

        Ok(match upper.as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            "MESSAGE" => Method::Message,
            "PUBLISH" => Method::Publish,
            _ => Method::Extension(upper),
        })
    }
}
