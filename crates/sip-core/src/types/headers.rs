use serde::{Deserialize, Serialize};

use crate::types::address::NameAddr;
use crate::types::header::Header;
use crate::types::method::Method;
use crate::types::via::ViaHop;

/// Compact header forms (RFC 3261 Section 7.3.3) mapped to their long names.
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("t", "to"),
    ("f", "from"),
    ("m", "contact"),
    ("i", "call-id"),
    ("v", "via"),
    ("l", "content-length"),
    ("c", "content-type"),
    ("k", "supported"),
];

/// Lower-cased long form of a header name.
pub fn canonical_key(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| *short == lower)
        .map(|(_, long)| long.to_string())
        .unwrap_or(lower)
}

/// Header collection of a message.
///
/// Lookup is case-insensitive and understands compact names. Serialization
/// order groups headers by name, in order of first appearance, so two `Via`
/// lines separated by another header are written next to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    groups: Vec<(String, Vec<Header>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, header: Header) {
        let key = canonical_key(header.name());
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push(header),
            None => self.groups.push((key, vec![header])),
        }
    }

    /// Prepends a header in front of others of the same name.
    pub fn prepend(&mut self, header: Header) {
        let key = canonical_key(header.name());
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.insert(0, header),
            None => self.groups.insert(0, (key, vec![header])),
        }
    }

    /// Replaces every header with the same name, keeping the group position.
    pub fn replace(&mut self, header: Header) {
        let key = canonical_key(header.name());
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => *list = vec![header],
            None => self.groups.push((key, vec![header])),
        }
    }

    pub fn get(&self, name: &str) -> &[Header] {
        let key = canonical_key(name);
        self.groups
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, list)| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_first(&self, name: &str) -> Option<&Header> {
        self.get(name).first()
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    /// Removes all headers with the given name.
    pub fn remove(&mut self, name: &str) -> Vec<Header> {
        let key = canonical_key(name);
        match self.groups.iter().position(|(k, _)| *k == key) {
            Some(idx) => self.groups.remove(idx).1,
            None => Vec::new(),
        }
    }

    /// All headers in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.groups.iter().flat_map(|(_, list)| list.iter())
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, list)| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Top-most Via hop.
    pub fn via_hop(&self) -> Option<&ViaHop> {
        self.get("via").iter().find_map(|h| match h {
            Header::Via(via) => via.0.first(),
            _ => None,
        })
    }

    pub fn via_hop_mut(&mut self) -> Option<&mut ViaHop> {
        let (_, list) = self.groups.iter_mut().find(|(k, _)| k == "via")?;
        list.iter_mut().find_map(|h| match h {
            Header::Via(via) => via.0.first_mut(),
            _ => None,
        })
    }

    pub fn content_length(&self) -> Option<u32> {
        self.get("content-length").iter().find_map(|h| match h {
            Header::ContentLength(n) => Some(*n),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("call-id").iter().find_map(|h| match h {
            Header::CallId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<(u32, &Method)> {
        self.get("cseq").iter().find_map(|h| match h {
            Header::CSeq { seq, method } => Some((*seq, method)),
            _ => None,
        })
    }

    pub fn to(&self) -> Option<&NameAddr> {
        self.get("to").iter().find_map(|h| match h {
            Header::To(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn from(&self) -> Option<&NameAddr> {
        self.get("from").iter().find_map(|h| match h {
            Header::From(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn contacts(&self) -> impl Iterator<Item = &NameAddr> {
        self.get("contact").iter().filter_map(|h| match h {
            Header::Contact(addr) => Some(addr),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::via::Via;

    fn generic(name: &str, value: &str) -> Header {
        Header::Generic {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive_and_knows_compact_forms() {
        let mut headers = Headers::new();
        headers.append(Header::CallId("abc".to_string()));
        headers.append(Header::Via(Via(vec![ViaHop::new("UDP", "h", None)])));

        assert_eq!(headers.get("CALL-ID").len(), 1);
        assert_eq!(headers.get("i").len(), 1);
        assert_eq!(headers.get("v").len(), 1);
        assert_eq!(headers.call_id(), Some("abc"));
        assert_eq!(headers.via_hop().map(|h| h.host.as_str()), Some("h"));
    }

    #[test]
    fn test_grouped_order() {
        let mut headers = Headers::new();
        headers.append(generic("X-A", "1"));
        headers.append(generic("X-B", "2"));
        headers.append(generic("x-a", "3"));

        let rendered: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        assert_eq!(rendered, vec!["X-A: 1", "x-a: 3", "X-B: 2"]);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut headers = Headers::new();
        headers.append(Header::ContentLength(10));
        headers.append(Header::ContentLength(20));
        headers.replace(Header::ContentLength(5));
        assert_eq!(headers.get("content-length"), &[Header::ContentLength(5)]);

        assert_eq!(headers.remove("l").len(), 1);
        assert!(headers.is_empty());
        assert!(headers.remove("l").is_empty());
    }

    #[test]
    fn test_via_hop_mut_edits_top_hop() {
        let mut headers = Headers::new();
        headers.append(Header::Via(Via(vec![
            ViaHop::new("UDP", "first", None),
            ViaHop::new("UDP", "second", None),
        ])));
        if let Some(hop) = headers.via_hop_mut() {
            hop.params.add("received", Some("10.0.0.1"));
        }
        assert_eq!(
            headers.via_hop().and_then(|h| h.params.get("received")),
            Some(Some("10.0.0.1"))
        );
    }
}
