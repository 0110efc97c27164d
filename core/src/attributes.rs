//! Ordered string attribute bags, propagated through links from upstream
//! `configure`.

use std::collections::BTreeMap;
use std::fmt;

/// Well-known attribute keys the reference nodes read and write.
pub mod keys {
    /// Advertises the datatype name carried on a link.
    pub const DATATYPE: &str = "datatype";
    /// Sampling rate, in Hz, of a sample-stream link.
    pub const SAMPLE_RATE: &str = "sample-rate";
    /// Frame shift, in seconds, of a framed feature stream.
    pub const FRAME_SHIFT: &str = "frame-shift";
    /// Number of parallel channels/tracks carried by a stream.
    pub const TRACK_COUNT: &str = "track-count";
}

/// An ordered (by key) string→string map, attached to a link and merged
/// from upstream `configure` calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    map: BTreeMap<String, String>,
}

impl Attributes {
    /// An empty attribute bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, overwriting any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Reads `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Reads `key`, falling back to `default` and recording nothing (the
    /// caller is expected to log a [`crate::error`]-style soft warning when
    /// that matters).
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.map.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    /// Merges `other` into `self`, with `other`'s values winning on key
    /// collision (matches "merged incrementally" upstream-configure
    /// semantics: the most recently configured producer wins).
    pub fn merge(&mut self, other: &Attributes) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }

    /// Iterates entries in lexical key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Renders the `<flow-attributes>` XML side-car form.
    pub fn to_xml(&self) -> String {
        use fmt::Write as _;
        let mut out = String::from("<flow-attributes>");
        for (k, v) in self.iter() {
            let _ = write!(out, "<flow-attribute name=\"{}\" value=\"{}\"/>", escape(k), escape(v));
        }
        out.push_str("</flow-attributes>");
        out
    }

    /// Parses the `<flow-attributes>` XML side-car form written by
    /// [`Attributes::to_xml`].
    pub fn from_xml(xml: &str) -> Result<Attributes, quick_xml::Error> {
        use quick_xml::events::Event;
        use quick_xml::reader::Reader;

        let mut reader = Reader::from_str(xml);
        let mut attrs = Attributes::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Empty(e) | Event::Start(e) if e.local_name().as_ref() == b"flow-attribute" => {
                    let mut name = None;
                    let mut value = None;
                    for attr in e.attributes().flatten() {
                        let key = attr.key.local_name();
                        let val = attr.unescape_value()?.into_owned();
                        match key.as_ref() {
                            b"name" => name = Some(val),
                            b"value" => value = Some(val),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(value)) = (name, value) {
                        attrs.set(name, value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(attrs)
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_the_incoming_value() {
        let mut a = Attributes::new();
        a.set("sample-rate", "16000");
        let mut b = Attributes::new();
        b.set("sample-rate", "8000");
        b.set("frame-shift", "0.01");
        a.merge(&b);
        assert_eq!(a.get("sample-rate"), Some("8000"));
        assert_eq!(a.get("frame-shift"), Some("0.01"));
    }

    #[test]
    fn xml_round_trip() {
        let mut a = Attributes::new();
        a.set(keys::SAMPLE_RATE, "16000");
        a.set(keys::TRACK_COUNT, "1");
        let xml = a.to_xml();
        let restored = Attributes::from_xml(&xml).unwrap();
        assert_eq!(a, restored);
    }

    #[test]
    fn iteration_is_lexically_ordered() {
        let mut a = Attributes::new();
        a.set("z", "1");
        a.set("a", "2");
        let keys: Vec<&str> = a.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "z"]);
    }
}
