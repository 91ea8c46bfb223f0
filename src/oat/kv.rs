//! Key-value store codec.
//!
//! The store is a flat run of NUL-terminated string pairs directly after the
//! OAT header. Order matters and duplicate keys are legal, so the decoded
//! form is a plain vector of pairs, not a map. A trailing key without a
//! value is dropped silently, matching files produced by existing tools.

use std::io::{Seek, Write};

use crate::error::Result;
use crate::sink::ChecksumSink;

/// An ordered sequence of key-value string pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueStore {
    /// The pairs, in file order.
    pub pairs: Vec<(String, String)>,
}

impl KeyValueStore {
    /// Parses a store from its exact byte range.
    ///
    /// Splits at NUL bytes; an unterminated final string takes the rest of
    /// the buffer. Non-UTF-8 bytes are replaced lossily (the decoded store
    /// is only rendered, never re-encoded).
    pub fn parse(buf: &[u8]) -> Self {
        let mut pairs = Vec::new();
        let mut rest = buf;

        loop {
            let (key, after_key) = match take_str(rest) {
                Some(split) => split,
                None => break,
            };
            rest = after_key;
            let (value, after_value) = match take_str(rest) {
                Some(split) => split,
                // lone trailing key: dropped
                None => break,
            };
            rest = after_value;
            pairs.push((key, value));
        }

        Self { pairs }
    }

    /// Total encoded size of `pairs`, terminators included.
    pub fn compute_size(pairs: &[(String, String)]) -> u32 {
        pairs
            .iter()
            .map(|(k, v)| k.len() as u32 + 1 + v.len() as u32 + 1)
            .sum()
    }

    /// Writes `pairs` through the checksumming sink.
    pub fn write<W: Write + Seek>(
        sink: &mut ChecksumSink<W>,
        pairs: &[(String, String)],
    ) -> Result<()> {
        for (key, value) in pairs {
            sink.write_all(key.as_bytes())?;
            sink.write_all(&[0])?;
            sink.write_all(value.as_bytes())?;
            sink.write_all(&[0])?;
        }
        Ok(())
    }
}

/// The fixed store every built OAT carries. ART only inspects a handful of
/// these; the values mirror what a verify-none dex2oat invocation records.
pub fn build_pairs(image_location: &str) -> Vec<(String, String)> {
    [
        ("classpath", ""),
        ("compiler-filter", "verify-none"),
        ("debuggable", "false"),
        ("dex2oat-cmdline", "--oat-file=/dev/null --dex-file=/dev/null"),
        ("dex2oat-host", "X86"),
        ("has-patch-info", "false"),
        ("native-debuggable", "false"),
        ("image-location", image_location),
        ("pic", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Splits the first NUL-terminated string off `buf`.
fn take_str(buf: &[u8]) -> Option<(String, &[u8])> {
    if buf.is_empty() {
        return None;
    }
    match memchr::memchr(0, buf) {
        Some(pos) => Some((
            String::from_utf8_lossy(&buf[..pos]).into_owned(),
            &buf[pos + 1..],
        )),
        None => Some((String::from_utf8_lossy(buf).into_owned(), &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChecksumSink, Sink};
    use std::io::Cursor;

    fn encode(pairs: &[(String, String)]) -> Vec<u8> {
        let mut sink = ChecksumSink::new(Sink::new(Cursor::new(Vec::new())));
        KeyValueStore::write(&mut sink, pairs).unwrap();
        sink.into_sink()
            .unwrap()
            .into_inner()
            .unwrap()
            .into_inner()
    }

    #[test]
    fn parse_pairs_in_order() {
        let store = KeyValueStore::parse(b"a\0one\0a\0two\0");
        assert_eq!(
            store.pairs,
            vec![
                ("a".to_string(), "one".to_string()),
                ("a".to_string(), "two".to_string())
            ]
        );
    }

    #[test]
    fn trailing_key_without_value_is_dropped() {
        let store = KeyValueStore::parse(b"key\0value\0orphan\0");
        assert_eq!(store.pairs.len(), 1);
        assert_eq!(store.pairs[0].0, "key");

        let store = KeyValueStore::parse(b"key\0value\0orphan");
        assert_eq!(store.pairs.len(), 1);
    }

    #[test]
    fn unterminated_value_still_pairs() {
        let store = KeyValueStore::parse(b"key\0val");
        assert_eq!(
            store.pairs,
            vec![("key".to_string(), "val".to_string())]
        );
    }

    #[test]
    fn empty_store() {
        assert!(KeyValueStore::parse(b"").pairs.is_empty());
    }

    #[test]
    fn size_matches_encoding() {
        let pairs = build_pairs("/data/dalvik-cache/boot.art");
        let encoded = encode(&pairs);
        assert_eq!(KeyValueStore::compute_size(&pairs) as usize, encoded.len());

        let reparsed = KeyValueStore::parse(&encoded);
        assert_eq!(reparsed.pairs, pairs);
    }

    #[test]
    fn build_pairs_fixed_shape() {
        let pairs = build_pairs("img");
        assert_eq!(pairs.len(), 9);
        assert_eq!(pairs[0].0, "classpath");
        assert_eq!(pairs[1], ("compiler-filter".to_string(), "verify-none".to_string()));
        assert_eq!(pairs[7], ("image-location".to_string(), "img".to_string()));
        assert_eq!(pairs[8].0, "pic");
    }
}
