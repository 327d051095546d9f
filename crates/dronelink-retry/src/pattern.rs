//! Reply patterns: the bytes an expected reply starts with.

use std::fmt;

use dronelink_protocol::{Header, Packet};

/// Header byte followed by zero or more expected leading payload bytes.
///
/// A pattern is never transmitted; it only decides whether an inbound
/// packet answers an outstanding request. A header-only pattern accepts
/// any reply on that port/channel, a longer one narrows it down to a
/// specific opcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyPattern(Vec<u8>);

impl ReplyPattern {
    pub fn new(header: Header, prefix: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(prefix.len() + 1);
        bytes.push(header.byte());
        bytes.extend_from_slice(prefix);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes, header included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`: a pattern holds at least the header byte.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` if the pattern is a byte-for-byte prefix of
    /// `header | payload`.
    pub fn matches(&self, packet: &Packet) -> bool {
        let Some((&header, prefix)) = self.0.split_first() else {
            return false;
        };
        header == packet.header().byte() && packet.payload().starts_with(prefix)
    }
}

impl fmt::Display for ReplyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(header: u8, payload: &[u8]) -> Packet {
        Packet::new(Header::from_byte(header), payload)
    }

    #[test]
    fn test_header_only_pattern_matches_any_payload() {
        let pattern = ReplyPattern::new(Header::from_byte(0x0C), &[]);
        assert!(pattern.matches(&packet(0x0C, &[])));
        assert!(pattern.matches(&packet(0x0C, &[1, 2, 3])));
        assert!(!pattern.matches(&packet(0x0D, &[1, 2, 3])));
    }

    #[test]
    fn test_prefix_pattern_requires_leading_bytes() {
        let pattern = ReplyPattern::new(Header::from_byte(0x50), &[0x03, 0x01]);
        assert!(pattern.matches(&packet(0x50, &[0x03, 0x01])));
        assert!(pattern.matches(&packet(0x50, &[0x03, 0x01, 0xFF])));
        assert!(!pattern.matches(&packet(0x50, &[0x03, 0x02])));
        // Reply shorter than the pattern cannot match.
        assert!(!pattern.matches(&packet(0x50, &[0x03])));
    }

    #[test]
    fn test_len_counts_header() {
        let pattern = ReplyPattern::new(Header::from_byte(0x20), &[1, 2]);
        assert_eq!(pattern.len(), 3);
        assert!(!pattern.is_empty());
        assert_eq!(pattern.as_bytes(), &[0x20, 1, 2]);
    }

    #[test]
    fn test_display_is_hex() {
        let pattern = ReplyPattern::new(Header::from_byte(0x0C), &[0xAB, 1]);
        assert_eq!(pattern.to_string(), "[0c ab 01]");
    }
}
