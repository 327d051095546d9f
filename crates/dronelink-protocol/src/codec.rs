//! Codec trait and the checksum framing used on the wire.
//!
//! A codec turns a [`Packet`] into the bytes handed to the link driver and
//! back. The rest of the stack only talks to the [`Codec`] trait, so a link
//! that frames packets differently can bring its own implementation.

use crate::types::checksum;
use crate::{Header, Packet, ProtocolError};

/// Converts packets to and from raw link bytes.
///
/// `Send + Sync + 'static` because the codec is shared between the receive
/// loop and the send path, which run on different Tokio tasks.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a packet into a frame ready for the link.
    fn encode(&self, packet: &Packet) -> Vec<u8>;

    /// Parses a frame received from the link.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Truncated`] or
    /// [`ProtocolError::ChecksumMismatch`] for frames that cannot be a
    /// valid packet.
    fn decode(&self, data: &[u8]) -> Result<Packet, ProtocolError>;
}

/// The vehicle's framing: `header | payload... | checksum`.
///
/// ```rust
/// use dronelink_protocol::{ChecksumCodec, Codec, Header, Packet};
///
/// let codec = ChecksumCodec;
/// let packet = Packet::new(Header::from_byte(0x0C), vec![1, 2, 3]);
///
/// let bytes = codec.encode(&packet);
/// assert_eq!(bytes, vec![0x0C, 1, 2, 3, 0x12]);
///
/// let decoded = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, packet);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumCodec;

impl Codec for ChecksumCodec {
    fn encode(&self, packet: &Packet) -> Vec<u8> {
        let mut frame = Vec::with_capacity(packet.payload().len() + 2);
        frame.push(packet.header().byte());
        frame.extend_from_slice(packet.payload());
        frame.push(packet.checksum());
        frame
    }

    fn decode(&self, data: &[u8]) -> Result<Packet, ProtocolError> {
        // `split_first`/`split_last` hand back borrowed views, so nothing is
        // copied until the payload is stored in the packet.
        let Some((&actual, body)) = data.split_last() else {
            return Err(ProtocolError::Truncated { len: data.len() });
        };
        let Some((&header, payload)) = body.split_first() else {
            return Err(ProtocolError::Truncated { len: data.len() });
        };

        let expected = checksum(header, payload);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(Packet::new(Header::from_byte(header), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encode_recovers_header_and_payload() {
        let codec = ChecksumCodec;
        for header in [0x00, 0x0C, 0x3F, 0xF3, 0xFF] {
            for payload in [vec![], vec![0xAA], (0..=30).collect::<Vec<u8>>()] {
                let packet = Packet::new(Header::from_byte(header), payload.clone());
                let decoded = codec.decode(&codec.encode(&packet)).unwrap();
                assert_eq!(decoded.header().byte(), header);
                assert_eq!(decoded.payload(), payload.as_slice());
            }
        }
    }

    #[test]
    fn test_decode_any_single_payload_bit_flip_fails() {
        let codec = ChecksumCodec;
        let packet = Packet::new(Header::from_byte(0x52), vec![0x01, 0x80, 0xFE, 0x33]);
        let frame = codec.encode(&packet);

        for byte in 1..frame.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        codec.decode(&corrupted),
                        Err(ProtocolError::ChecksumMismatch { .. })
                    ),
                    "flip of byte {byte} bit {bit} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn test_decode_empty_frame_is_truncated() {
        assert_eq!(
            ChecksumCodec.decode(&[]),
            Err(ProtocolError::Truncated { len: 0 })
        );
    }

    #[test]
    fn test_decode_single_byte_is_truncated() {
        assert_eq!(
            ChecksumCodec.decode(&[0x0C]),
            Err(ProtocolError::Truncated { len: 1 })
        );
    }

    #[test]
    fn test_decode_header_only_frame_has_empty_payload() {
        let packet = ChecksumCodec.decode(&[0x20, 0x20]).unwrap();
        assert_eq!(packet.header().byte(), 0x20);
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_decode_reports_expected_and_actual_checksum() {
        let err = ChecksumCodec.decode(&[0x10, 0x01, 0x00]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ChecksumMismatch {
                expected: 0x11,
                actual: 0x00
            }
        );
    }
}
