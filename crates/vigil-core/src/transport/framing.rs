//! Length-prefixed frame codec.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The length is validated against the frame size cap before any payload
//! allocation happens, so an oversized prefix cannot force a large buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::TransportError;

/// Maximum payload size carried by one frame (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec for length-prefixed binary frames, used with
/// [`tokio_util::codec::FramedRead`] and [`FramedWrite`](tokio_util::codec::FramedWrite).
#[derive(Debug, Clone, Default)]
pub struct WireCodec;

impl WireCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for WireCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for WireCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: item.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_MESSAGE_SIZE
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = WireCodec::new();
        let payload = Bytes::from_static(b"hello vault");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + payload.len());
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_yields_nothing() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&[0_u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn partial_payload_yields_nothing() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&[0_u8, 0, 0, 10, 1, 2, 3, 4, 5][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocation() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(20 * 1024 * 1024);
        buf.extend_from_slice(&[0_u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::MessageTooLarge { size, max })
                if size == 20 * 1024 * 1024 && max == MAX_MESSAGE_SIZE
        ));
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        let payload = Bytes::from(vec![0_u8; MAX_MESSAGE_SIZE + 1]);
        assert!(matches!(
            codec.encode(payload, &mut buf),
            Err(TransportError::MessageTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frames_are_valid() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "second");
        assert!(buf.is_empty());
    }
}
