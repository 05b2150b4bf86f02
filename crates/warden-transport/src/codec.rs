use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefix header size: a big-endian u16 byte count.
const HEADER_LEN: usize = 2;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the 16-bit length prefix")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric, bidirectional, length-prefixed framing: each message is a
/// single opaque payload prefixed by a big-endian 16-bit byte count. The
/// codec reassembles frames across arbitrary read boundaries; a length
/// prefix that can't be satisfied by a full payload simply waits for more
/// bytes, the way `tokio_util`'s `LengthDelimitedCodec` does internally.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(item.len()));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u16(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_a_partial_header() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn waits_for_a_partial_body() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(5);
        buf.extend_from_slice(b"he");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decodes_two_frames_delivered_in_one_read() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"a"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"bb"), &mut buf).unwrap();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"a");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"bb");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_a_payload_too_large_for_the_header() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let oversized = Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]);
        assert!(matches!(
            codec.encode(oversized, &mut buf),
            Err(FrameError::TooLarge(_))
        ));
    }
}
