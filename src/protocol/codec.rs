use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::protocol::frame::Frame;

/// Datagram codec for protocol frames.
///
/// Each datagram carries exactly one frame; the variable-length data field
/// extends to the end of the datagram, so no extra length delimiting is
/// needed.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let frame = Frame::decode(src)?;
        if !src.is_empty() {
            src.clear();
            return Err(Error::ProtocolViolation("trailing bytes after frame".into()));
        }
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::frame::State;

    #[test]
    fn one_frame_per_datagram() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data_request("req0000001", 1, Bytes::from_static(b"payload")), &mut buf)
            .unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.state, State::DataRequest);
        assert_eq!(frame.data.as_ref(), b"payload");
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::data_wait("req0000001", 1), &mut buf).unwrap();
        buf.extend_from_slice(b"junk");
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_is_an_error_not_a_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xffnot a frame"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
