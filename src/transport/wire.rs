//! Length-prefixed frame codec for control sockets.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON-encoded
//! [`Frame`]. The length covers only the payload. Maximum frame size is 1 MB;
//! experiment payload never travels on a control socket.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::Error;
use crate::proto::Frame;

/// Maximum frame payload size: 1 MB.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Codec turning a byte stream into [`Frame`]s and back.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "frame ({} bytes) exceeds max frame size ({} bytes)",
                json.len(),
                MAX_FRAME_SIZE
            )));
        }
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| Error::protocol(format!("failed to frame message: {e}")))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self
            .inner
            .decode(src)
            .map_err(|e| Error::protocol(format!("bad frame: {e}")))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FrameBody, Message, PeerAddress};

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame {
            id: 42,
            body: FrameBody::Call {
                message: Message::PmJoin {
                    group: "bw".into(),
                    rank: Some(3),
                },
            },
        };

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode failed");

        // 4-byte big-endian prefix covers the payload only.
        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(payload_len, buf.len() - 4);

        let decoded = codec.decode(&mut buf).expect("decode failed").expect("should have frame");
        assert_eq!(decoded.id, 42);
        match decoded.body {
            FrameBody::Call {
                message: Message::PmJoin { group, rank },
            } => {
                assert_eq!(group, "bw");
                assert_eq!(rank, Some(3));
            }
            other => panic!("expected pm_join call, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = Frame {
            id: 0,
            body: FrameBody::Hello {
                address: PeerAddress::new("127.0.0.1", 4000),
            },
        };
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_garbage_payload_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"nope!");
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }
}
