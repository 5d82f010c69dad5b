//! Framed codec for the mission socket.
//!
//! Every Malmo message is a 4-byte big-endian length followed by an opaque
//! payload. Wraps LengthDelimitedCodec and hands payloads up as `Bytes`.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted from the client. Raw video frames dominate; 64 MiB
/// covers any resolution the mod can be configured for.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Codec that frames opaque messages with a 4-byte length prefix.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                tracing::trace!(frame_size_bytes = frame.len(), "Decoded frame");
                Ok(Some(frame.freeze()))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(item, dst)
    }
}
