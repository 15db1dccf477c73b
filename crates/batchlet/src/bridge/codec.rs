//! Length-prefixed JSON framing for the runner's stdio channel.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON message.
//! The codec is generic over the message type, so one implementation covers
//! both directions of the protocol.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

// Batches carrying inlined payloads of this size are worth a log line.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Frames values of `T` as length-prefixed JSON.
///
/// A pipe gives no message boundaries; the length prefix supplies them. A
/// partial frame decodes to `None` until the rest of the bytes arrive.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let item = serde_json::from_slice(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > LARGE_FRAME_BYTES {
            tracing::info!(frame_bytes = json.len(), "Encoding a large frame");
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
