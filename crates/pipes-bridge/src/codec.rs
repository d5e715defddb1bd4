//! Framed codecs for the two protocol directions.
//!
//! Messages are self-framing: the opcode fixes the field layout, so there is
//! no outer length prefix. Each codec decodes one whole message or waits for
//! more bytes, and works over any AsyncRead/AsyncWrite (pipes, sockets,
//! in-memory duplex).

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BridgeError;
use crate::protocol::{DownMessage, UpMessage};
use crate::wire::{WireCursor, WireError, WireResult};

fn decode_frame<T>(
    src: &mut BytesMut,
    decode: impl FnOnce(&mut WireCursor<'_>) -> WireResult<T>,
) -> Result<Option<T>, BridgeError> {
    if src.is_empty() {
        return Ok(None);
    }
    let mut cur = WireCursor::new(&src[..]);
    match decode(&mut cur) {
        Ok(msg) => {
            let consumed = cur.position();
            src.advance(consumed);
            Ok(Some(msg))
        }
        Err(WireError::Incomplete) => Ok(None),
        Err(err @ WireError::Malformed(_)) => Err(err.into()),
    }
}

fn decode_frame_eof<T>(
    src: &mut BytesMut,
    decode: impl FnOnce(&mut WireCursor<'_>) -> WireResult<T>,
) -> Result<Option<T>, BridgeError> {
    match decode_frame(src, decode)? {
        Some(msg) => Ok(Some(msg)),
        None if src.is_empty() => Ok(None),
        None => Err(BridgeError::malformed("truncated frame at end of stream")),
    }
}

/// Codec for driver → worker messages.
#[derive(Debug, Default)]
pub struct DownCodec;

impl Encoder<DownMessage> for DownCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: DownMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for DownCodec {
    type Item = DownMessage;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, DownMessage::decode)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame_eof(src, DownMessage::decode)
    }
}

/// Codec for worker → driver messages.
#[derive(Debug, Default)]
pub struct UpCodec;

impl Encoder<UpMessage> for UpCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: UpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for UpCodec {
    type Item = UpMessage;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, UpMessage::decode)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame_eof(src, UpMessage::decode)
    }
}
