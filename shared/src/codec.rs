//! Length-prefixed framing for device envelopes on stream transports
//!
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf DeviceEnvelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::DeviceEnvelope;

/// Largest envelope accepted in either direction (10 MiB)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Envelope too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    EnvelopeTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Encode one envelope as a complete frame
pub fn encode_frame(envelope: &DeviceEnvelope) -> Result<Bytes, CodecError> {
    let len = envelope.encoded_len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::EnvelopeTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + len);
    buf.put_u32(len as u32);
    envelope.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Take one complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; the buffer is left untouched.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<DeviceEnvelope>, CodecError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(len));
    }
    if buf.len() < LENGTH_PREFIX + len as usize {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    let body = buf.split_to(len as usize);
    Ok(Some(DeviceEnvelope::decode(body)?))
}

/// Accumulates stream reads and yields whole envelopes
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Call until it returns `Ok(None)` to drain every buffered frame
    pub fn next_envelope(&mut self) -> Result<Option<DeviceEnvelope>, CodecError> {
        decode_frame(&mut self.buffer)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceChannel, DevicePayload, MessageClass};

    fn request_envelope() -> DeviceEnvelope {
        DeviceEnvelope {
            channel: Some(DeviceChannel {
                message_class: MessageClass::Request.into(),
                tenant_id: "1".into(),
                client_id: "gw-01".into(),
                app_name: "DEPLOY-V2".into(),
                method: "GET".into(),
                resource: vec!["bundles".into()],
                request_id: "abc".into(),
                ..Default::default()
            }),
            payload: Some(DevicePayload {
                timestamp_ms: 1_483_228_800_000,
                metrics: Vec::new(),
                body: Vec::new(),
            }),
        }
    }

    #[test]
    fn test_frame_prefix_matches_body() {
        let frame = encode_frame(&request_envelope()).expect("encode failed");
        let prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(prefix as usize, frame.len() - 4);

        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decode_frame(&mut buf).expect("decode failed").expect("no envelope");
        assert_eq!(decoded.channel.unwrap().client_id, "gw-01");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_leaves_buffer_untouched() {
        let frame = encode_frame(&request_envelope()).expect("encode failed");
        let mut buf = BytesMut::from(&frame[..6]);
        assert!(decode_frame(&mut buf).expect("partial must not fail").is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_reader_handles_split_and_batched_frames() {
        let frame = encode_frame(&request_envelope()).expect("encode failed");
        let mut reader = FrameReader::new();

        reader.extend(&frame[..3]);
        assert!(reader.next_envelope().unwrap().is_none());
        reader.extend(&frame[3..]);
        reader.extend(&frame);

        assert!(reader.next_envelope().unwrap().is_some());
        assert!(reader.next_envelope().unwrap().is_some());
        assert!(reader.next_envelope().unwrap().is_none());
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE + 1);
        buf.put_bytes(0, 16);
        assert!(matches!(decode_frame(&mut buf), Err(CodecError::InvalidLength(_))));
    }
}
