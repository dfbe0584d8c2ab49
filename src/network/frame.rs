use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// `request_id (u64 BE) || payload_length (u64 BE)`
pub const HEADER_SIZE: usize = 16;

/// One decoded unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(request_id: u64, payload: impl Into<Bytes>) -> Self {
        Frame {
            request_id,
            payload: payload.into(),
        }
    }
}

/// Stateless encoder/decoder bounded by a maximum payload size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        FrameCodec { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Returns the total length of the frame at the front of `buffer` once it is fully
    /// buffered, `None` while more bytes are needed.
    pub fn check(&self, buffer: &[u8]) -> AppResult<Option<usize>> {
        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &buffer[8..HEADER_SIZE];
        let payload_len = header.get_u64();
        if payload_len > self.max_payload_size as u64 {
            return Err(AppError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }
        let frame_len = usize::try_from(payload_len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_SIZE))
            .ok_or_else(|| {
                AppError::MalformedFrame(format!("payload length {} overflows", payload_len))
            })?;
        if buffer.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(frame_len))
    }

    /// Splits the next complete frame off the front of `buffer`, leaving any partial frame
    /// in place.
    pub fn parse(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        match self.check(&buffer[..])? {
            Some(frame_len) => {
                let mut frame = buffer.split_to(frame_len);
                let request_id = frame.get_u64();
                let _payload_len = frame.get_u64();
                Ok(Some(Frame {
                    request_id,
                    payload: frame.freeze(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Decodes the longest prefix of complete frames in `buffer`.
    ///
    /// Returns the frames and the number of bytes they occupy. An oversized header fails
    /// the call only when no complete frame precedes it, so frames ahead of a violation are
    /// never lost.
    pub fn decode(&self, buffer: &[u8]) -> AppResult<(Vec<Frame>, usize)> {
        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &buffer[consumed..];
            let frame_len = match self.check(rest) {
                Ok(Some(frame_len)) => frame_len,
                Ok(None) => break,
                Err(err) if frames.is_empty() => return Err(err),
                Err(_) => break,
            };
            let mut header = &rest[..HEADER_SIZE];
            let request_id = header.get_u64();
            frames.push(Frame {
                request_id,
                payload: Bytes::copy_from_slice(&rest[HEADER_SIZE..frame_len]),
            });
            consumed += frame_len;
        }
        Ok((frames, consumed))
    }

    pub fn encode(&self, request_id: u64, payload: &[u8]) -> AppResult<Bytes> {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        self.encode_into(request_id, payload, &mut dst)?;
        Ok(dst.freeze())
    }

    pub fn encode_into(&self, request_id: u64, payload: &[u8], dst: &mut BytesMut) -> AppResult<()> {
        if payload.len() > self.max_payload_size {
            return Err(AppError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u64(request_id);
        dst.put_u64(payload.len() as u64);
        dst.put_slice(payload);
        Ok(())
    }
}
