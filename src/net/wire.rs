//! Transfer protocol wire format
//!
//! Every message travels as one binary frame:
//!
//! ```text
//! [u32 body_len][u8 kind][16 bytes transfer_id][body...]
//! ```
//!
//! `body_len` counts every byte after itself. Kind-specific bodies:
//!
//! | kind     | body                                         |
//! |----------|----------------------------------------------|
//! | Request  | u32 total_chunks, u32 meta_len, JSON metadata |
//! | Accept   | -                                            |
//! | Reject   | -                                            |
//! | Chunk    | u32 index, raw payload (<= 64 KiB)           |
//! | Complete | u32 total_chunks                             |
//! | Cancel   | -                                            |
//! | Error    | UTF-8 reason                                 |
//!
//! Integers are big-endian. Chunk payloads are sliced out of the frame
//! without copying.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Fixed chunk size (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum encoded size of request metadata.
pub const MAX_METADATA_LEN: usize = 16 * 1024;

/// Maximum length of an error reason carried on the wire.
pub const MAX_REASON_LEN: usize = 1024;

const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = 1 + 16;

const KIND_REQUEST: u8 = 0x01;
const KIND_ACCEPT: u8 = 0x02;
const KIND_REJECT: u8 = 0x03;
const KIND_CHUNK: u8 = 0x04;
const KIND_COMPLETE: u8 = 0x05;
const KIND_CANCEL: u8 = 0x06;
const KIND_ERROR: u8 = 0x07;

/// Errors produced while decoding or encoding frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("length prefix says {declared} bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("chunk payload of {0} bytes exceeds the chunk size")]
    OversizedChunk(usize),

    #[error("metadata of {0} bytes exceeds the limit")]
    OversizedMetadata(usize),

    #[error("invalid metadata: {0}")]
    Metadata(Arc<str>),

    #[error("error reason is not valid UTF-8")]
    InvalidReason,
}

/// Identifier of one transfer attempt. Random per attempt, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the raw 16 bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0.simple())
    }
}

/// Description of the file being offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified_ms: u64,
}

impl FileMetadata {
    /// Number of 64 KiB chunks needed for this file.
    pub fn total_chunks(&self) -> u32 {
        total_chunks_for(self.size)
    }
}

/// `ceil(size / CHUNK_SIZE)`, saturating at `u32::MAX`.
#[inline]
pub fn total_chunks_for(size: u64) -> u32 {
    checked_total_chunks(size).unwrap_or(u32::MAX)
}

/// `ceil(size / CHUNK_SIZE)`, or `None` when the count does not fit a
/// chunk index.
#[inline]
pub fn checked_total_chunks(size: u64) -> Option<u32> {
    u32::try_from(size.div_ceil(CHUNK_SIZE as u64)).ok()
}

/// Discriminant of a [`Message`], useful for logging and test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Accept,
    Reject,
    Chunk,
    Complete,
    Cancel,
    Error,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            MessageKind::Request => KIND_REQUEST,
            MessageKind::Accept => KIND_ACCEPT,
            MessageKind::Reject => KIND_REJECT,
            MessageKind::Chunk => KIND_CHUNK,
            MessageKind::Complete => KIND_COMPLETE,
            MessageKind::Cancel => KIND_CANCEL,
            MessageKind::Error => KIND_ERROR,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        Ok(match byte {
            KIND_REQUEST => MessageKind::Request,
            KIND_ACCEPT => MessageKind::Accept,
            KIND_REJECT => MessageKind::Reject,
            KIND_CHUNK => MessageKind::Chunk,
            KIND_COMPLETE => MessageKind::Complete,
            KIND_CANCEL => MessageKind::Cancel,
            KIND_ERROR => MessageKind::Error,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request {
        transfer_id: TransferId,
        metadata: FileMetadata,
        total_chunks: u32,
    },
    Accept {
        transfer_id: TransferId,
    },
    Reject {
        transfer_id: TransferId,
    },
    Chunk {
        transfer_id: TransferId,
        index: u32,
        payload: Bytes,
    },
    Complete {
        transfer_id: TransferId,
        total_chunks: u32,
    },
    Cancel {
        transfer_id: TransferId,
    },
    Error {
        transfer_id: TransferId,
        reason: Arc<str>,
    },
}

impl Message {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Message::Request { transfer_id, .. }
            | Message::Accept { transfer_id }
            | Message::Reject { transfer_id }
            | Message::Chunk { transfer_id, .. }
            | Message::Complete { transfer_id, .. }
            | Message::Cancel { transfer_id }
            | Message::Error { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Accept { .. } => MessageKind::Accept,
            Message::Reject { .. } => MessageKind::Reject,
            Message::Chunk { .. } => MessageKind::Chunk,
            Message::Complete { .. } => MessageKind::Complete,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    /// Encodes the message into a single length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::with_capacity(HEADER_LEN + self.body_size_hint());
        body.put_u8(self.kind().to_byte());
        body.put_slice(self.transfer_id().as_bytes());

        match self {
            Message::Request {
                metadata,
                total_chunks,
                ..
            } => {
                let meta = serde_json::to_vec(metadata)
                    .map_err(|e| WireError::Metadata(Arc::from(e.to_string())))?;
                if meta.len() > MAX_METADATA_LEN {
                    return Err(WireError::OversizedMetadata(meta.len()));
                }
                body.put_u32(*total_chunks);
                body.put_u32(meta.len() as u32);
                body.put_slice(&meta);
            }
            Message::Chunk { index, payload, .. } => {
                if payload.len() > CHUNK_SIZE {
                    return Err(WireError::OversizedChunk(payload.len()));
                }
                body.put_u32(*index);
                body.put_slice(payload);
            }
            Message::Complete { total_chunks, .. } => body.put_u32(*total_chunks),
            Message::Error { reason, .. } => {
                body.put_slice(truncate_reason(reason).as_bytes());
            }
            Message::Accept { .. } | Message::Reject { .. } | Message::Cancel { .. } => {}
        }

        let mut frame = BytesMut::with_capacity(LEN_PREFIX + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Decodes one frame produced by [`Message::encode`].
    pub fn decode(frame: Bytes) -> Result<Self, WireError> {
        let mut buf = frame;
        let declared = take_u32(&mut buf, "length prefix")? as usize;
        if declared != buf.remaining() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: buf.remaining(),
            });
        }

        let kind = MessageKind::from_byte(take_u8(&mut buf, "kind")?)?;
        let transfer_id = take_transfer_id(&mut buf)?;

        let message = match kind {
            MessageKind::Request => {
                let total_chunks = take_u32(&mut buf, "total chunks")?;
                let meta_len = take_u32(&mut buf, "metadata length")? as usize;
                if meta_len > MAX_METADATA_LEN {
                    return Err(WireError::OversizedMetadata(meta_len));
                }
                if buf.remaining() < meta_len {
                    return Err(WireError::Truncated("metadata"));
                }
                let meta = buf.split_to(meta_len);
                let metadata: FileMetadata = serde_json::from_slice(&meta)
                    .map_err(|e| WireError::Metadata(Arc::from(e.to_string())))?;
                Message::Request {
                    transfer_id,
                    metadata,
                    total_chunks,
                }
            }
            MessageKind::Accept => Message::Accept { transfer_id },
            MessageKind::Reject => Message::Reject { transfer_id },
            MessageKind::Chunk => {
                let index = take_u32(&mut buf, "chunk index")?;
                if buf.remaining() > CHUNK_SIZE {
                    return Err(WireError::OversizedChunk(buf.remaining()));
                }
                Message::Chunk {
                    transfer_id,
                    index,
                    payload: buf,
                }
            }
            MessageKind::Complete => Message::Complete {
                transfer_id,
                total_chunks: take_u32(&mut buf, "total chunks")?,
            },
            MessageKind::Cancel => Message::Cancel { transfer_id },
            MessageKind::Error => {
                let reason = std::str::from_utf8(&buf).map_err(|_| WireError::InvalidReason)?;
                Message::Error {
                    transfer_id,
                    reason: Arc::from(reason),
                }
            }
        };

        Ok(message)
    }

    fn body_size_hint(&self) -> usize {
        match self {
            Message::Chunk { payload, .. } => 4 + payload.len(),
            Message::Request { .. } => 8 + 256,
            Message::Error { reason, .. } => reason.len().min(MAX_REASON_LEN),
            _ => 4,
        }
    }
}

/// Reads the kind byte of an encoded frame without decoding the rest.
pub fn peek_kind(frame: &[u8]) -> Option<MessageKind> {
    frame
        .get(LEN_PREFIX)
        .and_then(|byte| MessageKind::from_byte(*byte).ok())
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn take_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u32())
}

fn take_transfer_id(buf: &mut Bytes) -> Result<TransferId, WireError> {
    if buf.remaining() < 16 {
        return Err(WireError::Truncated("transfer id"));
    }
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    Ok(TransferId::from_bytes(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(size: u64) -> FileMetadata {
        FileMetadata {
            name: "holiday.jpg".to_string(),
            size,
            mime_type: "image/jpeg".to_string(),
            last_modified_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks_for(0), 0);
        assert_eq!(total_chunks_for(1), 1);
        assert_eq!(total_chunks_for(CHUNK_SIZE as u64), 1);
        assert_eq!(total_chunks_for(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(total_chunks_for(200 * 1024), 4);
        assert_eq!(checked_total_chunks(1 << 46), Some(1 << 30));
        assert_eq!(checked_total_chunks(1 << 48), None);
        assert_eq!(total_chunks_for(1 << 48), u32::MAX);
    }

    #[test]
    fn test_request_decodes_to_same_message() {
        let message = Message::Request {
            transfer_id: TransferId::new(),
            metadata: metadata(200 * 1024),
            total_chunks: 4,
        };
        let decoded = Message::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_chunk_payload_survives_encoding() {
        let payload = Bytes::from((0..CHUNK_SIZE).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let message = Message::Chunk {
            transfer_id: TransferId::new(),
            index: 3,
            payload: payload.clone(),
        };
        match Message::decode(message.encode().unwrap()).unwrap() {
            Message::Chunk { index, payload: p, .. } => {
                assert_eq!(index, 3);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let message = Message::Chunk {
            transfer_id: TransferId::new(),
            index: 0,
            payload: Bytes::from(vec![0u8; CHUNK_SIZE + 1]),
        };
        assert_eq!(
            message.encode().unwrap_err(),
            WireError::OversizedChunk(CHUNK_SIZE + 1)
        );
    }

    #[test]
    fn test_length_mismatch_detected() {
        let frame = Message::Cancel {
            transfer_id: TransferId::new(),
        }
        .encode()
        .unwrap();

        let mut longer = BytesMut::from(&frame[..]);
        longer.put_u8(0);
        assert!(matches!(
            Message::decode(longer.freeze()),
            Err(WireError::LengthMismatch { .. })
        ));

        let shorter = frame.slice(..frame.len() - 1);
        assert!(matches!(
            Message::decode(shorter),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[0, 0])).unwrap_err(),
            WireError::Truncated("length prefix")
        );

        let mut frame = BytesMut::new();
        frame.put_u32(5);
        frame.put_u8(KIND_CANCEL);
        frame.put_slice(&[0u8; 4]);
        assert_eq!(
            Message::decode(frame.freeze()).unwrap_err(),
            WireError::Truncated("transfer id")
        );
    }

    #[test]
    fn test_unknown_kind() {
        let mut frame = BytesMut::new();
        frame.put_u32(17);
        frame.put_u8(0x7f);
        frame.put_slice(&[0u8; 16]);
        assert_eq!(
            Message::decode(frame.freeze()).unwrap_err(),
            WireError::UnknownKind(0x7f)
        );
    }

    #[test]
    fn test_error_reason_is_truncated() {
        let id = TransferId::new();
        let message = Message::Error {
            transfer_id: id,
            reason: Arc::from("é".repeat(MAX_REASON_LEN)),
        };
        match Message::decode(message.encode().unwrap()).unwrap() {
            Message::Error { reason, transfer_id } => {
                assert_eq!(transfer_id, id);
                assert!(reason.len() <= MAX_REASON_LEN);
                assert!(reason.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_peek_kind() {
        let frame = Message::Accept {
            transfer_id: TransferId::new(),
        }
        .encode()
        .unwrap();
        assert_eq!(peek_kind(&frame), Some(MessageKind::Accept));
        assert_eq!(peek_kind(&[0, 0]), None);
    }

    #[test]
    fn test_transfer_id_display() {
        let id = TransferId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), format!("transfer-{}", "ab".repeat(16)));
        assert_ne!(TransferId::new(), TransferId::new());
    }
}
