//! Wisp wire protocol.
//!
//! Every channel carries a sequence of length-prefixed frames.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      Wisp Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x57 0x49 0x53 0x50` ("WISP")
//! - Version: `0x01 0x00` (1.0)
//! - Type: [`FrameType`] byte
//! - Length: Payload length in bytes (big-endian)
//!
//! Control frames carry a JSON [`Message`]. Chunk frames carry an 8-byte
//! big-endian chunk index followed by the raw chunk bytes. Open frames are
//! written once by the dialing side of a raw stream and carry its endpoint id.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Protocol magic bytes: "WISP"
pub const MAGIC: [u8; 4] = [0x57, 0x49, 0x53, 0x50];

/// Wire format version (major, minor)
pub const WIRE_VERSION: (u8, u8) = (1, 0);

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of the chunk index prefix in chunk frames
const CHUNK_INDEX_SIZE: usize = 8;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// JSON session message
    Control = 0x01,
    /// Binary chunk
    Chunk = 0x02,
    /// Stream preamble naming the dialer
    Open = 0x03,
}

impl FrameType {
    /// Parse a frame type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Control),
            0x02 => Some(Self::Chunk),
            0x03 => Some(Self::Open),
            _ => None,
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Frame type
    pub frame_type: FrameType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.frame_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != WIRE_VERSION.0 {
            return Err(Error::ProtocolError(format!(
                "unsupported wire version {}.{}",
                version.0, version.1
            )));
        }

        let frame_type = FrameType::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown frame type: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            frame_type,
            payload_length,
        })
    }
}

/// One entry of a sender's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Sender-assigned file id
    pub id: String,
    /// File name as offered by the sender
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// Begin-of-stream marker payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStart {
    /// Sender-assigned file id
    pub file_id: String,
    /// File name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// MIME type
    pub file_type: String,
    /// Total chunk count for the whole file
    pub total_chunks: u64,
    /// Byte offset the stream starts at
    pub start_offset: u64,
}

/// Session messages exchanged in control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Receiver announces the protocol version
    Handshake {
        /// Version token
        version: String,
    },
    /// Verification passed
    HandshakeOk,
    /// A password must be supplied before anything else
    AuthRequired,
    /// Password attempt
    Auth {
        /// Candidate password
        password: String,
    },
    /// Password rejected, the channel stays open
    AuthError,
    /// Request the catalog
    GetMetadata,
    /// Full catalog, replaces whatever the receiver had
    MetadataList {
        /// Offered files
        files: Vec<FileDescriptor>,
    },
    /// Ask the sender to start streaming a file
    RequestFile {
        /// File id; the first hosted file when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// Resume offset in bytes
        #[serde(default)]
        offset_bytes: u64,
    },
    /// File not yet available, retry after the countdown
    ScheduleWait {
        /// Seconds until availability
        seconds: u64,
    },
    /// Begin-of-stream marker
    FileStart(FileStart),
    /// End-of-stream marker
    FileEnd,
    /// Courtesy notice sent before an inbound stream is closed
    Rejected {
        /// Reason for the rejection
        reason: String,
    },
}

impl Message {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeOk => "handshake_ok",
            Self::AuthRequired => "auth_required",
            Self::Auth { .. } => "auth",
            Self::AuthError => "auth_error",
            Self::GetMetadata => "get_metadata",
            Self::MetadataList { .. } => "metadata_list",
            Self::RequestFile { .. } => "request_file",
            Self::ScheduleWait { .. } => "schedule_wait",
            Self::FileStart(_) => "file_start",
            Self::FileEnd => "file_end",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Whether this message may arrive on a channel that is not yet verified.
    #[must_use]
    pub const fn allowed_unverified(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::Auth { .. })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session message
    Control(Message),
    /// Chunk payload
    Chunk {
        /// Chunk index within the file
        index: u64,
        /// Raw bytes
        data: Vec<u8>,
    },
    /// Stream preamble carrying the dialer's endpoint id
    Open(String),
}

impl Frame {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Control(message) => message.kind(),
            Self::Chunk { .. } => "chunk",
            Self::Open(_) => "open",
        }
    }

    /// Encode the frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the control message cannot be serialized.
    pub fn encode(&self) -> Result<(FrameType, Vec<u8>)> {
        match self {
            Self::Control(message) => Ok((FrameType::Control, encode_payload(message)?)),
            Self::Chunk { index, data } => Ok((FrameType::Chunk, encode_chunk(*index, data))),
            Self::Open(id) => Ok((FrameType::Open, id.as_bytes().to_vec())),
        }
    }

    /// Decode a frame body according to its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the frame type.
    pub fn decode(frame_type: FrameType, payload: Vec<u8>) -> Result<Self> {
        match frame_type {
            FrameType::Control => decode_payload(&payload).map(Self::Control),
            FrameType::Chunk => {
                let (index, data) = decode_chunk(payload)?;
                Ok(Self::Chunk { index, data })
            }
            FrameType::Open => String::from_utf8(payload)
                .map(Self::Open)
                .map_err(|_| Error::ProtocolError("open frame is not UTF-8".to_string())),
        }
    }
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a chunk payload (binary format).
///
/// Format: chunk_index (8 bytes) | data
#[must_use]
pub fn encode_chunk(index: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_INDEX_SIZE + data.len());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decode a chunk payload (binary format).
///
/// # Errors
///
/// Returns an error if the payload is too short.
pub fn decode_chunk(mut payload: Vec<u8>) -> Result<(u64, Vec<u8>)> {
    if payload.len() < CHUNK_INDEX_SIZE {
        return Err(Error::ProtocolError(
            "chunk payload too short".to_string(),
        ));
    }

    let mut index_bytes = [0u8; CHUNK_INDEX_SIZE];
    index_bytes.copy_from_slice(&payload[..CHUNK_INDEX_SIZE]);
    let data = payload.split_off(CHUNK_INDEX_SIZE);

    Ok((u64::from_be_bytes(index_bytes), data))
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Frame::decode(header.frame_type, payload)
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let (frame_type, payload) = frame.encode()?;
    write_encoded(writer, frame_type, &payload).await
}

/// Write an already encoded frame body to a stream.
///
/// # Errors
///
/// Returns an error if the payload is too large or writing fails.
pub async fn write_encoded<W>(writer: &mut W, frame_type: FrameType, payload: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: WIRE_VERSION,
        frame_type,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a complete frame from a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
pub async fn read_frame_with_timeout<R>(reader: &mut R, duration: Duration) -> Result<Frame>
where
    R: AsyncReadExt + Unpin,
{
    timeout(duration, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_encode_decode() {
        let header = FrameHeader {
            version: WIRE_VERSION,
            frame_type: FrameType::Chunk,
            payload_length: 65_544,
        };

        let encoded = header.encode();
        assert_eq!(&encoded[0..4], b"WISP");
        let decoded = FrameHeader::decode(&encoded).expect("decode");

        assert_eq!(decoded.version, (1, 0));
        assert_eq!(decoded.frame_type, FrameType::Chunk);
        assert_eq!(decoded.payload_length, 65_544);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_size() {
        let mut encoded = FrameHeader {
            version: WIRE_VERSION,
            frame_type: FrameType::Control,
            payload_length: 4,
        }
        .encode();
        encoded[0] = b'X';
        assert!(FrameHeader::decode(&encoded).is_err());

        let mut oversized = FrameHeader {
            version: WIRE_VERSION,
            frame_type: FrameType::Control,
            payload_length: 0,
        }
        .encode();
        #[allow(clippy::cast_possible_truncation)]
        oversized[7..11].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        assert!(FrameHeader::decode(&oversized).is_err());
    }

    #[test]
    fn test_message_wire_names() {
        let json = String::from_utf8(
            encode_payload(&Message::RequestFile {
                file_id: Some("f1".into()),
                offset_bytes: 3_276_800,
            })
            .expect("encode"),
        )
        .expect("utf8");
        assert!(json.contains(r#""type":"request_file""#));
        assert!(json.contains(r#""offset_bytes":3276800"#));

        let msg: Message = decode_payload(br#"{"type":"handshake_ok"}"#).expect("decode");
        assert_eq!(msg, Message::HandshakeOk);

        let msg: Message = decode_payload(br#"{"type":"request_file"}"#).expect("decode");
        assert_eq!(
            msg,
            Message::RequestFile {
                file_id: None,
                offset_bytes: 0
            }
        );
    }

    #[test]
    fn test_unknown_message_type_is_error() {
        let result: Result<Message> = decode_payload(br#"{"type":"format_disk"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_allowed_unverified() {
        assert!(Message::Handshake {
            version: "x".into()
        }
        .allowed_unverified());
        assert!(Message::Auth {
            password: "x".into()
        }
        .allowed_unverified());
        assert!(!Message::GetMetadata.allowed_unverified());
        assert!(!Message::FileEnd.allowed_unverified());
    }

    #[test]
    fn test_chunk_payload_layout() {
        let encoded = encode_chunk(42, &[1, 2, 3]);
        assert_eq!(&encoded[..8], &42u64.to_be_bytes());
        let (index, data) = decode_chunk(encoded).expect("decode");
        assert_eq!(index, 42);
        assert_eq!(data, vec![1, 2, 3]);

        assert!(decode_chunk(vec![0; 4]).is_err());
    }

    #[tokio::test]
    async fn test_read_write_frames_in_sequence() {
        let mut buffer = Vec::new();
        let frames = vec![
            Frame::Open("wisp-transfer-v2-rx-abc".into()),
            Frame::Control(Message::Handshake {
                version: crate::PROTOCOL_VERSION.into(),
            }),
            Frame::Chunk {
                index: 7,
                data: vec![9; 100],
            },
            Frame::Control(Message::FileEnd),
        ];
        for frame in &frames {
            write_frame(&mut buffer, frame).await.expect("write frame");
        }

        let mut cursor = std::io::Cursor::new(buffer);
        for expected in &frames {
            let frame = read_frame(&mut cursor).await.expect("read frame");
            assert_eq!(&frame, expected);
        }
    }
}
