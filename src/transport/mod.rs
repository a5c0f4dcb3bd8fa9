//! Transport layer for agent ↔ commander communication.
//!
//! Provides the frame codec and the TCP [`Channel`] built on it.
//! Every frame is a fixed-size header followed by `body_len` body bytes:
//!
//! ```text
//! +-------------+---------------+---------------+----------------+---------+
//! | magic (u16) | version (u16) | command (u16) | body_len (u32) | body    |
//! +-------------+---------------+---------------+----------------+---------+
//! ```
//!
//! All integers are big-endian. The header carries the protocol version so a
//! peer speaking another revision is rejected on its first frame instead of
//! being misparsed.

pub mod channel;
pub mod protocol;

pub use channel::{Channel, ChannelExit, Dispatcher, Flow, FrameContext, Outbox};
pub use protocol::{Attachment, Command, Message};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ChannelError;

/// First two bytes of every frame.
pub const FRAME_MAGIC: u16 = 0xDD5A;

/// Protocol revision spoken by this agent.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 10;

/// Maximum body size (64 MB). Safety valve against malformed headers.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command_id: u16,
    pub body_len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf[2..4].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf[4..6].copy_from_slice(&self.command_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    /// Validate and decode a header. Any failure here is connection-fatal.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ChannelError> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != FRAME_MAGIC {
            return Err(ChannelError::BadMagic { found: magic });
        }

        let version = u16::from_be_bytes([buf[2], buf[3]]);
        if version != PROTOCOL_VERSION {
            return Err(ChannelError::VersionMismatch {
                peer: version,
                agent: PROTOCOL_VERSION,
            });
        }

        let command_id = u16::from_be_bytes([buf[4], buf[5]]);
        let body_len = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if body_len as usize > MAX_BODY_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: body_len as usize,
                max: MAX_BODY_SIZE,
            });
        }

        Ok(Self {
            command_id,
            body_len,
        })
    }
}

/// One protocol message as it travels on the wire.
///
/// The header's body length is derived from the body at construction, so the
/// two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    body: Vec<u8>,
}

impl Frame {
    pub fn new(command_id: u16, body: Vec<u8>) -> Result<Self, ChannelError> {
        let body_len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len as usize <= MAX_BODY_SIZE)
            .ok_or(ChannelError::FrameTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            })?;

        Ok(Self {
            header: Header {
                command_id,
                body_len,
            },
            body,
        })
    }

    pub const fn command_id(&self) -> u16 {
        self.header.command_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub const fn header(&self) -> Header {
        self.header
    }

    /// Header and body as one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode a single frame from a complete buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        if bytes.len() < HEADER_LEN {
            return Err(ChannelError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        let (head, body) = bytes.split_at(HEADER_LEN);
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(head);
        let header = Header::decode(&buf)?;
        if body.len() != header.body_len as usize {
            return Err(ChannelError::LengthMismatch {
                announced: header.body_len as usize,
                actual: body.len(),
            });
        }
        Self::new(header.command_id, body.to_vec())
    }
}

/// Read and validate one frame header.
pub async fn read_header<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Header, ChannelError> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Header::decode(&buf)
}

/// Read exactly the body announced by `header`.
pub async fn read_body<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    header: Header,
) -> Result<Frame, ChannelError> {
    let mut body = vec![0u8; header.body_len as usize];
    reader.read_exact(&mut body).await?;
    Frame::new(header.command_id, body)
}

/// Read a complete frame (header then body).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame, ChannelError> {
    let header = read_header(reader).await?;
    read_body(reader, header).await
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await
}
