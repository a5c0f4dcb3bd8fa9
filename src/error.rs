//! Channel-level error types.
//!
//! Every [`ChannelError`] is connection-fatal: the connection manager stops
//! the channel and the process exits. Failures that belong to a single
//! command (log bundling, task spawning, checksum mismatches) never surface
//! here; the session turns them into replies to the commander.

use std::io;

use thiserror::Error;

use crate::identity::IdentityError;
use crate::transport::protocol::Command;

/// Errors that end a commander connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// None of the resolved commander addresses accepted a connection.
    #[error("cannot connect to commander: {0}")]
    Connect(#[source] io::Error),

    /// Socket read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The header does not start with the frame magic.
    #[error("bad frame magic {found:#06x}")]
    BadMagic {
        /// Magic value found on the wire.
        found: u16,
    },

    /// The peer speaks a different protocol revision.
    #[error("protocol version mismatch: peer {peer}, agent {agent}")]
    VersionMismatch {
        /// Version carried in the peer's header.
        peer: u16,
        /// Version this agent implements.
        agent: u16,
    },

    /// The header announces a body larger than the agent accepts.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Announced or actual body size.
        size: usize,
        /// Maximum accepted body size.
        max: usize,
    },

    /// A buffered frame does not hold the number of body bytes its header announces.
    #[error("header announces {announced} body bytes, frame holds {actual}")]
    LengthMismatch { announced: usize, actual: usize },

    /// A known command arrived with a body that does not match its shape.
    #[error("invalid {command} body: {reason}")]
    InvalidBody {
        /// Command whose body failed to decode.
        command: Command,
        /// What was wrong with it.
        reason: String,
    },

    /// An outgoing body could not be serialized.
    #[error("cannot encode {command} body: {source}")]
    Encode {
        /// Command being encoded.
        command: Command,
        /// Serializer failure.
        source: serde_json::Error,
    },

    /// The persisted agent identity could not be read or written.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The channel's writer task panicked or was aborted.
    #[error("channel task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChannelError {
    /// Whether this error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}
