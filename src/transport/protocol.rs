//! Commander protocol command set and message bodies.
//!
//! Control bodies are JSON objects. Commands that carry a file
//! (`BINARY_ATTACHMENT`, `BINARY_ATTACHMENT_LOG`, `DOWNLOAD_TEST`) use a
//! binary body instead:
//!
//! ```text
//! [4-byte BE metadata length][JSON {crc32, file_size, file_name}][file bytes]
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::{Frame, PROTOCOL_VERSION};
use crate::error::ChannelError;

/// Command identifiers understood on the commander link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum Command {
    Handshake = 1,
    HandshakeOk = 2,
    SimpleMsg = 3,
    GetHostInfo = 4,
    ReplyHostInfo = 5,
    GetUuid = 6,
    ReplyUuid = 7,
    SetUuid = 8,
    BinaryAttachment = 9,
    BinaryDownloadStat = 10,
    GetLog = 11,
    BinaryAttachmentLog = 12,
    GetLogError = 13,
    DownloadTest = 14,
    DownloadTestStat = 15,
    DownloadTestError = 16,
    AssignUserTask = 17,
    ActivateAgent = 18,
    Disconnect = 19,
    Shutdown = 20,
}

impl Command {
    /// Wire identifier of this command.
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Look up a command by its wire identifier.
    pub const fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            1 => Self::Handshake,
            2 => Self::HandshakeOk,
            3 => Self::SimpleMsg,
            4 => Self::GetHostInfo,
            5 => Self::ReplyHostInfo,
            6 => Self::GetUuid,
            7 => Self::ReplyUuid,
            8 => Self::SetUuid,
            9 => Self::BinaryAttachment,
            10 => Self::BinaryDownloadStat,
            11 => Self::GetLog,
            12 => Self::BinaryAttachmentLog,
            13 => Self::GetLogError,
            14 => Self::DownloadTest,
            15 => Self::DownloadTestStat,
            16 => Self::DownloadTestError,
            17 => Self::AssignUserTask,
            18 => Self::ActivateAgent,
            19 => Self::Disconnect,
            20 => Self::Shutdown,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::HandshakeOk => "HANDSHAKE_OK",
            Self::SimpleMsg => "SIMPLE_MSG",
            Self::GetHostInfo => "GET_HOST_INFO",
            Self::ReplyHostInfo => "REPLY_HOST_INFO",
            Self::GetUuid => "GET_UUID",
            Self::ReplyUuid => "REPLY_UUID",
            Self::SetUuid => "SET_UUID",
            Self::BinaryAttachment => "BINARY_ATTACHMENT",
            Self::BinaryDownloadStat => "BINARY_DOWNLOAD_STAT",
            Self::GetLog => "GET_LOG",
            Self::BinaryAttachmentLog => "BINARY_ATTACHMENT_LOG",
            Self::GetLogError => "GET_LOG_ERROR",
            Self::DownloadTest => "DOWNLOAD_TEST",
            Self::DownloadTestStat => "DOWNLOAD_TEST_STAT",
            Self::DownloadTestError => "DOWNLOAD_TEST_ERROR",
            Self::AssignUserTask => "ASSIGN_USER_TASK",
            Self::ActivateAgent => "ACTIVATE_AGENT",
            Self::Disconnect => "DISCONNECT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Command> for u16 {
    fn from(command: Command) -> Self {
        command.id()
    }
}

impl TryFrom<u16> for Command {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| format!("unknown command id {id}"))
    }
}

/// Protocol and build version announced in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub protocol_version: u16,
    pub agent_version: String,
}

impl VersionInfo {
    /// Version of this build.
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Severity attached to a [`SimpleMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    /// A level this build does not know.
    #[serde(other)]
    Unknown,
}

/// Free-form text message, optionally tied to the command that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleMsg {
    pub text: String,
    pub severity: Severity,
    /// Unknown command ids from a newer peer read as `None`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "known_command"
    )]
    pub src_command: Option<Command>,
}

fn known_command<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Command>, D::Error> {
    Ok(Option::<u16>::deserialize(deserializer)?.and_then(Command::from_id))
}

impl SimpleMsg {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity: Severity::Info,
            src_command: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity: Severity::Error,
            src_command: None,
        }
    }

    /// Tag the message with the command it answers.
    #[must_use]
    pub const fn in_reply_to(mut self, command: Command) -> Self {
        self.src_command = Some(command);
        self
    }
}

/// Reply to `GET_HOST_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub username: String,
    pub hostname: String,
    pub version: String,
    /// Agent installation / working directory.
    pub install_path: String,
    pub agent_pid: u32,
    pub agent_port: u16,
    /// Seconds since the Unix epoch when the reply was built.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidBody {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTask {
    pub exe_file: String,
}

/// What the agent observed about a received attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStat {
    pub received_crc32: u32,
    pub received_file_size: u64,
    /// Time between the frame header arriving and the body being handled.
    pub download_time_us: u64,
}

/// A file carried inside a frame together with the sender's checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    /// CRC32 the sender computed over `data`.
    pub crc32: u32,
    /// Size the sender announced.
    pub file_size: u64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct AttachmentMeta {
    crc32: u32,
    file_size: u64,
    file_name: String,
}

impl Attachment {
    /// Wrap `data`, computing its checksum and size.
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            crc32: crc32fast::hash(&data),
            file_size: data.len() as u64,
            data,
        }
    }

    /// CRC32 of the bytes actually present.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    /// Whether the received bytes match the sender's checksum.
    pub fn is_intact(&self) -> bool {
        self.checksum() == self.crc32
    }

    fn encode(&self, command: Command) -> Result<Vec<u8>, ChannelError> {
        let meta = serde_json::to_vec(&AttachmentMeta {
            crc32: self.crc32,
            file_size: self.file_size,
            file_name: self.file_name.clone(),
        })
        .map_err(|source| ChannelError::Encode { command, source })?;
        let meta_len = u32::try_from(meta.len()).map_err(|_| ChannelError::InvalidBody {
            command,
            reason: format!("attachment metadata of {} bytes", meta.len()),
        })?;

        let mut body = Vec::with_capacity(4 + meta.len() + self.data.len());
        body.extend_from_slice(&meta_len.to_be_bytes());
        body.extend_from_slice(&meta);
        body.extend_from_slice(&self.data);
        Ok(body)
    }

    fn decode(command: Command, body: &[u8]) -> Result<Self, ChannelError> {
        let invalid = |reason: String| ChannelError::InvalidBody { command, reason };

        if body.len() < 4 {
            return Err(invalid(format!("{} bytes is too short", body.len())));
        }
        let (len_bytes, rest) = body.split_at(4);
        let meta_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if meta_len > rest.len() {
            return Err(invalid(format!(
                "metadata length {meta_len} exceeds remaining {} bytes",
                rest.len()
            )));
        }
        let (meta, data) = rest.split_at(meta_len);
        let meta: AttachmentMeta =
            serde_json::from_slice(meta).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            file_name: meta.file_name,
            crc32: meta.crc32,
            file_size: meta.file_size,
            data: data.to_vec(),
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(VersionInfo),
    HandshakeOk,
    SimpleMsg(SimpleMsg),
    GetHostInfo,
    ReplyHostInfo(HostInfo),
    GetUuid,
    ReplyUuid(UuidBody),
    SetUuid(UuidBody),
    BinaryAttachment(Attachment),
    BinaryDownloadStat(DownloadStat),
    GetLog,
    BinaryAttachmentLog(Attachment),
    GetLogError(SimpleMsg),
    DownloadTest(Attachment),
    DownloadTestStat(DownloadStat),
    DownloadTestError(SimpleMsg),
    AssignUserTask(UserTask),
    ActivateAgent,
    Disconnect,
    Shutdown,
}

impl Message {
    pub const fn command(&self) -> Command {
        match self {
            Self::Handshake(_) => Command::Handshake,
            Self::HandshakeOk => Command::HandshakeOk,
            Self::SimpleMsg(_) => Command::SimpleMsg,
            Self::GetHostInfo => Command::GetHostInfo,
            Self::ReplyHostInfo(_) => Command::ReplyHostInfo,
            Self::GetUuid => Command::GetUuid,
            Self::ReplyUuid(_) => Command::ReplyUuid,
            Self::SetUuid(_) => Command::SetUuid,
            Self::BinaryAttachment(_) => Command::BinaryAttachment,
            Self::BinaryDownloadStat(_) => Command::BinaryDownloadStat,
            Self::GetLog => Command::GetLog,
            Self::BinaryAttachmentLog(_) => Command::BinaryAttachmentLog,
            Self::GetLogError(_) => Command::GetLogError,
            Self::DownloadTest(_) => Command::DownloadTest,
            Self::DownloadTestStat(_) => Command::DownloadTestStat,
            Self::DownloadTestError(_) => Command::DownloadTestError,
            Self::AssignUserTask(_) => Command::AssignUserTask,
            Self::ActivateAgent => Command::ActivateAgent,
            Self::Disconnect => Command::Disconnect,
            Self::Shutdown => Command::Shutdown,
        }
    }

    /// Serialize into a frame ready for the outbox.
    pub fn encode(&self) -> Result<Frame, ChannelError> {
        let command = self.command();
        let body = match self {
            Self::HandshakeOk
            | Self::GetHostInfo
            | Self::GetUuid
            | Self::GetLog
            | Self::ActivateAgent
            | Self::Disconnect
            | Self::Shutdown => Vec::new(),
            Self::Handshake(v) => json(command, v)?,
            Self::SimpleMsg(m) | Self::GetLogError(m) | Self::DownloadTestError(m) => {
                json(command, m)?
            }
            Self::ReplyHostInfo(h) => json(command, h)?,
            Self::ReplyUuid(u) | Self::SetUuid(u) => json(command, u)?,
            Self::BinaryDownloadStat(s) | Self::DownloadTestStat(s) => json(command, s)?,
            Self::AssignUserTask(t) => json(command, t)?,
            Self::BinaryAttachment(a) | Self::BinaryAttachmentLog(a) | Self::DownloadTest(a) => {
                a.encode(command)?
            }
        };
        Frame::new(command.id(), body)
    }

    /// Decode a frame. Returns `Ok(None)` for command ids this build does not know.
    pub fn decode(frame: &Frame) -> Result<Option<Self>, ChannelError> {
        let Some(command) = Command::from_id(frame.command_id()) else {
            return Ok(None);
        };
        let body = frame.body();

        let message = match command {
            Command::Handshake => Self::Handshake(parse(command, body)?),
            Command::HandshakeOk => Self::HandshakeOk,
            Command::SimpleMsg => Self::SimpleMsg(parse(command, body)?),
            Command::GetHostInfo => Self::GetHostInfo,
            Command::ReplyHostInfo => Self::ReplyHostInfo(parse(command, body)?),
            Command::GetUuid => Self::GetUuid,
            Command::ReplyUuid => Self::ReplyUuid(parse(command, body)?),
            Command::SetUuid => Self::SetUuid(parse(command, body)?),
            Command::BinaryAttachment => {
                Self::BinaryAttachment(Attachment::decode(command, body)?)
            }
            Command::BinaryDownloadStat => Self::BinaryDownloadStat(parse(command, body)?),
            Command::GetLog => Self::GetLog,
            Command::BinaryAttachmentLog => {
                Self::BinaryAttachmentLog(Attachment::decode(command, body)?)
            }
            Command::GetLogError => Self::GetLogError(parse(command, body)?),
            Command::DownloadTest => Self::DownloadTest(Attachment::decode(command, body)?),
            Command::DownloadTestStat => Self::DownloadTestStat(parse(command, body)?),
            Command::DownloadTestError => Self::DownloadTestError(parse(command, body)?),
            Command::AssignUserTask => Self::AssignUserTask(parse(command, body)?),
            Command::ActivateAgent => Self::ActivateAgent,
            Command::Disconnect => Self::Disconnect,
            Command::Shutdown => Self::Shutdown,
        };
        Ok(Some(message))
    }
}

fn json<T: Serialize>(command: Command, body: &T) -> Result<Vec<u8>, ChannelError> {
    serde_json::to_vec(body).map_err(|source| ChannelError::Encode { command, source })
}

fn parse<T: DeserializeOwned>(command: Command, body: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(body).map_err(|e| ChannelError::InvalidBody {
        command,
        reason: e.to_string(),
    })
}
