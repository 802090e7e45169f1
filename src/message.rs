use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter};

use crate::error::{Error, ProtocolErrorKind};

/// Tag carried in the `Type` field of every [`Envelope`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Raw terminal output from the streamer.
    Write,
    /// A block of terminal writes with their offsets.
    WriteBlock,
    /// Streamer terminal resized.
    Winsize,
    Chat,
    RoomInfo,
    /// Title change request.
    RoomUpdate,
    /// First message of every connection, used for the handshake.
    ClientInfo,
    RequestWinsize,
    RequestRoomInfo,
    /// Sent by late joiners so they don't face an idle screen.
    RequestCacheContent,
    RequestCacheChat,
    #[serde(rename = "RTC")]
    #[strum(serialize = "RTC")]
    Rtc,
    Authorized,
    Unauthorized,
    Close,
    Error,
    #[serde(other)]
    Unknown,
}

/// The typed message wrapper used on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: MessageType,
    #[serde(rename = "Data", default)]
    pub data: Value,
    /// Offset in milliseconds, used by recordings and write blocks.
    #[serde(rename = "Delay", default, skip_serializing_if = "is_zero")]
    pub delay: i64,
}

fn is_zero(delay: &i64) -> bool {
    *delay == 0
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, Error> {
        Ok(Self {
            kind,
            data: serde_json::to_value(payload)?,
            delay: 0,
        })
    }

    /// An envelope without payload, such as a request or a close.
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            data: Value::Null,
            delay: 0,
        }
    }

    pub fn rtc(event: RtcEvent, data: String) -> Result<Self, Error> {
        Self::new(MessageType::Rtc, &Rtc { event, data })
    }

    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    /// Decodes the payload. Malformed data is reported as a protocol error.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.data.clone()).map_err(|err| {
            Error::new_protocol(
                format!("malformed {} payload: {}", self.kind, err),
                ProtocolErrorKind::MalformedPayload,
            )
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::new_protocol(
                format!("undecodable envelope: {}", err),
                ProtocolErrorKind::MalformedPayload,
            )
        })
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
pub enum Role {
    /// Sends terminal content.
    Streamer,
    /// The streamer's own chat window.
    StreamerChat,
    /// Views content and chats.
    Viewer,
    /// Publishes audio/video to the SFU.
    #[serde(rename = "ProducerRTC", alias = "RTCProducer")]
    #[strum(serialize = "ProducerRTC")]
    ProducerRtc,
    /// Receives audio/video from the SFU.
    #[serde(rename = "ConsumerRTC", alias = "RTCConsumer")]
    #[strum(serialize = "ConsumerRTC")]
    ConsumerRtc,
}

impl Role {
    /// Roles allowed to change the room title.
    pub fn can_update_room(&self) -> bool {
        matches!(self, Role::Streamer | Role::StreamerChat)
    }

    /// Roles that authenticate with the room secret rather than the viewer key.
    pub fn requires_secret(&self) -> bool {
        matches!(self, Role::Streamer | Role::StreamerChat | Role::ProducerRtc)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Streaming,
    /// Terminal state.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Winsize {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChatMessage {
    pub name: String,
    pub content: String,
    pub color: String,
    pub time: String,
    pub role: String,
}

impl ChatMessage {
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Chat payloads arrive either as a single message or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatBatch {
    Many(Vec<ChatMessage>),
    One(ChatMessage),
}

impl ChatBatch {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            ChatBatch::Many(messages) => messages,
            ChatBatch::One(message) => vec![message],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomUpdate {
    pub title: String,
}

/// Snapshot of a room, sent to clients and to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoomInfo {
    #[serde(rename = "StreamerID")]
    pub streamer_id: String,
    pub title: String,
    #[serde(rename = "NViewers")]
    pub n_viewers: usize,
    #[serde(rename = "AccNViewers")]
    pub acc_n_viewers: u64,
    pub started_time: DateTime<Utc>,
    pub last_active_time: DateTime<Utc>,
    pub stopped_time: Option<DateTime<Utc>>,
    pub status: RoomStatus,
    pub private: bool,
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientInfo {
    /// Room name.
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Used by a streamer creating the room.
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtcEvent {
    Offer,
    Answer,
    Candidate,
}

/// WebRTC signaling payload. `data` holds the JSON text of an SDP or ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rtc {
    pub event: RtcEvent,
    pub data: String,
}
