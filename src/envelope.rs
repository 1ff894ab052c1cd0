//! Wire format: the [`Envelope`] and the typed [`Event`] it decodes into.
//!
//! Every message on the channel is a JSON object
//! `{ "type": "vote:trigger", "data": { ... }, "timestamp": 1700000000000 }`.
//! Decoding is fail-closed: an unknown `type` or a payload that does not match
//! the shape of its type is a [`DecodeError`], never a partially filled event.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::story::{Background, Chapter, Character, Dialogue};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The only unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data, timestamp: now_ms() }
    }

    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Which side of the room a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Streamer,
    Viewer,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Streamer => "streamer",
            PeerRole::Viewer => "viewer",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamer" => Ok(PeerRole::Streamer),
            "viewer" => Ok(PeerRole::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Every event type the channel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    VoteTrigger,
    VoteProgress,
    VoteResult,
    VoteCast,
    VoteClose,
    VoteRejected,
    PlotUpdate,
    RoomViewerCount,
    ChatMessage,
    DramaStart,
    DramaProgress,
    DramaNewChapter,
    DramaChapterInserted,
    DramaEnd,
    Ping,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        EventKind::VoteTrigger,
        EventKind::VoteProgress,
        EventKind::VoteResult,
        EventKind::VoteCast,
        EventKind::VoteClose,
        EventKind::VoteRejected,
        EventKind::PlotUpdate,
        EventKind::RoomViewerCount,
        EventKind::ChatMessage,
        EventKind::DramaStart,
        EventKind::DramaProgress,
        EventKind::DramaNewChapter,
        EventKind::DramaChapterInserted,
        EventKind::DramaEnd,
        EventKind::Ping,
        EventKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VoteTrigger => "vote:trigger",
            EventKind::VoteProgress => "vote:progress",
            EventKind::VoteResult => "vote:result",
            EventKind::VoteCast => "vote:cast",
            EventKind::VoteClose => "vote:close",
            EventKind::VoteRejected => "vote:rejected",
            EventKind::PlotUpdate => "plot:update",
            EventKind::RoomViewerCount => "room:viewer_count",
            EventKind::ChatMessage => "chat:message",
            EventKind::DramaStart => "drama:start",
            EventKind::DramaProgress => "drama:progress",
            EventKind::DramaNewChapter => "drama:new_chapter",
            EventKind::DramaChapterInserted => "drama:chapter_inserted",
            EventKind::DramaEnd => "drama:end",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    pub id: String,
    pub label: String,
    /// Candidate chapter shown to voters and inserted if this option wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Chapter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTrigger {
    pub vote_id: String,
    pub options: Vec<VoteOption>,
    /// Seconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteProgress {
    pub vote_id: String,
    pub votes: BTreeMap<String, u32>,
    pub total: u32,
    pub voted_count: u32,
    #[serde(default)]
    pub time_left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResult {
    pub vote_id: String,
    pub winner: String,
    pub votes: BTreeMap<String, u32>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCast {
    pub vote_id: String,
    pub option_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteClose {
    pub vote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRejected {
    pub vote_id: String,
    pub user_id: String,
    pub option_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotUpdate {
    pub node_id: String,
    pub image_url: String,
    pub text: String,
    #[serde(default)]
    pub next: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerCount {
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type", default = "default_chat_kind")]
    pub kind: ChatKind,
    pub content: String,
    pub sender: String,
    #[serde(default)]
    pub sender_role: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "videoUrl", default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

fn default_chat_kind() -> ChatKind {
    ChatKind::Text
}

/// Chapter announcement used by `drama:start` and `drama:new_chapter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterScene {
    pub chapter_id: u32,
    pub background: Background,
    #[serde(default)]
    pub roles: Vec<Character>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramaProgress {
    #[serde(default)]
    pub node_id: String,
    pub chapter_id: u32,
    pub dialogue_index: usize,
    pub role_index: usize,
    pub role: Option<Character>,
    pub dialogue: Option<Dialogue>,
    pub background: Background,
    pub is_chapter_end: bool,
    pub is_story_end: bool,
    #[serde(default)]
    pub should_trigger_vote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInserted {
    pub chapter_id: u32,
    pub insert_after_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramaEnd {
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    VoteTrigger(VoteTrigger),
    VoteProgress(VoteProgress),
    VoteResult(VoteResult),
    VoteCast(VoteCast),
    VoteClose(VoteClose),
    VoteRejected(VoteRejected),
    PlotUpdate(PlotUpdate),
    ViewerCount(ViewerCount),
    Chat(ChatMessage),
    DramaStart(ChapterScene),
    DramaProgress(Box<DramaProgress>),
    DramaNewChapter(ChapterScene),
    DramaChapterInserted(ChapterInserted),
    DramaEnd(DramaEnd),
    Ping,
    Pong,
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: &Value) -> Result<T, DecodeError> {
    T::deserialize(data).map_err(|e| DecodeError::Payload {
        kind: kind.as_str().to_string(),
        detail: e.to_string(),
    })
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::VoteTrigger(_) => EventKind::VoteTrigger,
            Event::VoteProgress(_) => EventKind::VoteProgress,
            Event::VoteResult(_) => EventKind::VoteResult,
            Event::VoteCast(_) => EventKind::VoteCast,
            Event::VoteClose(_) => EventKind::VoteClose,
            Event::VoteRejected(_) => EventKind::VoteRejected,
            Event::PlotUpdate(_) => EventKind::PlotUpdate,
            Event::ViewerCount(_) => EventKind::RoomViewerCount,
            Event::Chat(_) => EventKind::ChatMessage,
            Event::DramaStart(_) => EventKind::DramaStart,
            Event::DramaProgress(_) => EventKind::DramaProgress,
            Event::DramaNewChapter(_) => EventKind::DramaNewChapter,
            Event::DramaChapterInserted(_) => EventKind::DramaChapterInserted,
            Event::DramaEnd(_) => EventKind::DramaEnd,
            Event::Ping => EventKind::Ping,
            Event::Pong => EventKind::Pong,
        }
    }

    /// Decode an envelope into a typed event.
    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        let kind: EventKind = envelope.kind.parse()?;
        let data = &envelope.data;
        let event = match kind {
            EventKind::VoteTrigger => Event::VoteTrigger(payload(kind, data)?),
            EventKind::VoteProgress => Event::VoteProgress(payload(kind, data)?),
            EventKind::VoteResult => Event::VoteResult(payload(kind, data)?),
            EventKind::VoteCast => Event::VoteCast(payload(kind, data)?),
            EventKind::VoteClose => Event::VoteClose(payload(kind, data)?),
            EventKind::VoteRejected => Event::VoteRejected(payload(kind, data)?),
            EventKind::PlotUpdate => Event::PlotUpdate(payload(kind, data)?),
            EventKind::RoomViewerCount => Event::ViewerCount(payload(kind, data)?),
            EventKind::ChatMessage => Event::Chat(payload(kind, data)?),
            EventKind::DramaStart => Event::DramaStart(payload(kind, data)?),
            EventKind::DramaProgress => Event::DramaProgress(Box::new(payload(kind, data)?)),
            EventKind::DramaNewChapter => Event::DramaNewChapter(payload(kind, data)?),
            EventKind::DramaChapterInserted => Event::DramaChapterInserted(payload(kind, data)?),
            EventKind::DramaEnd => Event::DramaEnd(payload(kind, data)?),
            EventKind::Ping => Event::Ping,
            EventKind::Pong => Event::Pong,
        };
        Ok(event)
    }

    /// Encode into an envelope stamped with the current time.
    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Event::VoteTrigger(p) => serde_json::to_value(p),
            Event::VoteProgress(p) => serde_json::to_value(p),
            Event::VoteResult(p) => serde_json::to_value(p),
            Event::VoteCast(p) => serde_json::to_value(p),
            Event::VoteClose(p) => serde_json::to_value(p),
            Event::VoteRejected(p) => serde_json::to_value(p),
            Event::PlotUpdate(p) => serde_json::to_value(p),
            Event::ViewerCount(p) => serde_json::to_value(p),
            Event::Chat(p) => serde_json::to_value(p),
            Event::DramaStart(p) => serde_json::to_value(p),
            Event::DramaProgress(p) => serde_json::to_value(p),
            Event::DramaNewChapter(p) => serde_json::to_value(p),
            Event::DramaChapterInserted(p) => serde_json::to_value(p),
            Event::DramaEnd(p) => serde_json::to_value(p),
            Event::Ping | Event::Pong => Ok(Value::Object(Default::default())),
        };
        // Plain derived structs with string keys always serialize.
        Envelope::new(self.kind().as_str(), data.unwrap_or(Value::Null))
    }
}
