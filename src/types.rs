//! Common types used throughout the rendezvous service

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Opaque connection identifier assigned by the transport
pub type SessionId = String;

/// Key of a room, either `{locale}|{activity}|{id}` or a short room code
pub type RoomKey = String;

/// Locale used to partition waiting pools and public rooms
pub type Locale = String;

/// Identifier of one server process in a horizontally scaled deployment
pub type InstanceId = String;

/// Whether a direct room search may reuse public rooms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// Kind of a targeted signaling payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// Matching criteria declared by a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub locale: Locale,
    pub activities: Vec<String>,
    pub visibility: Visibility,
    pub media_required: bool,
}

/// Capacity bounds a room inherits from its activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityBounds {
    pub min: usize,
    pub max: usize,
}

impl CapacityBounds {
    /// Bounds for rooms created by direct search, which have no upper limit
    pub fn unbounded() -> Self {
        Self {
            min: 1,
            max: usize::MAX,
        }
    }

    /// Bounds for two-party media rooms
    pub fn media() -> Self {
        Self { min: 1, max: 2 }
    }

    pub fn admits(&self, size: usize) -> bool {
        self.min <= size && size <= self.max
    }
}

/// How a room came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Formed by the matchmaking engine from a waiting pool
    Matched,
    /// Created by a public direct search, reusable by later searches
    Public,
    /// Reached through a short room code
    Private,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Matched => "matched",
            RoomKind::Public => "public",
            RoomKind::Private => "private",
        }
    }
}

/// A room member as seen by peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: SessionId,
    pub name: String,
}

/// Reason why a session left its room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Explicit,
    Disconnect,
    Requeue,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Explicit => "explicit",
            LeaveReason::Disconnect => "disconnect",
            LeaveReason::Requeue => "requeue",
        }
    }
}

/// Commands accepted from a connected client
///
/// Missing or malformed criteria default to empty values so that a sloppy
/// client never loses its connection over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    EnqueuePool {
        #[serde(default, deserialize_with = "lenient")]
        locale: Locale,
        #[serde(default, deserialize_with = "lenient")]
        activities: Vec<String>,
        #[serde(default, deserialize_with = "lenient")]
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    EnqueueDirect {
        #[serde(default, deserialize_with = "lenient")]
        locale: Locale,
        #[serde(default, deserialize_with = "lenient")]
        display_name: String,
        #[serde(default, deserialize_with = "lenient")]
        visibility: Visibility,
        #[serde(default, deserialize_with = "lenient")]
        room_code: Option<String>,
        #[serde(default, deserialize_with = "lenient")]
        media_required: bool,
    },
    Dequeue,
    #[serde(rename_all = "camelCase")]
    Leave {
        #[serde(default)]
        room_key: Option<RoomKey>,
    },
    #[serde(rename_all = "camelCase")]
    RelaySignal {
        target_id: SessionId,
        kind: SignalKind,
        #[serde(default)]
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        room_key: Option<RoomKey>,
        #[serde(default)]
        message: serde_json::Value,
    },
}

/// Parse a field, falling back to its default when the value has the wrong shape
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

impl ClientCommand {
    /// Stable command name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::EnqueuePool { .. } => "enqueue-pool",
            ClientCommand::EnqueueDirect { .. } => "enqueue-direct",
            ClientCommand::Dequeue => "dequeue",
            ClientCommand::Leave { .. } => "leave",
            ClientCommand::RelaySignal { .. } => "relay-signal",
            ClientCommand::SendMessage { .. } => "send-message",
        }
    }
}

/// Events emitted to connected clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Matched {
        activity: String,
        room_key: RoomKey,
        self_id: SessionId,
        peer_ids: Vec<SessionId>,
        peer_names: BTreeMap<SessionId, String>,
        min_players: usize,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_key: RoomKey,
        self_id: SessionId,
        peer_ids: Vec<SessionId>,
        peer_names: BTreeMap<SessionId, String>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: SessionId, peer_name: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: SessionId,
        remaining_peer_ids: Vec<SessionId>,
    },
    #[serde(rename_all = "camelCase")]
    RoomFull { room_key: RoomKey },
    #[serde(rename_all = "camelCase")]
    RelaySignal {
        sender_id: SessionId,
        kind: SignalKind,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        sender_id: SessionId,
        message: serde_json::Value,
        timestamp: i64,
    },
}

impl ServerEvent {
    /// Stable event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Matched { .. } => "matched",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::PeerJoined { .. } => "peer-joined",
            ServerEvent::PeerLeft { .. } => "peer-left",
            ServerEvent::RoomFull { .. } => "room-full",
            ServerEvent::RelaySignal { .. } => "relay-signal",
            ServerEvent::Message { .. } => "message",
        }
    }
}

/// Room membership change shared with peer instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomMutation {
    MemberJoined {
        room_key: RoomKey,
        activity: String,
        room_kind: RoomKind,
        bounds: CapacityBounds,
        media: bool,
        member: Member,
    },
    MemberLeft {
        room_key: RoomKey,
        session_id: SessionId,
    },
}

impl RoomMutation {
    pub fn room_key(&self) -> &str {
        match self {
            RoomMutation::MemberJoined { room_key, .. } => room_key,
            RoomMutation::MemberLeft { room_key, .. } => room_key,
        }
    }
}

/// Union type for everything carried by the cross-instance bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    Mutation(RoomMutation),
    Deliver {
        target: SessionId,
        event: ServerEvent,
    },
}
