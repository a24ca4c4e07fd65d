//! Room instance and membership bookkeeping

use crate::error::{RendezvousError, Result};
use crate::types::{CapacityBounds, Member, RoomKey, RoomKind, SessionId};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A room and its current members
#[derive(Debug, Clone)]
pub struct Room {
    key: RoomKey,
    activity: String,
    kind: RoomKind,
    /// Two-party audio/video room
    media: bool,
    members: Vec<Member>,
    bounds: CapacityBounds,
    created_at: DateTime<Utc>,
    /// Directory-wide creation order, used to enumerate public rooms oldest first
    seq: u64,
}

impl Room {
    pub fn new(
        key: RoomKey,
        activity: &str,
        kind: RoomKind,
        bounds: CapacityBounds,
        seq: u64,
    ) -> Self {
        Self {
            key,
            activity: activity.to_string(),
            kind,
            media: false,
            members: Vec::new(),
            bounds,
            created_at: current_timestamp(),
            seq,
        }
    }

    /// Turn this into a media room, capping it at two members
    pub fn with_media(mut self, media: bool) -> Self {
        if media {
            self.media = true;
            self.bounds = CapacityBounds {
                min: self.bounds.min.min(2),
                max: self.bounds.max.min(2),
            };
        }
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn bounds(&self) -> CapacityBounds {
        self.bounds
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_media(&self) -> bool {
        self.media
    }

    pub fn occupancy(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.bounds.max
    }

    pub fn is_member(&self, session_id: &str) -> bool {
        self.members.iter().any(|m| m.id == session_id)
    }

    /// Add a member; returns false if the session already was one
    pub fn add_member(&mut self, member: Member) -> Result<bool> {
        if self.is_member(&member.id) {
            return Ok(false);
        }
        if self.is_full() {
            return Err(RendezvousError::RoomFull {
                room_key: self.key.clone(),
            }
            .into());
        }
        self.members.push(member);
        Ok(true)
    }

    pub fn remove_member(&mut self, session_id: &str) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.id == session_id)?;
        Some(self.members.remove(idx))
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<SessionId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            key: self.key.clone(),
            activity: self.activity.clone(),
            kind: self.kind,
            media: self.media,
            members: self.members.clone(),
            bounds: self.bounds,
        }
    }
}

/// Point-in-time copy of a room, safe to use after the directory entry is released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub key: RoomKey,
    pub activity: String,
    pub kind: RoomKind,
    pub media: bool,
    pub members: Vec<Member>,
    pub bounds: CapacityBounds,
}

impl RoomSnapshot {
    pub fn member_ids(&self) -> Vec<SessionId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Every member except `session_id`
    pub fn peer_ids(&self, session_id: &str) -> Vec<SessionId> {
        self.members
            .iter()
            .filter(|m| m.id != session_id)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Name lookup covering every current member
    pub fn names(&self) -> BTreeMap<SessionId, String> {
        self.members
            .iter()
            .map(|m| (m.id.clone(), m.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            name: format!("name-{}", id),
        }
    }

    #[test]
    fn test_add_and_remove_members() {
        let mut room = Room::new(
            "en|chat|1".to_string(),
            "chat",
            RoomKind::Public,
            CapacityBounds::unbounded(),
            0,
        );
        assert!(room.add_member(member("a")).unwrap());
        assert!(!room.add_member(member("a")).unwrap());
        assert!(room.add_member(member("b")).unwrap());
        assert_eq!(room.occupancy(), 2);

        assert_eq!(room.remove_member("a").map(|m| m.id), Some("a".to_string()));
        assert!(room.remove_member("a").is_none());
        assert_eq!(room.member_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_media_room_rejects_third_member() {
        let mut room = Room::new(
            "DABCDE".to_string(),
            "video",
            RoomKind::Private,
            CapacityBounds::unbounded(),
            0,
        )
        .with_media(true);
        assert_eq!(room.bounds(), CapacityBounds::media());
        room.add_member(member("a")).unwrap();
        room.add_member(member("b")).unwrap();
        assert!(room.is_full());

        let err = room.add_member(member("c")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendezvousError>(),
            Some(RendezvousError::RoomFull { .. })
        ));
        assert_eq!(room.occupancy(), 2);
    }

    #[test]
    fn test_snapshot_views() {
        let mut room = Room::new(
            "ROOM01".to_string(),
            "chat",
            RoomKind::Private,
            CapacityBounds::unbounded(),
            3,
        );
        room.add_member(member("a")).unwrap();
        room.add_member(member("b")).unwrap();
        room.add_member(member("c")).unwrap();

        let snapshot = room.snapshot();
        assert_eq!(snapshot.peer_ids("b"), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(snapshot.names().len(), 3);
        assert_eq!(snapshot.names()["c"], "name-c");
    }
}
