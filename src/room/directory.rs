//! Room directory: the authoritative room key to member set mapping
//!
//! Membership of each room is serialized by its map entry. Searches never hold
//! an entry while iterating: they pick a candidate from a scan, then re-check
//! it under the entry lock before joining.

use crate::error::{RendezvousError, Result};
use crate::room::instance::{Room, RoomSnapshot};
use crate::types::{CapacityBounds, Member, RoomKey, RoomKind, RoomMutation, SessionId};
use crate::utils::{
    current_timestamp, generate_room_code, generate_room_id, locale_prefix, room_key,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Activity name given to rooms reached by direct search
pub const DIRECT_ACTIVITY: &str = "chat";

/// Activity name given to media rooms reached by direct search
pub const MEDIA_ACTIVITY: &str = "video";

/// Default number of candidate rooms a public search re-checks before creating one
pub const DEFAULT_PUBLIC_SEARCH_ATTEMPTS: usize = 8;

const MAX_CODE_ATTEMPTS: usize = 64;

/// How long a leave that overtook its join keeps cancelling that join
const DEPARTURE_TTL_SECONDS: i64 = 60;

/// Result of a direct room search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The session is now a member of `room`
    Joined { room: RoomSnapshot, created: bool },
    /// The requested room is at its media cap; nothing changed
    Full { room_key: RoomKey },
}

/// A member leaving a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub member: Member,
    /// The room as it is after the removal
    pub room: RoomSnapshot,
    /// The room became empty and was dropped from the directory
    pub dropped: bool,
}

impl Departure {
    pub fn remaining_ids(&self) -> Vec<SessionId> {
        self.room.member_ids()
    }
}

/// Directory of every room known to this instance
#[derive(Debug)]
pub struct RoomDirectory {
    rooms: DashMap<RoomKey, Room>,
    /// Remote leaves that arrived before the matching join
    departed: DashMap<(RoomKey, SessionId), DateTime<Utc>>,
    next_seq: AtomicU64,
    public_search_attempts: usize,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::with_search_attempts(DEFAULT_PUBLIC_SEARCH_ATTEMPTS)
    }

    pub fn with_search_attempts(public_search_attempts: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            departed: DashMap::new(),
            next_seq: AtomicU64::new(0),
            public_search_attempts: public_search_attempts.max(1),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn direct_room(&self, key: RoomKey, kind: RoomKind, media: bool) -> Room {
        let activity = if media { MEDIA_ACTIVITY } else { DIRECT_ACTIVITY };
        Room::new(
            key,
            activity,
            kind,
            CapacityBounds::unbounded(),
            self.next_seq(),
        )
        .with_media(media)
    }

    /// Register a room formed by the matchmaking engine
    pub fn register_matched(
        &self,
        key: &str,
        activity: &str,
        bounds: CapacityBounds,
        media: bool,
        members: Vec<Member>,
    ) -> Result<RoomSnapshot> {
        match self.rooms.entry(key.to_string()) {
            Entry::Occupied(_) => Err(RendezvousError::InternalError {
                message: format!("Room key already in use: {}", key),
            }
            .into()),
            Entry::Vacant(entry) => {
                let mut room = Room::new(
                    key.to_string(),
                    activity,
                    RoomKind::Matched,
                    bounds,
                    self.next_seq(),
                )
                .with_media(media);
                for member in members {
                    room.add_member(member)?;
                }
                let snapshot = room.snapshot();
                entry.insert(room);
                Ok(snapshot)
            }
        }
    }

    /// Join the room with the given code, creating it if it does not exist
    pub fn join_code(
        &self,
        code: &str,
        member: Member,
        media_required: bool,
    ) -> Result<JoinOutcome> {
        match self.rooms.entry(code.to_string()) {
            Entry::Occupied(mut entry) => {
                let room = entry.get_mut();
                if room.is_member(&member.id) {
                    return Ok(JoinOutcome::Joined {
                        room: room.snapshot(),
                        created: false,
                    });
                }
                let media_join = media_required || room.is_media();
                if (media_join && room.occupancy() >= 2) || room.is_full() {
                    debug!("Room {} is full, rejecting {}", code, member.id);
                    return Ok(JoinOutcome::Full {
                        room_key: code.to_string(),
                    });
                }
                room.add_member(member)?;
                Ok(JoinOutcome::Joined {
                    room: room.snapshot(),
                    created: false,
                })
            }
            Entry::Vacant(entry) => {
                let kind = if code.contains('|') {
                    RoomKind::Public
                } else {
                    RoomKind::Private
                };
                let mut room = self.direct_room(code.to_string(), kind, media_required);
                room.add_member(member)?;
                let snapshot = room.snapshot();
                entry.insert(room);
                info!("Created room {} from requested code", code);
                Ok(JoinOutcome::Joined {
                    room: snapshot,
                    created: true,
                })
            }
        }
    }

    /// Oldest room of `locale` that has exactly one occupant
    fn public_candidate(&self, prefix: &str, member_id: &str, media: bool) -> Option<RoomKey> {
        self.rooms
            .iter()
            .filter(|entry| {
                let room = entry.value();
                entry.key().starts_with(prefix)
                    && room.occupancy() == 1
                    && room.is_media() == media
                    && !room.is_member(member_id)
            })
            .min_by_key(|entry| entry.value().seq())
            .map(|entry| entry.key().clone())
    }

    /// Join the oldest public room of `locale` with one occupant, or create one
    pub fn join_public(
        &self,
        locale: &str,
        member: Member,
        media_required: bool,
    ) -> Result<JoinOutcome> {
        let prefix = locale_prefix(locale);

        for _ in 0..self.public_search_attempts {
            let Some(key) = self.public_candidate(&prefix, &member.id, media_required) else {
                break;
            };
            if let Some(mut room) = self.rooms.get_mut(&key) {
                if room.occupancy() == 1 && !room.is_full() {
                    room.add_member(member)?;
                    return Ok(JoinOutcome::Joined {
                        room: room.snapshot(),
                        created: false,
                    });
                }
            }
            debug!("Public candidate {} changed before join, searching again", key);
        }

        let activity = if media_required {
            MEDIA_ACTIVITY
        } else {
            DIRECT_ACTIVITY
        };
        let key = room_key(locale, activity, &generate_room_id());
        let mut room = self.direct_room(key.clone(), RoomKind::Public, media_required);
        room.add_member(member)?;
        let snapshot = room.snapshot();
        self.rooms.insert(key.clone(), room);
        info!("Created public room {}", key);
        Ok(JoinOutcome::Joined {
            room: snapshot,
            created: true,
        })
    }

    /// Create a private room under a freshly generated code
    pub fn create_private(&self, member: Member, media_required: bool) -> Result<RoomSnapshot> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_room_code(&mut rand::rng(), media_required);
            if let Entry::Vacant(entry) = self.rooms.entry(code.clone()) {
                let mut room = self.direct_room(code.clone(), RoomKind::Private, media_required);
                room.add_member(member)?;
                let snapshot = room.snapshot();
                entry.insert(room);
                info!("Created private room {}", code);
                return Ok(snapshot);
            }
        }

        Err(RendezvousError::InternalError {
            message: "Could not generate an unused room code".to_string(),
        }
        .into())
    }

    /// Remove a member; an emptied room is dropped and its key freed
    pub fn leave(&self, key: &str, session_id: &str) -> Option<Departure> {
        let departure = {
            let mut room = self.rooms.get_mut(key)?;
            let member = room.remove_member(session_id)?;
            Departure {
                member,
                room: room.snapshot(),
                dropped: room.is_empty(),
            }
        };

        if departure.dropped {
            self.rooms.remove_if(key, |_, room| room.is_empty());
            debug!("Dropped empty room {}", key);
        }
        Some(departure)
    }

    /// Apply a membership change published by a peer instance
    ///
    /// Returns whether anything changed; replays are no-ops. The bus does not
    /// order messages from different publishers, so a leave may arrive before
    /// the join it undoes. Such a leave is remembered for a while and swallows
    /// that join when it shows up.
    pub fn apply_remote(&self, mutation: &RoomMutation) -> bool {
        match mutation {
            RoomMutation::MemberJoined {
                room_key,
                activity,
                room_kind,
                bounds,
                media,
                member,
            } => {
                let tombstone = (room_key.clone(), member.id.clone());
                if let Some((_, left_at)) = self.departed.remove(&tombstone) {
                    if current_timestamp() - left_at < departure_ttl() {
                        debug!(
                            "Dropping remote join of {} into {}: already left",
                            member.id, room_key
                        );
                        return false;
                    }
                }

                let mut room = self.rooms.entry(room_key.clone()).or_insert_with(|| {
                    Room::new(
                        room_key.clone(),
                        activity,
                        *room_kind,
                        *bounds,
                        self.next_seq(),
                    )
                    .with_media(*media)
                });
                match room.add_member(member.clone()) {
                    Ok(added) => added,
                    Err(e) => {
                        warn!(
                            "Ignoring remote join of {} into {}: {}",
                            member.id, room_key, e
                        );
                        false
                    }
                }
            }
            RoomMutation::MemberLeft {
                room_key,
                session_id,
            } => {
                if self.leave(room_key, session_id).is_some() {
                    return true;
                }
                self.record_departure(room_key, session_id);
                false
            }
        }
    }

    fn record_departure(&self, room_key: &str, session_id: &str) {
        let now = current_timestamp();
        self.departed.retain(|_, left_at| now - *left_at < departure_ttl());
        self.departed
            .insert((room_key.to_string(), session_id.to_string()), now);
    }

    pub fn get(&self, key: &str) -> Option<RoomSnapshot> {
        self.rooms.get(key).map(|room| room.snapshot())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rooms.contains_key(key)
    }

    pub fn is_member(&self, key: &str, session_id: &str) -> bool {
        self.rooms
            .get(key)
            .map(|room| room.is_member(session_id))
            .unwrap_or(false)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.rooms.iter().map(|room| room.occupancy()).sum()
    }

    pub fn counts_by_kind(&self) -> HashMap<RoomKind, usize> {
        let mut counts = HashMap::new();
        for room in self.rooms.iter() {
            *counts.entry(room.kind()).or_insert(0) += 1;
        }
        counts
    }
}

fn departure_ttl() -> Duration {
    Duration::seconds(DEPARTURE_TTL_SECONDS)
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_media_code;

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            name: id.to_uppercase(),
        }
    }

    fn joined(outcome: JoinOutcome) -> RoomSnapshot {
        match outcome {
            JoinOutcome::Joined { room, .. } => room,
            JoinOutcome::Full { room_key } => panic!("room {} unexpectedly full", room_key),
        }
    }

    #[test]
    fn test_join_code_creates_then_joins() {
        let directory = RoomDirectory::new();
        let first = directory.join_code("ROOM01", member("a"), false).unwrap();
        assert!(matches!(first, JoinOutcome::Joined { created: true, .. }));

        let room = joined(directory.join_code("ROOM01", member("b"), false).unwrap());
        assert_eq!(room.member_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(room.kind, RoomKind::Private);
        assert_eq!(room.activity, DIRECT_ACTIVITY);
    }

    #[test]
    fn test_media_join_into_full_room() {
        let directory = RoomDirectory::new();
        joined(directory.join_code("DXYZ12", member("a"), true).unwrap());
        joined(directory.join_code("DXYZ12", member("b"), true).unwrap());

        let outcome = directory.join_code("DXYZ12", member("c"), true).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Full {
                room_key: "DXYZ12".to_string()
            }
        );
        assert_eq!(
            directory.get("DXYZ12").unwrap().member_ids(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_media_join_into_crowded_plain_room_is_full() {
        let directory = RoomDirectory::new();
        joined(directory.join_code("PLAIN1", member("a"), false).unwrap());
        joined(directory.join_code("PLAIN1", member("b"), false).unwrap());
        joined(directory.join_code("PLAIN1", member("c"), false).unwrap());

        let outcome = directory.join_code("PLAIN1", member("d"), true).unwrap();
        assert!(matches!(outcome, JoinOutcome::Full { .. }));
        assert_eq!(directory.get("PLAIN1").unwrap().members.len(), 3);
    }

    #[test]
    fn test_public_search_joins_single_occupant_rooms_only() {
        let directory = RoomDirectory::new();
        let first = joined(directory.join_public("en", member("a"), false).unwrap());
        assert!(first.key.starts_with("en|chat|"));

        let second = joined(directory.join_public("en", member("b"), false).unwrap());
        assert_eq!(second.key, first.key);

        let third = joined(directory.join_public("en", member("c"), false).unwrap());
        assert_ne!(third.key, first.key);
        assert_eq!(third.members.len(), 1);
        assert_eq!(directory.room_count(), 2);
    }

    #[test]
    fn test_public_search_prefers_oldest_room() {
        let directory = RoomDirectory::new();
        let older = joined(directory.join_code("en|chat|old", member("a"), false).unwrap());
        joined(directory.join_code("en|chat|new", member("b"), false).unwrap());

        let room = joined(directory.join_public("en", member("c"), false).unwrap());
        assert_eq!(room.key, older.key);
    }

    #[test]
    fn test_public_search_respects_locale_boundary() {
        let directory = RoomDirectory::new();
        joined(directory.join_public("en-GB", member("a"), false).unwrap());
        let room = joined(directory.join_public("en", member("b"), false).unwrap());
        assert_eq!(room.members.len(), 1);
        assert!(room.key.starts_with("en|"));
    }

    #[test]
    fn test_private_codes() {
        let directory = RoomDirectory::new();
        let plain = directory.create_private(member("a"), false).unwrap();
        let media = directory.create_private(member("b"), true).unwrap();
        assert!(!is_media_code(&plain.key));
        assert!(is_media_code(&media.key));
        assert!(media.media);
        assert_eq!(media.bounds, CapacityBounds::media());
    }

    #[test]
    fn test_leave_reports_remaining_and_drops_empty_rooms() {
        let directory = RoomDirectory::new();
        joined(directory.join_code("ROOM01", member("a"), false).unwrap());
        joined(directory.join_code("ROOM01", member("b"), false).unwrap());

        let departure = directory.leave("ROOM01", "a").unwrap();
        assert_eq!(departure.remaining_ids(), vec!["b".to_string()]);
        assert!(!departure.dropped);

        assert!(directory.leave("ROOM01", "a").is_none());

        let last = directory.leave("ROOM01", "b").unwrap();
        assert!(last.dropped);
        assert!(!directory.contains("ROOM01"));
    }

    #[test]
    fn test_register_matched_rejects_duplicate_key() {
        let directory = RoomDirectory::new();
        let bounds = CapacityBounds { min: 2, max: 2 };
        let room = directory
            .register_matched(
                "en|chat|x",
                "chat",
                bounds,
                false,
                vec![member("a"), member("b")],
            )
            .unwrap();
        assert_eq!(room.kind, RoomKind::Matched);
        assert!(directory
            .register_matched("en|chat|x", "chat", bounds, false, vec![member("c")])
            .is_err());
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let directory = RoomDirectory::new();
        let joined_mutation = RoomMutation::MemberJoined {
            room_key: "en|chat|r".to_string(),
            activity: "chat".to_string(),
            room_kind: RoomKind::Public,
            bounds: CapacityBounds::unbounded(),
            media: false,
            member: member("remote"),
        };

        assert!(directory.apply_remote(&joined_mutation));
        assert!(!directory.apply_remote(&joined_mutation));
        assert_eq!(directory.get("en|chat|r").unwrap().members.len(), 1);

        let left = RoomMutation::MemberLeft {
            room_key: "en|chat|r".to_string(),
            session_id: "remote".to_string(),
        };
        assert!(directory.apply_remote(&left));
        assert!(!directory.apply_remote(&left));
        assert!(!directory.contains("en|chat|r"));
    }

    #[test]
    fn test_remote_leave_before_join_cancels_the_join() {
        let directory = RoomDirectory::new();
        let join = |id: &str| RoomMutation::MemberJoined {
            room_key: "en|pair|m".to_string(),
            activity: "pair".to_string(),
            room_kind: RoomKind::Matched,
            bounds: CapacityBounds { min: 2, max: 2 },
            media: false,
            member: member(id),
        };
        let left = RoomMutation::MemberLeft {
            room_key: "en|pair|m".to_string(),
            session_id: "b".to_string(),
        };

        assert!(!directory.apply_remote(&left));
        assert!(directory.apply_remote(&join("a")));
        assert!(!directory.apply_remote(&join("b")));
        assert_eq!(
            directory.get("en|pair|m").unwrap().member_ids(),
            vec!["a".to_string()]
        );

        // The leave was used up; a later rejoin goes through
        assert!(directory.apply_remote(&join("b")));
        assert_eq!(directory.get("en|pair|m").unwrap().members.len(), 2);
    }

    #[test]
    fn test_member_count_spans_rooms() {
        let directory = RoomDirectory::new();
        assert_eq!(directory.member_count(), 0);
        joined(directory.join_code("ROOM01", member("a"), false).unwrap());
        joined(directory.join_code("ROOM01", member("b"), false).unwrap());
        joined(directory.join_public("en", member("c"), false).unwrap());
        assert_eq!(directory.member_count(), 3);
    }
}
