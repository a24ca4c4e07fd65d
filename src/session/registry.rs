//! Session registry holding per-connection state
//!
//! The registry performs no matching itself. Every transition is a short
//! check-and-set on a single entry, so callers never hold a registry entry
//! while touching the waiting pools or the room directory.

use crate::error::{RendezvousError, Result};
use crate::types::{Locale, MatchCriteria, RoomKey, SessionId};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Connected, neither waiting nor in a room
    Idle,
    /// Waiting in the pool of a locale
    Waiting { locale: Locale },
    /// Member of a room
    InRoom { room_key: RoomKey },
}

/// Per-connection state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub display_name: String,
    pub criteria: MatchCriteria,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            display_name: String::new(),
            criteria: MatchCriteria::default(),
            state: SessionState::Idle,
            connected_at: current_timestamp(),
        }
    }

    /// Current room, if any
    pub fn room_key(&self) -> Option<&str> {
        match &self.state {
            SessionState::InRoom { room_key } => Some(room_key),
            _ => None,
        }
    }
}

/// Count of sessions per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub idle: usize,
    pub waiting: usize,
    pub in_room: usize,
}

/// Registry of live sessions on this instance
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected session with empty criteria
    pub fn register(&self, id: &str) -> Session {
        let session = Session::new(id.to_string());
        self.sessions.insert(id.to_string(), session.clone());
        debug!("Registered session {}", id);
        session
    }

    /// Discard a session when its connection ends
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|entry| entry.state.clone())
    }

    pub fn display_name(&self, id: &str) -> Option<String> {
        self.sessions.get(id).map(|entry| entry.display_name.clone())
    }

    /// Record the name and criteria a session announced
    pub fn declare(&self, id: &str, display_name: &str, criteria: MatchCriteria) -> Result<()> {
        let mut session =
            self.sessions
                .get_mut(id)
                .ok_or_else(|| RendezvousError::SessionNotFound {
                    session_id: id.to_string(),
                })?;
        session.display_name = display_name.to_string();
        session.criteria = criteria;
        Ok(())
    }

    /// Move a session into the waiting state for a locale
    pub fn mark_waiting(&self, id: &str, locale: &str) -> Result<()> {
        let mut session =
            self.sessions
                .get_mut(id)
                .ok_or_else(|| RendezvousError::SessionNotFound {
                    session_id: id.to_string(),
                })?;
        session.state = SessionState::Waiting {
            locale: locale.to_string(),
        };
        Ok(())
    }

    /// Back to idle if the session is waiting; returns the locale it waited in
    pub fn clear_waiting(&self, id: &str) -> Option<Locale> {
        let mut session = self.sessions.get_mut(id)?;
        match std::mem::replace(&mut session.state, SessionState::Idle) {
            SessionState::Waiting { locale } => Some(locale),
            other => {
                session.state = other;
                None
            }
        }
    }

    /// Check that a session is still waiting in the given locale
    pub fn is_waiting_in(&self, id: &str, locale: &str) -> bool {
        self.sessions
            .get(id)
            .map(|entry| matches!(&entry.state, SessionState::Waiting { locale: l } if l == locale))
            .unwrap_or(false)
    }

    /// Assign a room to a session that is still waiting in `locale`
    ///
    /// Returns false, leaving the session untouched, when the session is gone
    /// or no longer waiting there.
    pub fn assign_matched_room(&self, id: &str, locale: &str, room_key: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                let still_waiting =
                    matches!(&session.state, SessionState::Waiting { locale: l } if l == locale);
                if still_waiting {
                    session.state = SessionState::InRoom {
                        room_key: room_key.to_string(),
                    };
                }
                still_waiting
            }
            None => false,
        }
    }

    /// Undo `assign_matched_room` for a group that was not formed
    ///
    /// Only a session still parked in `room_key` goes back to waiting in
    /// `locale`; one that moved on since keeps its current state.
    pub fn revert_matched(&self, id: &str, locale: &str, room_key: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                let still_parked = matches!(
                    &session.state,
                    SessionState::InRoom { room_key: k } if k == room_key
                );
                if still_parked {
                    session.state = SessionState::Waiting {
                        locale: locale.to_string(),
                    };
                }
                still_parked
            }
            None => false,
        }
    }

    /// Put a session into a room through the direct path
    pub fn enter_room(&self, id: &str, room_key: &str) -> Result<()> {
        let mut session =
            self.sessions
                .get_mut(id)
                .ok_or_else(|| RendezvousError::SessionNotFound {
                    session_id: id.to_string(),
                })?;
        session.state = SessionState::InRoom {
            room_key: room_key.to_string(),
        };
        Ok(())
    }

    /// Take a session out of its room
    ///
    /// When `expected` is given the session only leaves if that is its current
    /// room. Returns the room it left.
    pub fn clear_room(&self, id: &str, expected: Option<&str>) -> Option<RoomKey> {
        let mut session = self.sessions.get_mut(id)?;
        let matches = match (&session.state, expected) {
            (SessionState::InRoom { room_key }, Some(expected)) => room_key == expected,
            (SessionState::InRoom { .. }, None) => true,
            _ => false,
        };
        if !matches {
            return None;
        }
        match std::mem::replace(&mut session.state, SessionState::Idle) {
            SessionState::InRoom { room_key } => Some(room_key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Count sessions per state
    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for entry in self.sessions.iter() {
            match entry.state {
                SessionState::Idle => counts.idle += 1,
                SessionState::Waiting { .. } => counts.waiting += 1,
                SessionState::InRoom { .. } => counts.in_room += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_starts_idle() {
        let registry = SessionRegistry::new();
        let session = registry.register("s1");
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.display_name.is_empty());
        assert_eq!(session.criteria, MatchCriteria::default());
        assert!(registry.contains("s1"));
    }

    #[test]
    fn test_declare_unknown_session_fails() {
        let registry = SessionRegistry::new();
        assert!(registry
            .declare("ghost", "name", MatchCriteria::default())
            .is_err());
    }

    #[test]
    fn test_assign_matched_room_requires_waiting_in_locale() {
        let registry = SessionRegistry::new();
        registry.register("s1");

        assert!(!registry.assign_matched_room("s1", "en", "en|chat|1"));

        registry.mark_waiting("s1", "fr").unwrap();
        assert!(!registry.assign_matched_room("s1", "en", "en|chat|1"));

        registry.mark_waiting("s1", "en").unwrap();
        assert!(registry.assign_matched_room("s1", "en", "en|chat|1"));
        assert_eq!(
            registry.state("s1"),
            Some(SessionState::InRoom {
                room_key: "en|chat|1".to_string()
            })
        );
        assert!(!registry.assign_matched_room("ghost", "en", "en|chat|1"));
    }

    #[test]
    fn test_revert_matched_only_undoes_same_room() {
        let registry = SessionRegistry::new();
        registry.register("s1");
        registry.mark_waiting("s1", "en").unwrap();
        assert!(registry.assign_matched_room("s1", "en", "en|chat|1"));

        // Moved into a code room in the meantime
        registry.clear_room("s1", None);
        registry.enter_room("s1", "ROOM01").unwrap();
        assert!(!registry.revert_matched("s1", "en", "en|chat|1"));
        assert_eq!(
            registry.state("s1"),
            Some(SessionState::InRoom {
                room_key: "ROOM01".to_string()
            })
        );

        registry.clear_room("s1", None);
        registry.mark_waiting("s1", "en").unwrap();
        assert!(registry.assign_matched_room("s1", "en", "en|chat|2"));
        assert!(registry.revert_matched("s1", "en", "en|chat|2"));
        assert!(registry.is_waiting_in("s1", "en"));
        assert!(!registry.revert_matched("ghost", "en", "en|chat|2"));
    }

    #[test]
    fn test_clear_room_respects_expected_key() {
        let registry = SessionRegistry::new();
        registry.register("s1");
        registry.enter_room("s1", "ROOM01").unwrap();

        assert_eq!(registry.clear_room("s1", Some("OTHER1")), None);
        assert_eq!(registry.get("s1").unwrap().room_key(), Some("ROOM01"));

        assert_eq!(registry.clear_room("s1", Some("ROOM01")), Some("ROOM01".to_string()));
        assert_eq!(registry.state("s1"), Some(SessionState::Idle));
        assert_eq!(registry.clear_room("s1", None), None);
    }

    #[test]
    fn test_clear_waiting_only_touches_waiting_sessions() {
        let registry = SessionRegistry::new();
        registry.register("s1");
        registry.enter_room("s1", "ROOM01").unwrap();
        assert_eq!(registry.clear_waiting("s1"), None);
        assert!(registry.get("s1").unwrap().room_key().is_some());

        registry.mark_waiting("s1", "en").unwrap();
        assert!(registry.is_waiting_in("s1", "en"));
        assert_eq!(registry.clear_waiting("s1"), Some("en".to_string()));
        assert_eq!(registry.state("s1"), Some(SessionState::Idle));
    }

    #[test]
    fn test_counts() {
        let registry = SessionRegistry::new();
        registry.register("a");
        registry.register("b");
        registry.register("c");
        registry.mark_waiting("b", "en").unwrap();
        registry.enter_room("c", "ROOM01").unwrap();

        assert_eq!(
            registry.counts(),
            SessionCounts {
                idle: 1,
                waiting: 1,
                in_room: 1
            }
        );
        assert_eq!(registry.len(), 3);
        registry.remove("a");
        assert_eq!(registry.len(), 2);
    }
}
