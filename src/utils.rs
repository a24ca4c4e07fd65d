//! Utility functions for the rendezvous service

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

/// Alphabet for human-typeable room codes; D, I and O are left out
pub const ROOM_CODE_ALPHABET: &[u8] = b"0123456789ABCEFGHJKLMNPQRSTUVWXYZ";

/// Leading character reserved for media room codes
pub const MEDIA_CODE_MARKER: char = 'D';

/// Length of a room code
pub const ROOM_CODE_LENGTH: usize = 6;

/// Generate a new unique session ID
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a new random room ID used in pool and public room keys
pub fn generate_room_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a new instance ID for this process
pub fn generate_instance_id() -> String {
    format!("rendezvous-{}", Uuid::new_v4().simple())
}

/// Build a pool or public room key
pub fn room_key(locale: &str, activity: &str, room_id: &str) -> String {
    format!("{}|{}|{}", locale, activity, room_id)
}

/// Prefix shared by every pool or public room key of a locale
pub fn locale_prefix(locale: &str) -> String {
    format!("{}|", locale)
}

/// Generate a short room code, optionally marked as a media room
pub fn generate_room_code<R: Rng + ?Sized>(rng: &mut R, media: bool) -> String {
    let mut code = String::with_capacity(ROOM_CODE_LENGTH);
    let random_len = if media {
        code.push(MEDIA_CODE_MARKER);
        ROOM_CODE_LENGTH - 1
    } else {
        ROOM_CODE_LENGTH
    };

    for _ in 0..random_len {
        let idx = rng.random_range(0..ROOM_CODE_ALPHABET.len());
        code.push(ROOM_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Check whether a code was generated for a media room
pub fn is_media_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LENGTH && code.starts_with(MEDIA_CODE_MARKER)
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch, as stamped on relayed messages
pub fn relay_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
