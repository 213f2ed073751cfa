use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Identity supplied by the auth/search collaborators. The core trusts it
/// without re-verifying credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bg_color: String,
}

/// A single chat message. Appended once, never mutated or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broadcast-group key of the owning room.
    pub room: String,
    /// Sender's username, denormalized at send time.
    pub author: String,
    pub content: String,
    /// Server-side wall-clock `HH:MM`, captured when the message is
    /// persisted. Display-only; ordering authority is array position.
    pub timestamp: String,
}

/// A durable two-party chat room with its embedded message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRoom {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Display label and broadcast-group key, `"{a}_and_{b}"` with
    /// usernames in lexicographic order.
    pub room_name: String,
    /// Canonical sorted pair of participant ids. Room identity: exactly
    /// one room may exist per pair.
    pub pair_key: String,
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ChatRoom {
    pub fn new(participants: Vec<UserRef>) -> Result<Self, ChatError> {
        let [a, b]: &[UserRef; 2] = participants.as_slice().try_into().map_err(|_| {
            ChatError::Validation("a chat room must have exactly two participants".into())
        })?;
        if a.id == b.id {
            return Err(ChatError::Validation(
                "a chat room needs two distinct participants".into(),
            ));
        }

        Ok(Self {
            id: ObjectId::new(),
            room_name: room_name(&a.username, &b.username),
            pair_key: pair_key(&a.id, &b.id),
            participants,
            messages: Vec::new(),
        })
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

/// Canonical display name for a participant pair.
pub fn room_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}_and_{second}")
}

/// Canonical identity key for a participant pair, independent of the
/// order the participants were supplied in.
pub fn pair_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}:{second}")
}
