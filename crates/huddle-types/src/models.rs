use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row identifier of a message. Assigned by the backend.
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A joined-channel relation. Created on join, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
}

/// A chat message as stored by the backend.
///
/// `created_at` is server-assigned and is what the initial fetch orders by.
/// Only `message` (the body) changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Joined from the auth schema when the backend exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
}

impl Message {
    pub fn is_from(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id
    }

    /// Name shown next to the message bubble.
    pub fn display_name(&self, current_user: Uuid) -> String {
        if self.is_from(current_user) {
            return "You".to_string();
        }
        match self.sender_email.as_deref() {
            Some(email) => email.split('@').next().unwrap_or(email).to_string(),
            None => "User".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: Uuid, sender_email: Option<&str>) -> Message {
        Message {
            id: 7,
            channel_id: Uuid::new_v4(),
            sender_id,
            message: "hello".into(),
            created_at: Utc::now(),
            sender_email: sender_email.map(str::to_string),
        }
    }

    #[test]
    fn own_messages_display_as_you() {
        let me = Uuid::new_v4();
        assert_eq!(message(me, Some("me@example.com")).display_name(me), "You");
    }

    #[test]
    fn others_display_email_local_part() {
        let me = Uuid::new_v4();
        let msg = message(Uuid::new_v4(), Some("alice@example.com"));
        assert_eq!(msg.display_name(me), "alice");
    }

    #[test]
    fn unknown_sender_falls_back() {
        let me = Uuid::new_v4();
        assert_eq!(message(Uuid::new_v4(), None).display_name(me), "User");
    }

    #[test]
    fn decodes_rest_row_without_email() {
        let json = r#"{
            "id": 12,
            "channel_id": "6f1d7c1e-8a4b-4b8e-9a55-0a5d2c1f0b11",
            "sender_id": "0b1f6c3a-2d4e-4f5a-8b6c-7d8e9f0a1b2c",
            "message": "hi",
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 12);
        assert_eq!(msg.message, "hi");
        assert!(msg.sender_email.is_none());
    }
}
