use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageId};

/// Row-level change pushed by the backend's change feed.
///
/// Delivery is at-least-once and unordered, so consumers must treat every
/// variant as idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent {
    Insert(Message),
    Update(Message),
    /// Deletes usually carry only the primary key, so the channel is optional.
    Delete {
        id: MessageId,
        channel_id: Option<Uuid>,
    },
}

impl ChangeEvent {
    /// Returns the channel_id if the event says which channel it belongs to.
    pub fn channel_id(&self) -> Option<Uuid> {
        match self {
            Self::Insert(msg) | Self::Update(msg) => Some(msg.channel_id),
            Self::Delete { channel_id, .. } => *channel_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Insert(msg) | Self::Update(msg) => msg.id,
            Self::Delete { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which slice of the `messages` table a feed subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedFilter {
    /// Inserts, updates and deletes for one channel.
    Channel(Uuid),
    /// Inserts in every channel. Drives unread counters.
    AllInserts,
}

impl FeedFilter {
    /// Whether an event belongs to this filter. Deletes without a channel
    /// pass a channel filter because the feed cannot attribute them.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::Channel(channel_id) => match event.channel_id() {
                Some(id) => id == *channel_id,
                None => true,
            },
            Self::AllInserts => event.kind() == ChangeKind::Insert,
        }
    }
}
