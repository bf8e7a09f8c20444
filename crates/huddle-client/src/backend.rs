//! The hosted-service capabilities this client consumes.
//!
//! Bulk reads, mutations, identity and the change feed all sit behind
//! [`Backend`]. [`crate::hosted::HostedBackend`] talks to the real service;
//! [`crate::memory::MemoryBackend`] runs in-process for tests and demos.
#![allow(async_fn_in_trait)]

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_types::{ChangeEvent, Channel, FeedFilter, Message, MessageId, User};
use huddle_types::api::NewMessage;

use crate::error::Result;

/// Identifies one open change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An acknowledged subscription. Events arrive on `events` until the
/// subscription is torn down or the connection drops.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub filter: FeedFilter,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

pub trait Backend {
    // -- Channels --

    /// All channels, oldest first.
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    async fn get_channel(&self, channel_id: Uuid) -> Result<Channel>;

    async fn create_channel(&self, name: &str) -> Result<Channel>;

    /// Ids of the channels `user_id` has joined.
    async fn list_joined_channels(&self, user_id: Uuid) -> Result<Vec<Uuid>>;

    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()>;

    // -- Messages --

    /// Messages of one channel ordered by creation time.
    async fn list_messages(&self, channel_id: Uuid) -> Result<Vec<Message>>;

    async fn insert_message(&self, new: NewMessage) -> Result<Message>;

    async fn update_message(&self, id: MessageId, body: &str) -> Result<Message>;

    async fn delete_message(&self, id: MessageId) -> Result<()>;

    // -- Identity --

    async fn current_user(&self) -> Result<User>;

    async fn sign_out(&self) -> Result<()>;

    // -- Change feed --

    /// Opens a filtered subscription and waits for the service to acknowledge it.
    async fn subscribe(&self, filter: FeedFilter) -> Result<Subscription>;

    /// Releases a subscription. Never blocks, so it can run from `Drop`.
    /// Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}
