//! In-process stand-in for the hosted backend.
//!
//! A [`MemoryWorld`] holds the tables and the change-feed dispatcher; each
//! signed-in user talks to it through their own [`MemoryBackend`]. Row
//! ownership is enforced the same way the hosted service enforces it, and
//! deletes are published without a channel id, as the hosted feed does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use huddle_types::api::NewMessage;
use huddle_types::{ChangeEvent, Channel, FeedFilter, Membership, Message, MessageId, User};

use crate::backend::{Backend, Subscription, SubscriptionHandle};
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, Result};

#[derive(Clone, Default)]
pub struct MemoryWorld {
    inner: Arc<WorldInner>,
}

#[derive(Default)]
struct WorldInner {
    state: Mutex<WorldState>,
    dispatcher: Dispatcher,
}

#[derive(Default)]
struct WorldState {
    users: HashMap<Uuid, User>,
    channels: Vec<Channel>,
    memberships: Vec<Membership>,
    messages: Vec<Message>,
    next_message_id: MessageId,
    last_stamp: Option<DateTime<Utc>>,
}

impl WorldState {
    /// Strictly increasing creation timestamps.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(ts);
        ts
    }

    fn with_email(&self, msg: &Message) -> Message {
        let mut row = msg.clone();
        row.sender_email = self.users.get(&msg.sender_id).and_then(|u| u.email.clone());
        row
    }

    fn owned_message(&mut self, actor: Uuid, id: MessageId) -> Result<&mut Message> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("message {}", id)))?;
        if msg.sender_id != actor {
            return Err(ClientError::Backend {
                status: 403,
                message: "permission denied for table messages".into(),
            });
        }
        Ok(msg)
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, email: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
        };
        self.state().users.insert(user.id, user.clone());
        user
    }

    pub fn add_channel(&self, name: &str) -> Result<Channel> {
        let mut state = self.state();
        if state.channels.iter().any(|c| c.name == name) {
            return Err(ClientError::Backend {
                status: 409,
                message: format!("channel '{}' already exists", name),
            });
        }
        let channel = Channel {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: state.stamp(),
        };
        state.channels.push(channel.clone());
        info!("Created channel {} ({})", channel.name, channel.id);
        Ok(channel)
    }

    pub fn add_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut state = self.state();
        if !state.channels.iter().any(|c| c.id == channel_id) {
            return Err(ClientError::NotFound(format!("channel {}", channel_id)));
        }
        let membership = Membership { channel_id, user_id };
        if state.memberships.contains(&membership) {
            return Err(ClientError::Backend {
                status: 409,
                message: "already a member of this channel".into(),
            });
        }
        state.memberships.push(membership);
        Ok(())
    }

    /// Inserts a message on behalf of `sender_id` and publishes it.
    pub fn post(&self, sender_id: Uuid, channel_id: Uuid, body: &str) -> Result<Message> {
        self.insert(
            sender_id,
            NewMessage {
                channel_id,
                sender_id,
                message: body.to_string(),
            },
        )
    }

    pub fn messages(&self, channel_id: Uuid) -> Vec<Message> {
        let state = self.state();
        state
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| state.with_email(m))
            .collect()
    }

    /// Pushes a raw event to matching subscribers without touching the
    /// tables. Used to replay duplicates or deliver out of order.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        self.inner.dispatcher.publish(event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.dispatcher.subscriber_count()
    }

    /// A signed-in client for `user`.
    pub fn connect(&self, user: &User) -> MemoryBackend {
        self.state().users.entry(user.id).or_insert_with(|| user.clone());
        MemoryBackend {
            world: self.clone(),
            user: Mutex::new(Some(user.id)),
            handles: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    fn insert(&self, actor: Uuid, new: NewMessage) -> Result<Message> {
        let (event, row) = {
            let mut state = self.state();
            if new.sender_id != actor {
                return Err(ClientError::Backend {
                    status: 403,
                    message: "new row violates row-level security policy for table \"messages\"".into(),
                });
            }
            if !state.channels.iter().any(|c| c.id == new.channel_id) {
                return Err(ClientError::NotFound(format!("channel {}", new.channel_id)));
            }
            state.next_message_id += 1;
            let msg = Message {
                id: state.next_message_id,
                channel_id: new.channel_id,
                sender_id: new.sender_id,
                message: new.message,
                created_at: state.stamp(),
                sender_email: None,
            };
            state.messages.push(msg.clone());
            let row = state.with_email(&msg);
            (ChangeEvent::Insert(msg), row)
        };
        self.publish(&event);
        Ok(row)
    }

    fn update(&self, actor: Uuid, id: MessageId, body: &str) -> Result<Message> {
        let (event, row) = {
            let mut state = self.state();
            let msg = state.owned_message(actor, id)?;
            msg.message = body.to_string();
            let msg = msg.clone();
            let row = state.with_email(&msg);
            (ChangeEvent::Update(msg), row)
        };
        self.publish(&event);
        Ok(row)
    }

    fn delete(&self, actor: Uuid, id: MessageId) -> Result<()> {
        {
            let mut state = self.state();
            state.owned_message(actor, id)?;
            state.messages.retain(|m| m.id != id);
        }
        self.publish(&ChangeEvent::Delete { id, channel_id: None });
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, WorldState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One user's client handle onto a [`MemoryWorld`].
pub struct MemoryBackend {
    world: MemoryWorld,
    user: Mutex<Option<Uuid>>,
    handles: Mutex<HashSet<SubscriptionHandle>>,
    failures: Mutex<VecDeque<String>>,
}

impl MemoryBackend {
    pub fn world(&self) -> &MemoryWorld {
        &self.world
    }

    /// The next backend call fails with a 503 carrying `message`.
    pub fn fail_next(&self, message: &str) {
        lock(&self.failures).push_back(message.to_string());
    }

    pub fn open_subscriptions(&self) -> usize {
        lock(&self.handles).len()
    }

    fn take_failure(&self) -> Result<()> {
        match lock(&self.failures).pop_front() {
            Some(message) => Err(ClientError::Backend { status: 503, message }),
            None => Ok(()),
        }
    }

    /// Failure injection first, then the signed-in check.
    fn actor(&self) -> Result<Uuid> {
        self.take_failure()?;
        (*lock(&self.user)).ok_or(ClientError::NotSignedIn)
    }
}

impl Backend for MemoryBackend {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.actor()?;
        let mut channels = self.world.state().channels.clone();
        channels.sort_by_key(|c| c.created_at);
        Ok(channels)
    }

    async fn get_channel(&self, channel_id: Uuid) -> Result<Channel> {
        self.actor()?;
        self.world
            .state()
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("channel {}", channel_id)))
    }

    async fn create_channel(&self, name: &str) -> Result<Channel> {
        self.actor()?;
        self.world.add_channel(name)
    }

    async fn list_joined_channels(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.actor()?;
        Ok(self
            .world
            .state()
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.channel_id)
            .collect())
    }

    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        let actor = self.actor()?;
        if actor != user_id {
            return Err(ClientError::Backend {
                status: 403,
                message: "cannot add another user to a channel".into(),
            });
        }
        self.world.add_member(channel_id, user_id)
    }

    async fn list_messages(&self, channel_id: Uuid) -> Result<Vec<Message>> {
        self.actor()?;
        let mut messages = self.world.messages(channel_id);
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let actor = self.actor()?;
        self.world.insert(actor, new)
    }

    async fn update_message(&self, id: MessageId, body: &str) -> Result<Message> {
        let actor = self.actor()?;
        self.world.update(actor, id, body)
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        let actor = self.actor()?;
        self.world.delete(actor, id)
    }

    async fn current_user(&self) -> Result<User> {
        let actor = self.actor()?;
        self.world
            .state()
            .users
            .get(&actor)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("user {}", actor)))
    }

    async fn sign_out(&self) -> Result<()> {
        self.actor()?;
        *lock(&self.user) = None;
        let handles: Vec<_> = lock(&self.handles).drain().collect();
        for handle in handles {
            self.world.inner.dispatcher.unregister(handle);
        }
        Ok(())
    }

    async fn subscribe(&self, filter: FeedFilter) -> Result<Subscription> {
        self.actor()?;
        let subscription = self.world.inner.dispatcher.register(filter);
        lock(&self.handles).insert(subscription.handle);
        debug!("Memory subscription {} for {:?}", subscription.handle, filter);
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        lock(&self.handles).remove(&handle);
        self.world.inner.dispatcher.unregister(handle);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
