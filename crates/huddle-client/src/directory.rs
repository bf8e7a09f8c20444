use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use huddle_types::{ChangeEvent, Channel, FeedFilter, Message};

use crate::backend::{Backend, Subscription};
use crate::channel_session::ChannelSession;
use crate::error::{ClientError, Result};
use crate::session::Session;

/// The channel list beside the message view: every channel, which ones the
/// user has joined, and unread counts for joined channels that are not
/// currently open.
pub struct ChannelDirectory<B: Backend> {
    session: Session<B>,
    channels: Vec<Channel>,
    joined: HashSet<Uuid>,
    unread: HashMap<Uuid, usize>,
    filter: String,
    inserts: Option<Subscription>,
}

impl<B: Backend> ChannelDirectory<B> {
    pub fn new(session: Session<B>) -> Self {
        Self {
            session,
            channels: Vec::new(),
            joined: HashSet::new(),
            unread: HashMap::new(),
            filter: String::new(),
            inserts: None,
        }
    }

    /// Reloads channels and memberships. Failures are logged and keep the
    /// previous lists.
    pub async fn refresh(&mut self) {
        self.refresh_channels().await;
        self.refresh_joined().await;
    }

    pub async fn refresh_channels(&mut self) {
        match self.session.backend().list_channels().await {
            Ok(mut channels) => {
                channels.sort_by_key(|c| c.created_at);
                debug!("Loaded {} channels", channels.len());
                self.channels = channels;
            }
            Err(e) => error!("Error fetching channels: {}", e),
        }
    }

    pub async fn refresh_joined(&mut self) {
        let user_id = self.session.user_id();
        match self.session.backend().list_joined_channels(user_id).await {
            Ok(ids) => {
                self.joined = ids.into_iter().collect();
                self.unread.retain(|id, _| self.joined.contains(id));
            }
            Err(e) => error!("Error fetching memberships: {}", e),
        }
    }

    // -- Unread notifications --

    /// Opens the all-inserts feed that drives unread counts. Calling it
    /// again while the feed is open does nothing.
    pub async fn watch_inserts(&mut self) -> Result<()> {
        if self.inserts.is_some() {
            return Ok(());
        }
        self.session.ensure_signed_in()?;
        let subscription = self
            .session
            .backend()
            .subscribe(FeedFilter::AllInserts)
            .await
            .inspect_err(|e| error!("Error subscribing to new messages: {}", e))?;
        info!("Watching inserts ({})", subscription.handle);
        self.inserts = Some(subscription);
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.inserts.is_some()
    }

    /// Counts an insert against its channel unless that channel is `open`
    /// in the message view or not joined. Returns whether a count moved.
    pub fn note_insert(&mut self, msg: &Message, open: Option<Uuid>) -> bool {
        if Some(msg.channel_id) == open || !self.joined.contains(&msg.channel_id) {
            return false;
        }
        // Own messages never count as unread.
        if msg.is_from(self.session.user_id()) {
            return false;
        }
        *self.unread.entry(msg.channel_id).or_default() += 1;
        true
    }

    /// Waits for the next insert on the global feed and counts it against
    /// everything but the `open` channel. Pends while not watching; `None`
    /// means the feed closed.
    pub async fn next_insert(&mut self, open: Option<Uuid>) -> Option<Message> {
        let Some(inserts) = self.inserts.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match inserts.events.recv().await {
                Some(ChangeEvent::Insert(msg)) => {
                    self.note_insert(&msg, open);
                    return Some(msg);
                }
                Some(other) => debug!("Ignoring {:?} on insert feed", other.kind()),
                None => {
                    warn!("Insert feed closed");
                    self.inserts = None;
                    return None;
                }
            }
        }
    }

    /// Counts every queued insert without waiting.
    pub fn drain_inserts(&mut self, open: Option<Uuid>) -> usize {
        let mut messages = Vec::new();
        if let Some(inserts) = self.inserts.as_mut() {
            loop {
                match inserts.events.try_recv() {
                    Ok(ChangeEvent::Insert(msg)) => messages.push(msg),
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("Insert feed closed");
                        self.inserts = None;
                        break;
                    }
                }
            }
        }
        let count = messages.len();
        for msg in &messages {
            self.note_insert(msg, open);
        }
        count
    }

    pub fn mark_read(&mut self, channel_id: Uuid) {
        self.unread.remove(&channel_id);
    }

    pub fn unread(&self, channel_id: Uuid) -> usize {
        self.unread.get(&channel_id).copied().unwrap_or(0)
    }

    // -- Listing --

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn is_joined(&self, channel_id: Uuid) -> bool {
        self.joined.contains(&channel_id)
    }

    pub fn can_open(&self, channel_id: Uuid) -> bool {
        self.is_joined(channel_id)
    }

    pub fn set_filter(&mut self, text: &str) {
        self.filter = text.trim().to_lowercase();
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Channels whose name contains the filter, ignoring case.
    pub fn visible_channels(&self) -> Vec<&Channel> {
        self.channels
            .iter()
            .filter(|c| self.filter.is_empty() || c.name.to_lowercase().contains(&self.filter))
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Channel> {
        let name = name.trim();
        self.channels
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.channels.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    // -- Actions --

    pub async fn create_channel(&mut self, name: &str) -> Result<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::validation("Channel name cannot be empty."));
        }
        self.session.ensure_signed_in()?;

        let channel = self
            .session
            .backend()
            .create_channel(name)
            .await
            .inspect_err(|e| error!("Error creating channel: {}", e))?;
        info!("Created channel {} ({})", channel.name, channel.id);
        self.refresh_channels().await;
        if !self.channels.iter().any(|c| c.id == channel.id) {
            self.channels.push(channel.clone());
        }
        Ok(channel)
    }

    pub async fn join(&mut self, channel_id: Uuid) -> Result<()> {
        self.session.ensure_signed_in()?;
        if self.is_joined(channel_id) {
            return Ok(());
        }
        self.session
            .backend()
            .join_channel(channel_id, self.session.user_id())
            .await
            .inspect_err(|e| error!("Error joining channel {}: {}", channel_id, e))?;
        info!("Joined channel {}", channel_id);
        self.joined.insert(channel_id);
        Ok(())
    }

    /// Selects a joined channel in `view` and clears its unread count.
    pub async fn open(&mut self, channel_id: Uuid, view: &mut ChannelSession<B>) -> Result<()> {
        if !self.can_open(channel_id) {
            return Err(ClientError::ChannelNotJoined(channel_id));
        }
        match self.channels.iter().find(|c| c.id == channel_id) {
            Some(channel) => view.select_channel(channel.clone()).await?,
            None => view.select_channel_by_id(channel_id).await?,
        }
        self.mark_read(channel_id);
        Ok(())
    }
}

impl<B: Backend> Drop for ChannelDirectory<B> {
    fn drop(&mut self) {
        if let Some(inserts) = self.inserts.take() {
            self.session.backend().unsubscribe(inserts.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryWorld};
    use huddle_types::User;

    fn directory(world: &MemoryWorld, user: &User) -> ChannelDirectory<MemoryBackend> {
        ChannelDirectory::new(Session::new(world.connect(user), user.clone()))
    }

    #[tokio::test]
    async fn refresh_lists_channels_in_creation_order() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let general = world.add_channel("general").unwrap();
        world.add_channel("random").unwrap();
        world.add_member(general.id, alice.id).unwrap();

        let mut dir = directory(&world, &alice);
        dir.refresh().await;
        let names: Vec<_> = dir.channels().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["general", "random"]);
        assert!(dir.is_joined(general.id));
        assert_eq!(dir.channels().iter().filter(|c| dir.can_open(c.id)).count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_list() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        world.add_channel("general").unwrap();
        let mut dir = directory(&world, &alice);
        dir.refresh().await;

        dir.session.backend().fail_next("down");
        dir.refresh_channels().await;
        assert_eq!(dir.channels().len(), 1);
    }

    #[tokio::test]
    async fn create_channel_validates_and_refreshes() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let mut dir = directory(&world, &alice);

        let err = dir.create_channel("   ").await.unwrap_err();
        assert_eq!(err.to_string(), "Channel name cannot be empty.");

        let channel = dir.create_channel("  ops ").await.unwrap();
        assert_eq!(channel.name, "ops");
        assert_eq!(dir.find_by_name("OPS").map(|c| c.id), Some(channel.id));
    }

    #[tokio::test]
    async fn filter_is_case_insensitive() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        world.add_channel("General").unwrap();
        world.add_channel("random").unwrap();
        let mut dir = directory(&world, &alice);
        dir.refresh().await;

        dir.set_filter("GEN");
        let names: Vec<_> = dir.visible_channels().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["General"]);
        dir.set_filter("");
        assert_eq!(dir.visible_channels().len(), 2);
    }

    #[tokio::test]
    async fn unread_counts_skip_selected_and_own_messages() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let bob = world.add_user("bob@example.com");
        let general = world.add_channel("general").unwrap();
        let random = world.add_channel("random").unwrap();
        let other = world.add_channel("other").unwrap();
        world.add_member(general.id, alice.id).unwrap();
        world.add_member(random.id, alice.id).unwrap();

        let mut dir = directory(&world, &alice);
        dir.refresh().await;
        dir.watch_inserts().await.unwrap();

        world.post(bob.id, general.id, "seen").unwrap();
        world.post(bob.id, random.id, "unseen").unwrap();
        world.post(bob.id, random.id, "unseen too").unwrap();
        world.post(alice.id, random.id, "mine").unwrap();
        world.post(bob.id, other.id, "not joined").unwrap();

        assert_eq!(dir.drain_inserts(Some(general.id)), 5);
        assert_eq!(dir.unread(general.id), 0);
        assert_eq!(dir.unread(random.id), 2);
        assert_eq!(dir.unread(other.id), 0);

        dir.mark_read(random.id);
        assert_eq!(dir.unread(random.id), 0);
    }

    #[tokio::test]
    async fn closed_channel_counts_again_after_deselect() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let bob = world.add_user("bob@example.com");
        let general = world.add_channel("general").unwrap();
        world.add_member(general.id, alice.id).unwrap();
        let session = Session::new(world.connect(&alice), alice.clone());
        let mut dir = ChannelDirectory::new(session.clone());
        let (mut view, _signals) = ChannelSession::new(session);
        dir.refresh().await;
        dir.watch_inserts().await.unwrap();

        dir.open(general.id, &mut view).await.unwrap();
        world.post(bob.id, general.id, "while open").unwrap();
        dir.drain_inserts(view.selected_id());
        assert_eq!(dir.unread(general.id), 0);

        view.deselect();
        world.post(bob.id, general.id, "after close").unwrap();
        assert_eq!(dir.drain_inserts(view.selected_id()), 1);
        assert_eq!(dir.unread(general.id), 1);
    }

    #[tokio::test]
    async fn open_requires_membership() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let general = world.add_channel("general").unwrap();
        let session = Session::new(world.connect(&alice), alice.clone());
        let mut dir = ChannelDirectory::new(session.clone());
        let (mut view, _signals) = ChannelSession::new(session);
        dir.refresh().await;

        let err = dir.open(general.id, &mut view).await.unwrap_err();
        assert!(matches!(err, ClientError::ChannelNotJoined(id) if id == general.id));
        assert!(view.selected_channel().is_none());

        dir.join(general.id).await.unwrap();
        dir.open(general.id, &mut view).await.unwrap();
        assert_eq!(view.selected_id(), Some(general.id));
    }

    #[tokio::test]
    async fn drop_releases_insert_feed() {
        let world = MemoryWorld::new();
        let alice = world.add_user("alice@example.com");
        let mut dir = directory(&world, &alice);
        dir.watch_inserts().await.unwrap();
        dir.watch_inserts().await.unwrap();
        assert_eq!(world.subscriber_count(), 1);
        drop(dir);
        assert_eq!(world.subscriber_count(), 0);
    }
}
