use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use huddle_types::api::NewMessage;
use huddle_types::{ChangeEvent, Channel, FeedFilter, Message, MessageId};

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::mutation::{Mutation, PendingMutations};
use crate::session::Session;
use crate::store::{Applied, MessageStore};
use crate::subscription::{ChannelFeed, SubscriptionState};

/// Outbound notifications for whatever renders the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewSignal {
    /// A message was appended; keep the newest one in view.
    ScrollToBottom,
    /// The initial fetch failed; show the empty "no messages" state.
    MessagesUnavailable { channel_id: Uuid, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
    Failed(String),
}

/// Token for one channel load. Stale once another channel is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    generation: u64,
    channel_id: Uuid,
}

impl Activation {
    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }
}

/// The selected channel, its messages, and the feed keeping them current.
///
/// Selecting a channel opens its subscription first and fetches second.
/// Events that land while the fetch is in flight are held back and
/// replayed over the seeded list, so an event may arrive before, during or
/// after the fetch without being lost.
pub struct ChannelSession<B: Backend> {
    session: Session<B>,
    selected: Option<Channel>,
    store: MessageStore,
    feed: ChannelFeed,
    pending: PendingMutations,
    load_state: LoadState,
    generation: u64,
    held_back: Vec<ChangeEvent>,
    signals: mpsc::UnboundedSender<ViewSignal>,
}

impl<B: Backend> ChannelSession<B> {
    pub fn new(session: Session<B>) -> (Self, mpsc::UnboundedReceiver<ViewSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let this = Self {
            session,
            selected: None,
            store: MessageStore::new(),
            feed: ChannelFeed::new(),
            pending: PendingMutations::new(),
            load_state: LoadState::Idle,
            generation: 0,
            held_back: Vec::new(),
            signals,
        };
        (this, rx)
    }

    // -- Selection --

    /// Switches to `channel`. Reselecting the live channel does nothing.
    ///
    /// A failed fetch is not an error here: the store stays empty and
    /// `load_state` reports it. A failed subscription is.
    pub async fn select_channel(&mut self, channel: Channel) -> Result<()> {
        if self.selected_id() == Some(channel.id) && self.feed.state().is_subscribed() {
            debug!("Channel {} already active", channel.id);
            return Ok(());
        }
        self.session.ensure_signed_in()?;

        let activation = self.begin_activation(channel);
        if let Err(e) = self.open_feed(activation.channel_id).await {
            self.fail_load(activation, e.to_string());
            return Err(e);
        }

        let result = self.session.backend().list_messages(activation.channel_id).await;
        self.finish_activation(activation, result);
        Ok(())
    }

    pub async fn select_channel_by_id(&mut self, channel_id: Uuid) -> Result<()> {
        if self.selected_id() == Some(channel_id) && self.feed.state().is_subscribed() {
            return Ok(());
        }
        let channel = self.session.backend().get_channel(channel_id).await.inspect_err(|e| {
            error!("Error fetching channel {}: {}", channel_id, e);
        })?;
        self.select_channel(channel).await
    }

    /// First half of a load: drops the old channel and marks `channel` as
    /// selected and loading.
    pub fn begin_activation(&mut self, channel: Channel) -> Activation {
        self.release_feed();
        self.generation += 1;
        self.store.clear();
        self.pending.clear();
        self.held_back.clear();
        self.load_state = LoadState::Loading;

        info!("Selecting channel {} ({})", channel.name, channel.id);
        let activation = Activation {
            generation: self.generation,
            channel_id: channel.id,
        };
        self.selected = Some(channel);
        activation
    }

    /// Second half of a load. Results for a superseded activation are
    /// discarded; returns whether `result` was used.
    pub fn finish_activation(&mut self, activation: Activation, result: Result<Vec<Message>>) -> bool {
        if !self.is_current(activation) {
            debug!("Discarding fetch for superseded channel {}", activation.channel_id);
            return false;
        }

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                error!("Error fetching messages for {}: {}", activation.channel_id, e);
                self.fail_load(activation, e.to_string());
                return true;
            }
        };

        let total = messages.len();
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.channel_id == activation.channel_id)
            .collect();
        if messages.len() != total {
            warn!("Fetch for {} returned {} foreign rows", activation.channel_id, total - messages.len());
        }

        self.store.seed(messages);
        self.load_state = LoadState::Loaded;

        let held_back = std::mem::take(&mut self.held_back);
        if !held_back.is_empty() {
            debug!("Replaying {} events held back during load", held_back.len());
        }
        for event in held_back {
            self.apply_change(event);
        }
        self.drain_pending();
        true
    }

    pub fn deselect(&mut self) {
        self.release_feed();
        self.generation += 1;
        self.selected = None;
        self.store.clear();
        self.pending.clear();
        self.held_back.clear();
        self.load_state = LoadState::Idle;
    }

    async fn open_feed(&mut self, channel_id: Uuid) -> Result<()> {
        if let Some(stale) = self.feed.begin(channel_id) {
            self.session.backend().unsubscribe(stale);
        }

        match self.session.backend().subscribe(FeedFilter::Channel(channel_id)).await {
            Ok(subscription) => {
                if let Err(stale) = self.feed.acknowledge(subscription) {
                    self.session.backend().unsubscribe(stale);
                }
                Ok(())
            }
            Err(e) => {
                error!("Error subscribing to channel {}: {}", channel_id, e);
                self.feed.fail();
                Err(e)
            }
        }
    }

    fn release_feed(&mut self) {
        if let Some(handle) = self.feed.teardown() {
            info!("Releasing subscription {}", handle);
            self.session.backend().unsubscribe(handle);
        }
    }

    fn fail_load(&mut self, activation: Activation, reason: String) {
        if !self.is_current(activation) {
            return;
        }
        self.store.clear();
        self.held_back.clear();
        self.load_state = LoadState::Failed(reason.clone());
        let _ = self.signals.send(ViewSignal::MessagesUnavailable {
            channel_id: activation.channel_id,
            reason,
        });
    }

    fn is_current(&self, activation: Activation) -> bool {
        activation.generation == self.generation && self.selected_id() == Some(activation.channel_id)
    }

    // -- Change feed --

    /// Applies one feed event to the selected channel. Events for other
    /// channels are ignored.
    pub fn apply_change(&mut self, event: ChangeEvent) -> Applied {
        let Some(channel_id) = self.selected_id() else {
            return Applied::Unchanged;
        };
        if !FeedFilter::Channel(channel_id).matches(&event) {
            debug!("Ignoring {:?} for another channel", event.kind());
            return Applied::Unchanged;
        }
        if self.load_state == LoadState::Loading {
            self.held_back.push(event);
            return Applied::Unchanged;
        }

        let applied = self.store.apply(event);
        if applied == Applied::Inserted {
            let _ = self.signals.send(ViewSignal::ScrollToBottom);
        }
        applied
    }

    /// Waits for the next feed event and applies it. Pends while no
    /// subscription is open; `None` means the feed just closed.
    pub async fn next_change(&mut self) -> Option<(ChangeEvent, Applied)> {
        let event = self.feed.next().await?;
        let applied = self.apply_change(event.clone());
        Some((event, applied))
    }

    /// Applies every queued feed event without waiting. Returns how many
    /// were taken off the queue.
    pub fn drain_pending(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.feed.try_next() {
            self.apply_change(event);
            count += 1;
        }
        count
    }

    // -- Mutations --

    pub async fn send_message(&mut self, body: &str) -> Result<Message> {
        let body = validate_body(body)?;
        let channel_id = self.selected_id().ok_or(ClientError::NoChannelSelected)?;
        self.session.ensure_signed_in()?;

        let new = NewMessage {
            channel_id,
            sender_id: self.session.user_id(),
            message: body.clone(),
        };
        let ticket = self.pending.propose(Mutation::Send { channel_id, body });

        match self.session.backend().insert_message(new).await {
            Ok(row) => {
                let applied = self.pending.confirm(ticket, Some(row.clone()), &mut self.store);
                if applied == Applied::Inserted {
                    let _ = self.signals.send(ViewSignal::ScrollToBottom);
                }
                Ok(row)
            }
            Err(e) => {
                error!("Error sending message: {}", e);
                self.pending.rollback(ticket);
                Err(e)
            }
        }
    }

    pub async fn edit_message(&mut self, id: MessageId, body: &str) -> Result<Message> {
        let body = validate_body(body)?;
        self.check_own(id)?;

        let ticket = self.pending.propose(Mutation::Edit { id, body: body.clone() });
        match self.session.backend().update_message(id, &body).await {
            Ok(row) => {
                self.pending.confirm(ticket, Some(row.clone()), &mut self.store);
                Ok(row)
            }
            Err(e) => {
                error!("Error updating message {}: {}", id, e);
                self.pending.rollback(ticket);
                Err(e)
            }
        }
    }

    pub async fn delete_message(&mut self, id: MessageId) -> Result<()> {
        self.check_own(id)?;

        let ticket = self.pending.propose(Mutation::Delete { id });
        match self.session.backend().delete_message(id).await {
            Ok(()) => {
                self.pending.confirm(ticket, None, &mut self.store);
                Ok(())
            }
            Err(e) => {
                error!("Error deleting message {}: {}", id, e);
                self.pending.rollback(ticket);
                Err(e)
            }
        }
    }

    /// Edit and delete are offered only on visible messages the user sent.
    fn check_own(&self, id: MessageId) -> Result<()> {
        if self.selected.is_none() {
            return Err(ClientError::NoChannelSelected);
        }
        self.session.ensure_signed_in()?;
        let msg = self
            .store
            .get(id)
            .ok_or_else(|| ClientError::NotFound(format!("message {}", id)))?;
        if !msg.is_from(self.session.user_id()) {
            return Err(ClientError::NotOwner(id));
        }
        Ok(())
    }

    // -- Accessors --

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    pub fn selected_channel(&self) -> Option<&Channel> {
        self.selected.as_ref()
    }

    pub fn selected_id(&self) -> Option<Uuid> {
        self.selected.as_ref().map(|c| c.id)
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.feed.state()
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn pending(&self) -> &PendingMutations {
        &self.pending
    }

    pub fn is_own(&self, msg: &Message) -> bool {
        msg.is_from(self.session.user_id())
    }
}

impl<B: Backend> Drop for ChannelSession<B> {
    fn drop(&mut self) {
        self.release_feed();
    }
}

fn validate_body(body: &str) -> Result<String> {
    if body.trim().is_empty() {
        return Err(ClientError::validation("Message cannot be empty."));
    }
    Ok(body.to_string())
}
