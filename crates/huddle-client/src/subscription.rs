use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use huddle_types::{ChangeEvent, FeedFilter};

use crate::backend::{Subscription, SubscriptionHandle};

/// Lifecycle of the one change-feed subscription a channel view owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing { channel_id: Uuid },
    Subscribed { channel_id: Uuid, handle: SubscriptionHandle },
}

impl SubscriptionState {
    pub fn channel_id(&self) -> Option<Uuid> {
        match self {
            Self::Unsubscribed => None,
            Self::Subscribing { channel_id } | Self::Subscribed { channel_id, .. } => Some(*channel_id),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed { .. })
    }
}

/// Holds the subscription state together with its event queue.
///
/// The transitions never talk to the network. Every method that leaves a
/// subscription behind returns its handle so the caller can release it on
/// the backend; at most one handle is live at any time.
#[derive(Debug)]
pub struct ChannelFeed {
    state: SubscriptionState,
    events: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
}

impl Default for ChannelFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self {
            state: SubscriptionState::Unsubscribed,
            events: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Starts subscribing to `channel_id`, tearing down whatever was there.
    pub fn begin(&mut self, channel_id: Uuid) -> Option<SubscriptionHandle> {
        let released = self.teardown();
        self.state = SubscriptionState::Subscribing { channel_id };
        released
    }

    /// Records the service's acknowledgement.
    ///
    /// An acknowledgement that no longer matches the pending channel is
    /// rejected and its handle returned for release.
    pub fn acknowledge(&mut self, subscription: Subscription) -> Result<(), SubscriptionHandle> {
        let SubscriptionState::Subscribing { channel_id } = self.state else {
            warn!("Dropping unexpected subscription ack {}", subscription.handle);
            return Err(subscription.handle);
        };
        if subscription.filter != FeedFilter::Channel(channel_id) {
            warn!("Dropping stale subscription ack {} for {:?}", subscription.handle, subscription.filter);
            return Err(subscription.handle);
        }

        debug!("Subscribed to channel {} ({})", channel_id, subscription.handle);
        self.state = SubscriptionState::Subscribed {
            channel_id,
            handle: subscription.handle,
        };
        self.events = Some(subscription.events);
        Ok(())
    }

    /// Subscribing failed; back to `Unsubscribed`.
    pub fn fail(&mut self) {
        if matches!(self.state, SubscriptionState::Subscribing { .. }) {
            self.state = SubscriptionState::Unsubscribed;
        }
    }

    /// Unconditional teardown. Queued events are discarded with the queue.
    pub fn teardown(&mut self) -> Option<SubscriptionHandle> {
        let released = match self.state {
            SubscriptionState::Subscribed { handle, .. } => Some(handle),
            _ => None,
        };
        self.state = SubscriptionState::Unsubscribed;
        self.events = None;
        released
    }

    /// Next queued event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        let events = self.events.as_mut()?;
        match events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.on_closed();
                None
            }
        }
    }

    /// Waits for the next event. Pends forever while unsubscribed; returns
    /// `None` once when the feed closes underneath us.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        match events.recv().await {
            Some(event) => Some(event),
            None => {
                self.on_closed();
                None
            }
        }
    }

    fn on_closed(&mut self) {
        if let SubscriptionState::Subscribed { channel_id, handle } = self.state {
            warn!("Change feed for channel {} closed ({})", channel_id, handle);
        }
        self.state = SubscriptionState::Unsubscribed;
        self.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(channel_id: Uuid) -> (Subscription, mpsc::UnboundedSender<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Subscription {
                handle: SubscriptionHandle::new(),
                filter: FeedFilter::Channel(channel_id),
                events: rx,
            },
            tx,
        )
    }

    fn delete(id: i64) -> ChangeEvent {
        ChangeEvent::Delete { id, channel_id: None }
    }

    #[test]
    fn begin_then_ack_subscribes() {
        let channel = Uuid::new_v4();
        let mut feed = ChannelFeed::new();
        assert_eq!(feed.begin(channel), None);
        assert_eq!(feed.state(), SubscriptionState::Subscribing { channel_id: channel });

        let (sub, _tx) = subscription(channel);
        let handle = sub.handle;
        feed.acknowledge(sub).unwrap();
        assert_eq!(feed.state(), SubscriptionState::Subscribed { channel_id: channel, handle });
    }

    #[test]
    fn switching_releases_previous_handle() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut feed = ChannelFeed::new();
        feed.begin(a);
        let (sub_a, tx_a) = subscription(a);
        let handle_a = sub_a.handle;
        feed.acknowledge(sub_a).unwrap();

        assert_eq!(feed.begin(b), Some(handle_a));
        let (sub_b, _tx_b) = subscription(b);
        feed.acknowledge(sub_b).unwrap();

        // Events pushed to the old queue are gone with it.
        assert!(tx_a.send(delete(1)).is_err());
        assert_eq!(feed.state().channel_id(), Some(b));
    }

    #[test]
    fn stale_ack_is_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut feed = ChannelFeed::new();
        feed.begin(b);
        let (sub_a, _tx) = subscription(a);
        let stale = sub_a.handle;
        assert_eq!(feed.acknowledge(sub_a), Err(stale));
        assert_eq!(feed.state(), SubscriptionState::Subscribing { channel_id: b });
    }

    #[test]
    fn ack_without_begin_is_rejected() {
        let mut feed = ChannelFeed::new();
        let (sub, _tx) = subscription(Uuid::new_v4());
        assert!(feed.acknowledge(sub).is_err());
        assert_eq!(feed.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn fail_returns_to_unsubscribed() {
        let mut feed = ChannelFeed::new();
        feed.begin(Uuid::new_v4());
        feed.fail();
        assert_eq!(feed.state(), SubscriptionState::Unsubscribed);
        assert_eq!(feed.teardown(), None);
    }

    #[test]
    fn try_next_drains_queue_and_detects_close() {
        let channel = Uuid::new_v4();
        let mut feed = ChannelFeed::new();
        feed.begin(channel);
        let (sub, tx) = subscription(channel);
        feed.acknowledge(sub).unwrap();

        tx.send(delete(1)).unwrap();
        tx.send(delete(2)).unwrap();
        assert_eq!(feed.try_next(), Some(delete(1)));
        assert_eq!(feed.try_next(), Some(delete(2)));
        assert_eq!(feed.try_next(), None);
        assert!(feed.state().is_subscribed());

        drop(tx);
        assert_eq!(feed.try_next(), None);
        assert_eq!(feed.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn next_returns_none_when_feed_closes() {
        let channel = Uuid::new_v4();
        let mut feed = ChannelFeed::new();
        feed.begin(channel);
        let (sub, tx) = subscription(channel);
        feed.acknowledge(sub).unwrap();

        tx.send(delete(4)).unwrap();
        drop(tx);
        assert_eq!(feed.next().await, Some(delete(4)));
        assert_eq!(feed.next().await, None);
        assert_eq!(feed.state(), SubscriptionState::Unsubscribed);
    }
}
