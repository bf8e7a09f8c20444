//! Client-side message synchronisation for Huddle channels.
//!
//! A [`ChannelSession`] keeps the selected channel's message list consistent
//! with the backend: one bulk fetch, then row-level changes from the feed.
//! [`ChannelDirectory`] keeps the channel list and unread counts.

pub mod auth;
pub mod backend;
pub mod channel_session;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod hosted;
pub mod memory;
pub mod mutation;
pub mod realtime;
pub mod rest;
pub mod session;
pub mod store;
pub mod subscription;

pub use backend::{Backend, Subscription, SubscriptionHandle};
pub use channel_session::{Activation, ChannelSession, LoadState, ViewSignal};
pub use config::ClientConfig;
pub use directory::ChannelDirectory;
pub use error::{ClientError, Result};
pub use hosted::HostedBackend;
pub use memory::{MemoryBackend, MemoryWorld};
pub use session::Session;
pub use store::{Applied, MessageStore};
pub use subscription::SubscriptionState;
