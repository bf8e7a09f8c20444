pub mod api;
pub mod events;
pub mod models;

pub use events::{ChangeEvent, ChangeKind, FeedFilter};
pub use models::{Channel, Membership, Message, MessageId, User};
