use thiserror::Error;
use uuid::Uuid;

use huddle_types::MessageId;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Everything that can abort a client operation.
///
/// None of these are retried automatically. Validation and ownership errors
/// are raised before any network call is made.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),

    #[error("no channel selected")]
    NoChannelSelected,

    #[error("channel {0} has not been joined")]
    ChannelNotJoined(Uuid),

    #[error("message {0} belongs to another user")]
    NotOwner(MessageId),

    #[error("{0} not found")]
    NotFound(String),

    #[error("not signed in")]
    NotSignedIn,

    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("realtime error: {0}")]
    Realtime(String),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid access token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the operation was rejected locally without touching the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NoChannelSelected
                | Self::ChannelNotJoined(_)
                | Self::NotOwner(_)
                | Self::Config(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Realtime(e.to_string())
    }
}
