use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::User;

// -- JWT Claims --

/// Claims carried by the backend's access token. Only `sub` is relied on;
/// the rest is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Serialize)]
pub struct PasswordSignIn {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: User,
}

// -- Channels --

#[derive(Debug, Serialize)]
pub struct NewChannel {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct NewMembership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MembershipRow {
    pub channel_id: Uuid,
}

// -- Messages --

#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessagePatch {
    pub message: String,
}

// -- Errors --

/// Error body returned by the REST and auth APIs. The two services disagree
/// on field names, so every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ApiErrorBody {
    /// The most human-readable message present.
    pub fn summary(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
    }
}
