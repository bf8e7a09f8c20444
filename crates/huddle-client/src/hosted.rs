use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_types::api::{MembershipRow, MessagePatch, NewChannel, NewMembership, NewMessage};
use huddle_types::{Channel, FeedFilter, Message, MessageId, User};

use crate::auth::decode_claims;
use crate::backend::{Backend, Subscription, SubscriptionHandle};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::realtime::RealtimeClient;
use crate::rest::{RestClient, eq};

const CHANNELS: &str = "channels";
const MEMBERS: &str = "channel_members";
const MESSAGES: &str = "messages";
const BY_CREATION: &str = "created_at.asc";

/// The hosted service: tables over REST, the change feed over a websocket.
pub struct HostedBackend {
    rest: RestClient,
    realtime: RealtimeClient,
}

impl HostedBackend {
    /// Signs in with email and password, then opens the change feed with the
    /// resulting token.
    pub async fn connect(config: ClientConfig, email: &str, password: &str) -> Result<Self> {
        let rest = RestClient::new(config)?;
        let session = rest.sign_in_with_password(email, password).await?;

        let claims = decode_claims(&session.access_token)?;
        if claims.sub != session.user.id {
            warn!("Token subject {} does not match user {}", claims.sub, session.user.id);
        }
        info!("Signed in as {} ({})", email, claims.sub);

        let realtime = RealtimeClient::connect(rest.config(), Some(session.access_token.clone())).await?;
        Ok(Self::from_parts(rest, realtime))
    }

    pub fn from_parts(rest: RestClient, realtime: RealtimeClient) -> Self {
        Self { rest, realtime }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }
}

impl Backend for HostedBackend {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.rest.select(CHANNELS, "*", &[], Some(BY_CREATION)).await
    }

    async fn get_channel(&self, channel_id: Uuid) -> Result<Channel> {
        let rows = self.rest.select(CHANNELS, "*", &[eq("id", channel_id)], None).await?;
        single(rows, || format!("channel {}", channel_id))
    }

    async fn create_channel(&self, name: &str) -> Result<Channel> {
        let body = NewChannel { name: name.to_string() };
        let rows = self.rest.insert(CHANNELS, &body).await?;
        single(rows, || format!("channel '{}'", name))
    }

    async fn list_joined_channels(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<MembershipRow> = self
            .rest
            .select(MEMBERS, "channel_id", &[eq("user_id", user_id)], None)
            .await?;
        Ok(rows.into_iter().map(|r| r.channel_id).collect())
    }

    async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> Result<()> {
        let body = NewMembership { channel_id, user_id };
        let _: Vec<Value> = self.rest.insert(MEMBERS, &body).await?;
        Ok(())
    }

    async fn list_messages(&self, channel_id: Uuid) -> Result<Vec<Message>> {
        self.rest
            .select(MESSAGES, "*", &[eq("channel_id", channel_id)], Some(BY_CREATION))
            .await
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let channel_id = new.channel_id;
        let rows = self.rest.insert(MESSAGES, &new).await?;
        single(rows, || format!("new message in {}", channel_id))
    }

    /// An empty representation means row-level security filtered the row out.
    async fn update_message(&self, id: MessageId, body: &str) -> Result<Message> {
        let patch = MessagePatch { message: body.to_string() };
        let rows = self.rest.update(MESSAGES, &[eq("id", id)], &patch).await?;
        single(rows, || format!("message {}", id))
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        let rows: Vec<Value> = self.rest.delete(MESSAGES, &[eq("id", id)]).await?;
        single(rows, || format!("message {}", id)).map(|_| ())
    }

    async fn current_user(&self) -> Result<User> {
        self.rest.get_user().await
    }

    /// Nothing is torn down unless the server accepted the logout.
    async fn sign_out(&self) -> Result<()> {
        self.rest.logout().await?;
        self.realtime.set_access_token(None);
        self.realtime.disconnect();
        Ok(())
    }

    async fn subscribe(&self, filter: FeedFilter) -> Result<Subscription> {
        self.realtime.subscribe(filter).await
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.realtime.unsubscribe(handle);
    }
}

/// The one row a representation should hold.
fn single<T>(rows: Vec<T>, what: impl FnOnce() -> String) -> Result<T> {
    rows.into_iter().next().ok_or_else(|| ClientError::NotFound(what()))
}
