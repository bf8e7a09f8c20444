//! Change-feed client for the hosted realtime service.
//!
//! One websocket carries every subscription. Each subscription joins its own
//! topic; the connection task routes `postgres_changes` frames for a topic
//! into that subscription's queue through the [`Dispatcher`]. The task never
//! touches view state. When the socket goes away every queue is closed, which
//! is how views learn their feed is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use huddle_types::{ChangeEvent, ChangeKind, FeedFilter, MessageId};

use crate::backend::{Subscription, SubscriptionHandle};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, Result};

const MESSAGES_TABLE: &str = "messages";
/// Unanswered heartbeats tolerated before the socket is dropped.
const MAX_MISSED_HEARTBEATS: u8 = 2;

/// One Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// What a delete carries: the primary key, plus the channel when the table
/// publishes full old rows.
#[derive(Debug, Deserialize)]
struct DeletedRow {
    id: MessageId,
    #[serde(default)]
    channel_id: Option<Uuid>,
}

enum Command {
    Join {
        handle: SubscriptionHandle,
        filter: FeedFilter,
        access_token: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        handle: SubscriptionHandle,
    },
    Shutdown,
}

pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Dispatcher,
    connected: Arc<AtomicBool>,
    access_token: RwLock<Option<String>>,
    join_timeout: Duration,
}

impl RealtimeClient {
    pub async fn connect(config: &ClientConfig, access_token: Option<String>) -> Result<Self> {
        let url = config.realtime_url()?;
        let (ws, _) = connect_async(url.as_str()).await?;
        info!("Connected to realtime at {}", config.project_url);
        Ok(Self::from_stream(ws, config, access_token))
    }

    /// Runs the protocol over an already-open websocket. Must be called
    /// inside a tokio runtime.
    pub fn from_stream<S>(ws: WebSocketStream<S>, config: &ClientConfig, access_token: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new();
        let connected = Arc::new(AtomicBool::new(true));

        let connection = Connection {
            dispatcher: dispatcher.clone(),
            connected: connected.clone(),
            heartbeat_interval: config.heartbeat_interval,
            next_ref: 0,
            topics: HashMap::new(),
            handles: HashMap::new(),
            joins: HashMap::new(),
            heartbeat_ref: None,
        };
        tokio::spawn(connection.run(ws, rx));

        Self {
            commands,
            dispatcher,
            connected,
            access_token: RwLock::new(access_token),
            join_timeout: config.request_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Token sent with later joins. Existing subscriptions keep theirs.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Joins a topic for `filter` and waits for the server to accept it.
    pub async fn subscribe(&self, filter: FeedFilter) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(ClientError::Realtime("not connected".into()));
        }

        let handle = SubscriptionHandle::new();
        // Registered before the join so nothing sent right after the reply is lost.
        let subscription = self.dispatcher.register_with(handle, filter);
        let access_token = self.access_token.read().unwrap_or_else(|e| e.into_inner()).clone();
        let (reply, reply_rx) = oneshot::channel();

        let sent = self.commands.send(Command::Join {
            handle,
            filter,
            access_token,
            reply,
        });
        if sent.is_err() {
            self.dispatcher.unregister(handle);
            return Err(ClientError::Realtime("connection closed".into()));
        }

        let result = match tokio::time::timeout(self.join_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Realtime("connection closed".into())),
            Err(_) => Err(ClientError::Realtime("timed out waiting for subscription".into())),
        };

        match result {
            Ok(()) => {
                info!("Subscribed {} to {:?}", handle, filter);
                Ok(subscription)
            }
            Err(e) => {
                self.unsubscribe(handle);
                Err(e)
            }
        }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.dispatcher.unregister(handle);
        let _ = self.commands.send(Command::Leave { handle });
    }

    pub fn open_subscriptions(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct PendingJoin {
    handle: SubscriptionHandle,
    reply: oneshot::Sender<Result<()>>,
}

enum Step {
    Send(Frame),
    Close,
    Idle,
}

/// State owned by the socket task.
struct Connection {
    dispatcher: Dispatcher,
    connected: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    next_ref: u64,
    /// topic -> subscription
    topics: HashMap<String, SubscriptionHandle>,
    handles: HashMap<SubscriptionHandle, String>,
    /// join ref -> waiting subscriber
    joins: HashMap<String, PendingJoin>,
    heartbeat_ref: Option<String>,
}

impl Connection {
    async fn run<S>(mut self, ws: WebSocketStream<S>, mut commands: mpsc::UnboundedReceiver<Command>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match self.on_command(cmd) {
                        Step::Send(frame) => {
                            if let Err(e) = send_frame(&mut sink, &frame).await {
                                warn!("Realtime send failed: {}", e);
                                break;
                            }
                        }
                        Step::Close => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            info!("Realtime connection closed by client");
                            break;
                        }
                        Step::Idle => {}
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.on_text(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!("Realtime connection closed by server: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Realtime connection error: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if self.heartbeat_ref.is_some() {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                            warn!("Heartbeat timeout (missed {} replies), dropping connection", missed_heartbeats);
                            break;
                        }
                    } else {
                        missed_heartbeats = 0;
                    }
                    let frame = self.heartbeat();
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn on_command(&mut self, cmd: Command) -> Step {
        match cmd {
            Command::Join {
                handle,
                filter,
                access_token,
                reply,
            } => {
                let topic = format!("realtime:huddle-{}", handle);
                let reference = self.make_ref();
                debug!("Joining {} for {:?}", topic, filter);
                self.topics.insert(topic.clone(), handle);
                self.handles.insert(handle, topic.clone());
                self.joins.insert(reference.clone(), PendingJoin { handle, reply });
                Step::Send(Frame {
                    topic,
                    event: "phx_join".into(),
                    payload: join_payload(filter, access_token.as_deref()),
                    reference: Some(reference.clone()),
                    join_ref: Some(reference),
                })
            }
            Command::Leave { handle } => {
                self.joins.retain(|_, join| join.handle != handle);
                let Some(topic) = self.handles.remove(&handle) else {
                    return Step::Idle;
                };
                self.topics.remove(&topic);
                debug!("Leaving {}", topic);
                Step::Send(Frame {
                    topic,
                    event: "phx_leave".into(),
                    payload: json!({}),
                    reference: Some(self.make_ref()),
                    join_ref: None,
                })
            }
            Command::Shutdown => Step::Close,
        }
    }

    fn on_text(&mut self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid realtime frame: {}", e);
                return;
            }
        };
        trace!("Realtime frame {} on {}", frame.event, frame.topic);

        let event = frame.event.clone();
        match event.as_str() {
            "phx_reply" => self.on_reply(frame),
            "postgres_changes" => {
                let Some(&handle) = self.topics.get(&frame.topic) else {
                    debug!("Change for unknown topic {}", frame.topic);
                    return;
                };
                match decode_change(frame.payload) {
                    Ok(Some(event)) => {
                        self.dispatcher.send_to(handle, event);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping undecodable change on {}: {}", frame.topic, e),
                }
            }
            "phx_error" | "phx_close" => self.drop_topic(&frame.topic, &event),
            "system" => {
                if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                    let reason = frame.payload.get("message").and_then(Value::as_str).unwrap_or("system error");
                    warn!("Realtime rejected {}: {}", frame.topic, reason);
                    self.drop_topic(&frame.topic, reason);
                } else {
                    debug!("Realtime system message on {}: {}", frame.topic, frame.payload);
                }
            }
            _ => {}
        }
    }

    fn on_reply(&mut self, frame: Frame) {
        let Some(reference) = frame.reference else {
            return;
        };
        if self.heartbeat_ref.as_deref() == Some(reference.as_str()) {
            self.heartbeat_ref = None;
            return;
        }
        let Some(join) = self.joins.remove(&reference) else {
            return;
        };

        let status = frame.payload.get("status").and_then(Value::as_str);
        if status == Some("ok") {
            let _ = join.reply.send(Ok(()));
            return;
        }

        let reason = frame
            .payload
            .pointer("/response/reason")
            .and_then(Value::as_str)
            .unwrap_or("subscription rejected")
            .to_string();
        warn!("Join of {} rejected: {}", frame.topic, reason);
        self.topics.remove(&frame.topic);
        self.handles.remove(&join.handle);
        let _ = join.reply.send(Err(ClientError::Realtime(reason)));
    }

    fn drop_topic(&mut self, topic: &str, reason: &str) {
        if let Some(handle) = self.topics.remove(topic) {
            warn!("Subscription {} ended ({})", handle, reason);
            self.handles.remove(&handle);
            self.dispatcher.unregister(handle);
        }
    }

    fn heartbeat(&mut self) -> Frame {
        let reference = self.make_ref();
        self.heartbeat_ref = Some(reference.clone());
        Frame {
            topic: "phoenix".into(),
            event: "heartbeat".into(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn shutdown(&mut self) {
        self.connected.store(false, Ordering::Release);
        for (_, join) in self.joins.drain() {
            let _ = join.reply.send(Err(ClientError::Realtime("connection closed".into())));
        }
        self.topics.clear();
        self.handles.clear();
        self.dispatcher.close_all();
        info!("Realtime connection ended");
    }
}

async fn send_frame<S>(sink: &mut SplitSink<WebSocketStream<S>, WsMessage>, frame: &Frame) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

fn join_payload(filter: FeedFilter, access_token: Option<&str>) -> Value {
    let changes = match filter {
        FeedFilter::Channel(channel_id) => {
            let scoped = format!("channel_id=eq.{}", channel_id);
            json!([
                { "event": "INSERT", "schema": "public", "table": MESSAGES_TABLE, "filter": scoped },
                { "event": "UPDATE", "schema": "public", "table": MESSAGES_TABLE, "filter": scoped },
                // Delete payloads only carry the key, so a channel filter would never match.
                { "event": "DELETE", "schema": "public", "table": MESSAGES_TABLE },
            ])
        }
        FeedFilter::AllInserts => json!([
            { "event": "INSERT", "schema": "public", "table": MESSAGES_TABLE },
        ]),
    };

    let mut payload = json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
            "private": false,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }
    payload
}

/// Turns a `postgres_changes` payload into a change event. Changes to other
/// tables yield `None`.
fn decode_change(payload: Value) -> Result<Option<ChangeEvent>> {
    let ChangePayload { data } = serde_json::from_value(payload)?;
    if data.table.as_deref().is_some_and(|t| t != MESSAGES_TABLE) {
        return Ok(None);
    }

    let event = match data.kind {
        ChangeKind::Insert => ChangeEvent::Insert(serde_json::from_value(data.record.unwrap_or_default())?),
        ChangeKind::Update => ChangeEvent::Update(serde_json::from_value(data.record.unwrap_or_default())?),
        ChangeKind::Delete => {
            let row: DeletedRow = serde_json::from_value(data.old_record.unwrap_or_default())?;
            ChangeEvent::Delete {
                id: row.id,
                channel_id: row.channel_id,
            }
        }
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type ServerSocket = WebSocketStream<DuplexStream>;

    async fn pair(heartbeat: Duration) -> (RealtimeClient, ServerSocket) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut config = ClientConfig::new("http://localhost:54321", "anon").unwrap();
        config.heartbeat_interval = heartbeat;
        config.request_timeout = Duration::from_secs(2);
        (RealtimeClient::from_stream(client_ws, &config, Some("user-token".into())), server_ws)
    }

    async fn recv_frame(server: &mut ServerSocket) -> Frame {
        loop {
            if let WsMessage::Text(text) = server.next().await.unwrap().unwrap() {
                let frame: Frame = serde_json::from_str(text.as_str()).unwrap();
                if frame.event != "heartbeat" {
                    return frame;
                }
            }
        }
    }

    async fn push(server: &mut ServerSocket, value: Value) {
        server.send(WsMessage::Text(value.to_string().into())).await.unwrap();
    }

    async fn reply(server: &mut ServerSocket, join: &Frame, status: &str, response: Value) {
        push(
            server,
            json!({
                "topic": join.topic,
                "event": "phx_reply",
                "payload": { "status": status, "response": response },
                "ref": join.reference,
                "join_ref": join.join_ref,
            }),
        )
        .await;
    }

    async fn accepted(client: &RealtimeClient, server: &mut ServerSocket, filter: FeedFilter) -> (Subscription, Frame) {
        let (sub, join) = tokio::join!(client.subscribe(filter), async {
            let join = recv_frame(server).await;
            reply(server, &join, "ok", json!({})).await;
            join
        });
        (sub.unwrap(), join)
    }

    #[tokio::test]
    async fn join_carries_channel_filters() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let channel = Uuid::new_v4();
        let (_sub, join) = accepted(&client, &mut server, FeedFilter::Channel(channel)).await;

        assert_eq!(join.event, "phx_join");
        assert!(join.topic.starts_with("realtime:huddle-"));
        assert_eq!(join.payload["access_token"], "user-token");
        let changes = join.payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0]["filter"], format!("channel_id=eq.{}", channel));
        assert!(changes[2].get("filter").is_none());
    }

    #[tokio::test]
    async fn changes_are_routed_to_the_subscription() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let channel = Uuid::new_v4();
        let (mut sub, join) = accepted(&client, &mut server, FeedFilter::Channel(channel)).await;

        push(
            &mut server,
            json!({
                "topic": join.topic,
                "event": "postgres_changes",
                "payload": { "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "schema": "public",
                    "record": {
                        "id": 1,
                        "channel_id": channel,
                        "sender_id": Uuid::nil(),
                        "message": "hi",
                        "created_at": "2024-05-01T10:00:00.123456+00:00"
                    }
                }},
                "ref": null,
            }),
        )
        .await;
        push(
            &mut server,
            json!({
                "topic": join.topic,
                "event": "postgres_changes",
                "payload": { "data": { "type": "DELETE", "table": "messages", "old_record": { "id": 1 } } },
                "ref": null,
            }),
        )
        .await;

        match sub.events.recv().await.unwrap() {
            ChangeEvent::Insert(msg) => {
                assert_eq!(msg.id, 1);
                assert_eq!(msg.message, "hi");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sub.events.recv().await.unwrap(), ChangeEvent::Delete { id: 1, channel_id: None });
    }

    #[tokio::test]
    async fn rejected_join_is_an_error() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let (result, _) = tokio::join!(client.subscribe(FeedFilter::AllInserts), async {
            let join = recv_frame(&mut server).await;
            reply(&mut server, &join, "error", json!({ "reason": "invalid filter" })).await;
        });
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "realtime error: invalid filter");
        assert_eq!(client.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_topic_and_closes_queue() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let (mut sub, join) = accepted(&client, &mut server, FeedFilter::AllInserts).await;

        client.unsubscribe(sub.handle);
        let leave = recv_frame(&mut server).await;
        assert_eq!(leave.event, "phx_leave");
        assert_eq!(leave.topic, join.topic);
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_error_ends_subscription() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let (mut sub, join) = accepted(&client, &mut server, FeedFilter::AllInserts).await;
        push(&mut server, json!({ "topic": join.topic, "event": "phx_error", "payload": {}, "ref": null })).await;
        assert!(sub.events.recv().await.is_none());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn dropped_socket_closes_every_queue() {
        let (client, mut server) = pair(Duration::from_secs(30)).await;
        let (mut a, _) = accepted(&client, &mut server, FeedFilter::AllInserts).await;
        let (mut b, _) = accepted(&client, &mut server, FeedFilter::Channel(Uuid::new_v4())).await;

        drop(server);
        assert!(a.events.recv().await.is_none());
        assert!(b.events.recv().await.is_none());
        assert!(!client.is_connected());
        assert!(client.subscribe(FeedFilter::AllInserts).await.is_err());
    }

    #[tokio::test]
    async fn unanswered_heartbeats_drop_the_connection() {
        let (client, mut server) = pair(Duration::from_millis(50)).await;
        let (mut sub, _) = accepted(&client, &mut server, FeedFilter::AllInserts).await;
        let closed = tokio::time::timeout(Duration::from_secs(2), sub.events.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[test]
    fn other_tables_are_ignored() {
        let payload = json!({ "data": { "type": "INSERT", "table": "channels", "record": {} } });
        assert!(decode_change(payload).unwrap().is_none());
    }
}
