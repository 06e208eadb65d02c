//! Realtime change feed over the backend's websocket channel protocol.
//!
//! DESIGN
//! ======
//! One socket per subscription. A worker task joins a channel configured for
//! `postgres_changes` on one relation with one equality filter, forwards every
//! change notification as a [`ChangeEvent`], and keeps the socket alive with
//! a heartbeat. `subscribe` resolves once the first join is acknowledged so
//! a bad filter or rejected token surfaces to the caller.
//!
//! The access token comes from a `watch` channel owned by the session. Every
//! join reads the current token, and a token change on a live socket is
//! pushed to the channel with an `access_token` message.
//!
//! ERROR HANDLING
//! ==============
//! After the first join, connection failures are logged and retried with
//! exponential backoff plus jitter; the subscriber only sees a gap in events.
//! The worker exits when the [`Subscription`] is dropped.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{BackendError, ChangeEvent, ChangeKind, Relation, RowFilter, Subscription};

const PROTOCOL_VERSION: &str = "1.0.0";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;

// =============================================================================
// CLIENT
// =============================================================================

/// Opens change-feed subscriptions against one project.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    socket_url: String,
}

impl RealtimeClient {
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if `base_url` is not http(s).
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self, BackendError> {
        Ok(Self { socket_url: websocket_url(base_url, anon_key)? })
    }

    #[must_use]
    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }

    /// Join a change channel and return once the backend acknowledged it.
    /// `tokens` yields the access token to join with, now and on reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Realtime`] if the socket cannot connect, the
    /// join is rejected, or no acknowledgement arrives in time.
    pub async fn subscribe(
        &self,
        relation: Relation,
        filter: RowFilter,
        tokens: watch::Receiver<String>,
    ) -> Result<Subscription, BackendError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let channel = ChannelSpec { topic: channel_topic(relation), relation, filter };
        let worker = tokio::spawn(run_channel(self.socket_url.clone(), channel, tokens, tx, ready_tx));

        match tokio::time::timeout(JOIN_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Subscription::new(rx, Some(worker))),
            Ok(Ok(Err(e))) => {
                worker.abort();
                Err(e)
            }
            Ok(Err(_)) => {
                worker.abort();
                Err(BackendError::Realtime("channel worker exited before join".into()))
            }
            Err(_) => {
                worker.abort();
                Err(BackendError::Realtime(format!("join not acknowledged within {}s", JOIN_TIMEOUT.as_secs())))
            }
        }
    }
}

/// Convert the project base URL into the realtime socket URL.
pub(crate) fn websocket_url(base_url: &str, anon_key: &str) -> Result<String, BackendError> {
    let trimmed = base_url.trim_end_matches('/');
    let path = format!("realtime/v1/websocket?apikey={anon_key}&vsn={PROTOCOL_VERSION}");

    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/{path}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/{path}"));
    }

    Err(BackendError::Config(format!("invalid base URL: {base_url}")))
}

fn channel_topic(relation: Relation) -> String {
    format!("realtime:{}-changes", relation.table_name())
}

// =============================================================================
// WIRE MESSAGES
// =============================================================================

#[derive(Debug, Clone)]
struct ChannelSpec {
    topic: String,
    relation: Relation,
    filter: RowFilter,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

fn join_message(channel: &ChannelSpec, access_token: &str, msg_ref: u64) -> WireMessage {
    WireMessage {
        topic: channel.topic.clone(),
        event: "phx_join".into(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": channel.relation.table_name(),
                    "filter": channel.filter.to_string(),
                }],
            },
            "access_token": access_token,
        }),
        msg_ref: Some(msg_ref.to_string()),
    }
}

fn access_token_message(topic: &str, access_token: &str, msg_ref: u64) -> WireMessage {
    WireMessage {
        topic: topic.to_string(),
        event: "access_token".into(),
        payload: json!({ "access_token": access_token }),
        msg_ref: Some(msg_ref.to_string()),
    }
}

fn heartbeat_message(msg_ref: u64) -> WireMessage {
    WireMessage {
        topic: "phoenix".into(),
        event: "heartbeat".into(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
    }
}

fn leave_message(topic: &str, msg_ref: u64) -> WireMessage {
    WireMessage { topic: topic.to_string(), event: "phx_leave".into(), payload: json!({}), msg_ref: Some(msg_ref.to_string()) }
}

/// What an incoming socket message means for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Incoming {
    Change(ChangeKind),
    Reply { msg_ref: Option<String>, ok: bool, reason: Option<String> },
    ChannelError(String),
    ChannelClosed,
    Ignored,
}

fn parse_incoming(text: &str, topic: &str) -> Result<Incoming, BackendError> {
    let msg: WireMessage = serde_json::from_str(text)?;
    if msg.topic != topic {
        return Ok(Incoming::Ignored);
    }

    let incoming = match msg.event.as_str() {
        "postgres_changes" => msg
            .payload
            .pointer("/data/type")
            .and_then(Value::as_str)
            .and_then(ChangeKind::from_wire)
            .map_or(Incoming::Ignored, Incoming::Change),
        "phx_reply" => {
            let ok = msg.payload.get("status").and_then(Value::as_str) == Some("ok");
            let reason = msg
                .payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            Incoming::Reply { msg_ref: msg.msg_ref, ok, reason }
        }
        "phx_error" => Incoming::ChannelError(msg.payload.to_string()),
        "phx_close" => Incoming::ChannelClosed,
        _ => Incoming::Ignored,
    };
    Ok(incoming)
}

fn encode(msg: &WireMessage) -> Result<Message, BackendError> {
    Ok(Message::Text(serde_json::to_string(msg)?.into()))
}

// =============================================================================
// WORKER
// =============================================================================

enum ConnectionEnd {
    /// The subscription was dropped; stop for good.
    SubscriberGone,
    /// The socket or channel closed after a healthy session; reconnect.
    Closed,
}

type ReadySender = oneshot::Sender<Result<(), BackendError>>;

async fn run_channel(
    socket_url: String,
    channel: ChannelSpec,
    mut tokens: watch::Receiver<String>,
    tx: mpsc::Sender<ChangeEvent>,
    ready: ReadySender,
) {
    let mut ready = Some(ready);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match run_connection(&socket_url, &channel, &mut tokens, &tx, &mut ready).await {
            Ok(ConnectionEnd::SubscriberGone) => {
                debug!(topic = %channel.topic, "realtime subscriber gone; closing channel");
                return;
            }
            Ok(ConnectionEnd::Closed) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(BackendError::Realtime("socket closed before join".into())));
                    return;
                }
                info!(topic = %channel.topic, "realtime channel closed; reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                    return;
                }
                warn!(error = %e, topic = %channel.topic, backoff_ms = backoff.as_millis(), "realtime connection failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(with_jitter(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_connection(
    socket_url: &str,
    channel: &ChannelSpec,
    tokens: &mut watch::Receiver<String>,
    tx: &mpsc::Sender<ChangeEvent>,
    ready: &mut Option<ReadySender>,
) -> Result<ConnectionEnd, BackendError> {
    let (mut ws, _) = connect_async(socket_url)
        .await
        .map_err(|e| BackendError::Realtime(format!("connect failed: {e}")))?;

    let mut next_ref: u64 = 1;
    let join_ref = next_ref.to_string();
    let access_token = tokens.borrow_and_update().clone();
    ws.send(encode(&join_message(channel, &access_token, next_ref))?)
        .await
        .map_err(|e| BackendError::Realtime(e.to_string()))?;

    let mut heartbeat = tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // False once the session side is gone; the last token stays in use.
    let mut tokens_open = true;

    loop {
        tokio::select! {
            () = tx.closed() => {
                next_ref += 1;
                if let Ok(leave) = encode(&leave_message(&channel.topic, next_ref)) {
                    let _ = ws.send(leave).await;
                }
                let _ = ws.close(None).await;
                return Ok(ConnectionEnd::SubscriberGone);
            }
            changed = tokens.changed(), if tokens_open => {
                if changed.is_err() {
                    tokens_open = false;
                    continue;
                }
                let access_token = tokens.borrow_and_update().clone();
                next_ref += 1;
                ws.send(encode(&access_token_message(&channel.topic, &access_token, next_ref))?)
                    .await
                    .map_err(|e| BackendError::Realtime(e.to_string()))?;
                debug!(topic = %channel.topic, "realtime access token updated");
            }
            _ = heartbeat.tick() => {
                next_ref += 1;
                ws.send(encode(&heartbeat_message(next_ref))?)
                    .await
                    .map_err(|e| BackendError::Realtime(e.to_string()))?;
            }
            incoming = ws.next() => {
                let Some(msg) = incoming else {
                    return Ok(ConnectionEnd::Closed);
                };
                let text = match msg.map_err(|e| BackendError::Realtime(e.to_string()))? {
                    Message::Text(text) => text,
                    Message::Close(_) => return Ok(ConnectionEnd::Closed),
                    _ => continue,
                };
                let incoming = match parse_incoming(text.as_str(), &channel.topic) {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        warn!(error = %e, topic = %channel.topic, "skipping unparseable realtime frame");
                        continue;
                    }
                };
                match incoming {
                    Incoming::Change(kind) => {
                        if tx.send(ChangeEvent { relation: channel.relation, kind }).await.is_err() {
                            return Ok(ConnectionEnd::SubscriberGone);
                        }
                    }
                    Incoming::Reply { msg_ref, ok, reason } if msg_ref.as_deref() == Some(join_ref.as_str()) => {
                        if !ok {
                            let reason = reason.unwrap_or_else(|| "unknown".into());
                            return Err(BackendError::Realtime(format!("join rejected: {reason}")));
                        }
                        debug!(topic = %channel.topic, filter = %channel.filter, "realtime channel joined");
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                    }
                    Incoming::ChannelError(detail) => {
                        return Err(BackendError::Realtime(format!("channel error: {detail}")));
                    }
                    Incoming::ChannelClosed => return Ok(ConnectionEnd::Closed),
                    Incoming::Reply { .. } | Incoming::Ignored => {}
                }
            }
        }
    }
}

fn with_jitter(base: Duration) -> Duration {
    let max_jitter_ms = u64::try_from(base.as_millis() / 4).unwrap_or(0);
    if max_jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=max_jitter_ms))
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
