//! `GET /api/realtime` - WebSocket stream of listing and business mutations.
//!
//! Server messages are JSON objects tagged by `type`: `listing` and `business`
//! carry a mutation event, `heartbeat` is sent on a fixed interval, and
//! `resync` tells a client that fell behind to re-run discovery before the
//! connection is closed.

use crate::{
    core::fanout::{FanoutMessage, Topic},
    marketplace::Marketplace,
};
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Query string of the realtime endpoint
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeQuery {
    /// Restrict the stream to one business
    pub business_id: Option<i64>,
}

/// Control messages sent alongside events
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Heartbeat { at: DateTime<Utc> },
    Resync { missed: u64 },
}

pub(crate) async fn realtime(
    ws: WebSocketUpgrade,
    State(marketplace): State<Marketplace>,
    Query(query): Query<RealtimeQuery>,
) -> Response {
    let topic = query
        .business_id
        .map_or(Topic::AllListings, Topic::Business);
    ws.on_upgrade(move |socket| session(socket, marketplace, topic))
}

async fn session(socket: WebSocket, marketplace: Marketplace, topic: Topic) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription = marketplace.fanout.subscribe(topic);
    info!("Realtime client connected to {:?}", topic);

    let mut heartbeat = tokio::time::interval(marketplace.config.heartbeat_interval());
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = ControlMessage::Heartbeat { at: Utc::now() };
                if send_json(&mut sink, &beat).await.is_err() {
                    break;
                }
            }

            message = subscription.recv() => match message {
                FanoutMessage::Event(event) => {
                    if send_json(&mut sink, event.as_ref()).await.is_err() {
                        break;
                    }
                }
                FanoutMessage::Lagged(missed) => {
                    warn!("Realtime client on {:?} lagged by {} events, asking it to resync", topic, missed);
                    send_resync(&mut sink, topic, missed).await;
                    break;
                }
                FanoutMessage::Closed => break,
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
    debug!("Realtime client on {:?} disconnected", topic);
}

async fn send_json<S, T>(sink: &mut S, value: &T) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    match serde_json::to_string(value) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!("Failed to serialize realtime message: {}", e);
            Ok(())
        }
    }
}

/// Tells a lagging client to re-run discovery. Returns whether the frame was
/// handed to the socket.
async fn send_resync<S>(sink: &mut S, topic: Topic, missed: u64) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match send_json(sink, &ControlMessage::Resync { missed }).await {
        Ok(()) => true,
        Err(e) => {
            debug!(
                "Could not deliver resync to realtime client on {:?}: {}",
                topic, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]
    use super::*;
    use futures::channel::mpsc;

    #[test]
    fn test_control_messages_are_tagged() {
        let json = serde_json::to_value(ControlMessage::Resync { missed: 4 }).unwrap();
        assert_eq!(json["type"], "resync");
        assert_eq!(json["missed"], 4);

        let json = serde_json::to_value(ControlMessage::Heartbeat { at: Utc::now() }).unwrap();
        assert_eq!(json["type"], "heartbeat");
    }

    #[tokio::test]
    async fn test_resync_reaches_connected_client() {
        let (mut sink, mut received) = mpsc::channel::<Message>(4);
        assert!(send_resync(&mut sink, Topic::Business(3), 7).await);

        match received.next().await {
            Some(Message::Text(text)) => {
                let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(json["type"], "resync");
                assert_eq!(json["missed"], 7);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resync_to_gone_client_is_reported() {
        let (mut sink, received) = mpsc::channel::<Message>(4);
        drop(received);
        assert!(!send_resync(&mut sink, Topic::AllListings, 1).await);
    }
}
