//! Websocket-backed relay client.
//!
//! Speaks a small JSON frame protocol to a relay server that fans
//! published payloads out to current channel subscribers. The relay
//! guarantees at-most-once delivery per subscriber and preserves order
//! only within one channel; the negotiation logic is built around exactly
//! that contract, so this client adds nothing on top.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use relay_bus::{Relay, RelayError, RelayMessage, RelayResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { channel: String },
    Publish { channel: String, payload: String },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Message { channel: String, payload: String },
    Pong,
}

type ChannelMap = HashMap<String, broadcast::Sender<RelayMessage>>;

pub struct WsRelay {
    out: mpsc::UnboundedSender<ClientFrame>,
    channels: Arc<parking_lot::RwLock<ChannelMap>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsRelay {
    /// Opens the websocket session. Failure here is fatal to
    /// registration: it is surfaced to the caller and never retried.
    pub async fn connect(relay_url: &str) -> Result<Arc<Self>, RelayError> {
        let url = Url::parse(relay_url)
            .map_err(|err| RelayError::Transport(format!("bad relay url: {err}")))?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RelayError::Transport(format!("websocket connect failed: {err}")))?;
        debug!(target = "parley::relay", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let channels: Arc<parking_lot::RwLock<ChannelMap>> = Arc::default();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let channels_for_reader = Arc::clone(&channels);
        let reader = tokio::spawn(async move {
            while let Some(incoming) = ws_read.next().await {
                let text = match incoming {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(target = "parley::relay", error = %err, "relay websocket error");
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Message { channel, payload }) => {
                        trace!(target = "parley::relay", channel = %channel, "relay delivery");
                        let sender = channels_for_reader.read().get(&channel).cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(RelayMessage {
                                channel,
                                payload: Bytes::from(payload.into_bytes()),
                            });
                        }
                    }
                    Ok(ServerFrame::Pong) => {}
                    Err(err) => {
                        warn!(
                            target = "parley::relay",
                            error = %err,
                            "rejecting malformed relay frame"
                        );
                    }
                }
            }
            debug!(target = "parley::relay", "relay websocket closed");
        });

        let heartbeat_out = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if heartbeat_out.send(ClientFrame::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(WsRelay {
            out: out_tx,
            channels,
            tasks: parking_lot::Mutex::new(vec![writer, reader, heartbeat]),
        }))
    }
}

impl Relay for WsRelay {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<RelayMessage> {
        let mut guard = self.channels.write();
        match guard.get(channel) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(64);
                guard.insert(channel.to_string(), sender);
                // First local subscriber for this address; tell the
                // server to start forwarding it.
                let _ = self.out.send(ClientFrame::Subscribe {
                    channel: channel.to_string(),
                });
                receiver
            }
        }
    }

    fn publish(&self, channel: &str, payload: Bytes) -> RelayResult<()> {
        let payload = String::from_utf8(payload.to_vec())
            .map_err(|err| RelayError::Transport(format!("non-utf8 payload: {err}")))?;
        self.out
            .send(ClientFrame::Publish {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| RelayError::Closed)
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_as_tagged_json() {
        let frame = ClientFrame::Publish {
            channel: "user/bob/call".into(),
            payload: "{}".into(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).expect("encode")).expect("json");
        assert_eq!(value["type"], "publish");
        assert_eq!(value["channel"], "user/bob/call");

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"message","channel":"c","payload":"p"}"#)
                .expect("decode");
        assert!(matches!(frame, ServerFrame::Message { .. }));
    }
}
