//! WebSocket bridge transport for the Web channel.
//!
//! The channel's proprietary socket protocol terminates in a sidecar
//! process; this transport speaks a small JSON frame protocol with it over
//! one WebSocket per bot (`<bridge_url>/session/<bot_id>`). Credential
//! material flows both ways: we hand the sidecar the persisted blob on
//! connect, and it streams refreshed material back for persistence, keeping
//! credential custody (and logout wipes) on this side.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::transport::{SessionEvent, SessionLink, SessionSocket, SessionTransport};
use crate::channels::IncomingMessage;

const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(30);

// ── Frame protocol ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand {
    /// First frame after connect; resumes from persisted credentials.
    Init {
        credentials: Option<serde_json::Value>,
    },
    Send {
        tag: u64,
        to: String,
        body: String,
    },
    Logout,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Qr {
        payload: String,
    },
    Open {
        phone: String,
    },
    Credentials {
        data: serde_json::Value,
    },
    Message {
        from: String,
        id: String,
        timestamp: i64,
        text: String,
        #[serde(default)]
        push_name: Option<String>,
    },
    /// Ack for a `Send`; `message_ref` is null on provider-reported failure.
    Sent {
        tag: u64,
        #[serde(default)]
        message_ref: Option<String>,
    },
    Closed {
        #[serde(default)]
        logout: bool,
    },
}

// ── Transport ─────────────────────────────────────────────────────

pub struct BridgeTransport {
    url: String,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

type PendingSends = Arc<Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>>;

#[async_trait]
impl SessionTransport for BridgeTransport {
    async fn connect(
        &self,
        bot_id: &str,
        credentials: Option<serde_json::Value>,
    ) -> anyhow::Result<SessionLink> {
        let url = format!("{}/session/{}", self.url, bot_id);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws.split();

        let init = serde_json::to_string(&BridgeCommand::Init { credentials })?;
        write.send(Message::Text(init.into())).await?;

        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(64);
        let (command_tx, mut command_rx) = mpsc::channel::<BridgeCommand>(16);
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));

        // Writer: drains the command queue into the socket. Ends when the
        // socket handle is dropped or close() is called.
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let frame = match serde_json::to_string(&command) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Bridge command serialization failed: {e}");
                        continue;
                    }
                };
                if write.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Reader: maps bridge frames to session events. Dropping `event_tx`
        // at the end reads as connection loss to the session manager.
        let reader_pending = pending.clone();
        let reader_bot = bot_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(bot_id = reader_bot, "Bridge socket error: {e}");
                        break;
                    }
                };
                let parsed: BridgeFrame = match serde_json::from_str(&frame) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(bot_id = reader_bot, "Unparseable bridge frame: {e}");
                        continue;
                    }
                };

                let event = match parsed {
                    BridgeFrame::Qr { payload } => SessionEvent::Qr(payload),
                    BridgeFrame::Open { phone } => SessionEvent::Open { phone },
                    BridgeFrame::Credentials { data } => SessionEvent::Credentials(data),
                    BridgeFrame::Message {
                        from,
                        id,
                        timestamp,
                        text,
                        push_name,
                    } => SessionEvent::Message(IncomingMessage {
                        from,
                        channel_ref: id,
                        timestamp,
                        text,
                        contact_name: push_name,
                        routing_id: reader_bot.clone(),
                    }),
                    BridgeFrame::Sent { tag, message_ref } => {
                        if let Some(ack) = reader_pending.lock().remove(&tag) {
                            let _ = ack.send(message_ref);
                        }
                        continue;
                    }
                    BridgeFrame::Closed { logout } => {
                        let _ = event_tx.send(SessionEvent::Closed { logout }).await;
                        break;
                    }
                };

                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(SessionLink {
            events: event_rx,
            socket: Arc::new(BridgeSocket {
                command_tx,
                pending,
                next_tag: AtomicU64::new(1),
            }),
        })
    }
}

struct BridgeSocket {
    command_tx: mpsc::Sender<BridgeCommand>,
    pending: PendingSends,
    next_tag: AtomicU64,
}

#[async_trait]
impl SessionSocket for BridgeSocket {
    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<Option<String>> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().insert(tag, ack_tx);

        let command = BridgeCommand::Send {
            tag,
            to: to.to_string(),
            body: body.to_string(),
        };
        if self.command_tx.send(command).await.is_err() {
            self.pending.lock().remove(&tag);
            anyhow::bail!("bridge socket is gone");
        }

        match tokio::time::timeout(SEND_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(message_ref)) => Ok(message_ref),
            Ok(Err(_)) => {
                anyhow::bail!("bridge dropped the send ack")
            }
            Err(_) => {
                self.pending.lock().remove(&tag);
                anyhow::bail!("bridge send ack timed out")
            }
        }
    }

    async fn logout(&self) {
        if self.command_tx.send(BridgeCommand::Logout).await.is_err() {
            debug!("Bridge socket already gone at logout");
        }
    }

    async fn close(&self) {
        // Dropping all command senders ends the writer task, which closes
        // the socket. Nothing to do beyond signalling.
    }
}
