//! The socket seam of the Web channel.
//!
//! The state machine in [`super::SessionManager`] is transport-agnostic: a
//! transport opens one socket per bot and streams [`SessionEvent`]s until
//! the connection dies. Tests drive the machine with scripted transports;
//! the shipping implementation is [`super::bridge::BridgeTransport`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channels::IncomingMessage;

/// Events a session socket can surface.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Pairing challenge; render for the operator to scan.
    Qr(String),
    /// Authenticated and online, bound to this phone identity.
    Open { phone: String },
    /// Refreshed credential material to persist for silent reconnection.
    Credentials(serde_json::Value),
    /// Inbound customer message.
    Message(IncomingMessage),
    /// The socket closed. `logout` marks an explicit device unlink, which
    /// must not reconnect.
    Closed { logout: bool },
}

/// Live link to one bot's socket: the event stream plus a handle for
/// outbound operations.
pub struct SessionLink {
    pub events: mpsc::Receiver<SessionEvent>,
    pub socket: Arc<dyn SessionSocket>,
}

#[async_trait]
pub trait SessionSocket: Send + Sync {
    /// Send a text message to a JID. `Ok(None)` is a provider-reported
    /// failure.
    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<Option<String>>;

    /// Unlink the device. The transport should follow up with a
    /// `Closed { logout: true }` event or simply end the stream.
    async fn logout(&self);

    /// Drop the connection without unlinking.
    async fn close(&self);
}

#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open a socket for `bot_id`, resuming from persisted credential
    /// material when present.
    async fn connect(
        &self,
        bot_id: &str,
        credentials: Option<serde_json::Value>,
    ) -> anyhow::Result<SessionLink>;
}

/// Placeholder transport for deployments without a Web channel. Every
/// connect attempt fails with a configuration hint, driving the state
/// machine straight to its bounded-retry exhaustion.
pub struct UnconfiguredTransport;

#[async_trait]
impl SessionTransport for UnconfiguredTransport {
    async fn connect(
        &self,
        _bot_id: &str,
        _credentials: Option<serde_json::Value>,
    ) -> anyhow::Result<SessionLink> {
        anyhow::bail!(
            "Web channel transport is not configured. Set session.bridge_url in botdesk.toml."
        )
    }
}
