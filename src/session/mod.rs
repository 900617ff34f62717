//! Per-bot Web channel sessions.
//!
//! Each tenant bot owns at most one long-lived, QR-authenticated socket.
//! The state machine is `DISCONNECTED → CONNECTING → AWAITING_SCAN →
//! CONNECTED`, with any state falling back to `DISCONNECTED` on connection
//! loss or explicit logout. Connection loss schedules a reconnect with
//! linearly increasing backoff, bounded at `max_retries`; logout wipes the
//! persisted credential material and never reconnects.
//!
//! The manager is an injected value, not a module global, and only the task
//! chain it spawns for a bot mutates that bot's entry; status reads take the
//! table lock briefly.

pub mod bridge;
pub mod qr;
pub mod transport;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelSender, IncomingMessage};
use crate::config::SessionConfig;
use crate::events::EventBus;
use transport::{SessionEvent, SessionSocket, SessionTransport};

const CREDENTIALS_FILE: &str = "creds.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    AwaitingScan,
    Connected,
}

/// Point-in-time view of a session, as reported to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    /// PNG data URI; present only while awaiting a scan.
    pub qr_code: Option<String>,
    /// Bound phone identity; present only while connected.
    pub phone: Option<String>,
}

impl SessionSnapshot {
    fn disconnected() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            qr_code: None,
            phone: None,
        }
    }
}

/// Inbound message from a Web session, tagged with its owning bot.
#[derive(Debug)]
pub struct SessionInbound {
    pub bot_id: String,
    pub message: IncomingMessage,
}

struct SessionEntry {
    status: SessionStatus,
    qr_code: Option<String>,
    phone: Option<String>,
    retry_count: u32,
    socket: Option<Arc<dyn SessionSocket>>,
    /// Session-lifetime token: cancelling it tears down the event loop and
    /// any pending reconnect deterministically.
    cancel: CancellationToken,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            qr_code: None,
            phone: None,
            retry_count: 0,
            socket: None,
            cancel: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            qr_code: self.qr_code.clone(),
            phone: self.phone.clone(),
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    transport: Arc<dyn SessionTransport>,
    auth_base: PathBuf,
    base_delay: Duration,
    max_retries: u32,
    connect_timeout: Duration,
    bus: Arc<EventBus>,
    inbound_tx: mpsc::Sender<SessionInbound>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        auth_base: PathBuf,
        settings: &SessionConfig,
        bus: Arc<EventBus>,
        inbound_tx: mpsc::Sender<SessionInbound>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            transport,
            auth_base,
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_retries: settings.max_retries,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            bus,
            inbound_tx,
        }
    }

    // ── Operator surface ──────────────────────────────────────────

    /// Idempotent connect. An attempt already in flight (or an open
    /// session) is returned as-is; only a `DISCONNECTED` bot starts a new
    /// attempt.
    pub fn connect(self: &Arc<Self>, bot_id: &str) -> SessionSnapshot {
        self.start_attempt(bot_id, true)
    }

    /// Explicit logout: closes the socket, deletes persisted credentials,
    /// discards the in-memory session, cancels any pending reconnect.
    pub async fn disconnect(&self, bot_id: &str) {
        let socket = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(bot_id) {
                Some(entry) => {
                    entry.cancel.cancel();
                    entry.socket
                }
                None => None,
            }
        };

        if let Some(socket) = socket {
            socket.logout().await;
        }
        self.clear_credentials(bot_id);
        self.bus
            .publish_channel_status(bot_id, SessionStatus::Disconnected, None);
        info!(bot_id, "Web session logged out");
    }

    pub fn status(&self, bot_id: &str) -> SessionSnapshot {
        let sessions = self.sessions.lock();
        sessions
            .get(bot_id)
            .map(SessionEntry::snapshot)
            .unwrap_or_else(SessionSnapshot::disconnected)
    }

    /// Send through the bot's Web session. Rejected (logged, `None`) unless
    /// the session is CONNECTED.
    pub async fn send_text(&self, bot_id: &str, to: &str, body: &str) -> Option<String> {
        let socket = {
            let sessions = self.sessions.lock();
            match sessions.get(bot_id) {
                Some(entry) if entry.status == SessionStatus::Connected => entry.socket.clone(),
                _ => None,
            }
        };
        let Some(socket) = socket else {
            warn!(bot_id, "Web session not connected; dropping outbound send");
            return None;
        };

        let jid = to_jid(to);
        match socket.send_text(&jid, body).await {
            Ok(channel_ref) => channel_ref,
            Err(e) => {
                error!(bot_id, "Web session send failed: {e}");
                None
            }
        }
    }

    /// Startup sweep: best-effort reconnect of every bot with persisted
    /// credential material. Failures are logged, never fatal.
    pub fn resume_saved_sessions(self: &Arc<Self>) -> usize {
        let entries = match std::fs::read_dir(&self.auth_base) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No saved sessions to resume: {e}");
                return 0;
            }
        };

        let mut resumed = 0;
        for entry in entries.flatten() {
            let bot_id = entry.file_name().to_string_lossy().into_owned();
            if !self.has_saved_credentials(&bot_id) {
                continue;
            }
            info!(bot_id, "Resuming saved Web session");
            self.connect(&bot_id);
            resumed += 1;
        }
        resumed
    }

    pub fn has_saved_credentials(&self, bot_id: &str) -> bool {
        self.auth_dir(bot_id).join(CREDENTIALS_FILE).exists()
    }

    // ── State machine internals ───────────────────────────────────

    fn start_attempt(self: &Arc<Self>, bot_id: &str, reset_retries: bool) -> SessionSnapshot {
        let snapshot = {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .entry(bot_id.to_string())
                .or_insert_with(SessionEntry::new);

            match entry.status {
                // Already connected or attempting: no second attempt.
                SessionStatus::Connected
                | SessionStatus::Connecting
                | SessionStatus::AwaitingScan => return entry.snapshot(),
                SessionStatus::Disconnected => {}
            }

            if reset_retries {
                entry.retry_count = 0;
            }
            if entry.cancel.is_cancelled() {
                entry.cancel = CancellationToken::new();
            }
            entry.status = SessionStatus::Connecting;
            entry.qr_code = None;
            entry.phone = None;
            entry.socket = None;
            entry.snapshot()
        };

        self.bus
            .publish_channel_status(bot_id, SessionStatus::Connecting, None);

        let manager = Arc::clone(self);
        let bot = bot_id.to_string();
        let cancel = {
            let sessions = self.sessions.lock();
            sessions
                .get(bot_id)
                .map(|entry| entry.cancel.clone())
                .unwrap_or_default()
        };
        tokio::spawn(async move {
            manager.run_session(bot, cancel).await;
        });

        snapshot
    }

    async fn run_session(self: Arc<Self>, bot_id: String, cancel: CancellationToken) {
        let credentials = self.load_credentials(&bot_id);
        let attempt = self.transport.connect(&bot_id, credentials);

        let link = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = tokio::time::timeout(self.connect_timeout, attempt) => match outcome {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    warn!(bot_id, "Web session connect failed: {e}");
                    self.handle_closed(&bot_id, false);
                    return;
                }
                Err(_) => {
                    warn!(bot_id, "Web session connect timed out");
                    self.handle_closed(&bot_id, false);
                    return;
                }
            },
        };

        {
            let mut sessions = self.sessions.lock();
            if let Some(entry) = sessions.get_mut(&bot_id) {
                entry.socket = Some(link.socket.clone());
            }
        }

        let mut events = link.events;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    link.socket.close().await;
                    return;
                }
                event = events.recv() => match event {
                    None => {
                        // Stream ended without a close frame: connection loss.
                        self.handle_closed(&bot_id, false);
                        return;
                    }
                    Some(SessionEvent::Qr(payload)) => self.handle_qr(&bot_id, &payload),
                    Some(SessionEvent::Open { phone }) => self.handle_open(&bot_id, phone),
                    Some(SessionEvent::Credentials(material)) => {
                        self.persist_credentials(&bot_id, &material);
                    }
                    Some(SessionEvent::Message(message)) => {
                        let inbound = SessionInbound {
                            bot_id: bot_id.clone(),
                            message,
                        };
                        if self.inbound_tx.send(inbound).await.is_err() {
                            error!(bot_id, "Inbound pipeline receiver dropped");
                        }
                    }
                    Some(SessionEvent::Closed { logout }) => {
                        self.handle_closed(&bot_id, logout);
                        return;
                    }
                }
            }
        }
    }

    fn handle_qr(&self, bot_id: &str, payload: &str) {
        let artifact = match qr::to_data_uri(payload) {
            Ok(uri) => uri,
            Err(e) => {
                error!(bot_id, "QR rendering failed: {e}");
                return;
            }
        };

        {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(bot_id) else {
                return;
            };
            entry.status = SessionStatus::AwaitingScan;
            entry.qr_code = Some(artifact.clone());
        }
        info!(bot_id, "QR challenge ready for scan");
        self.bus
            .publish_channel_status(bot_id, SessionStatus::AwaitingScan, Some(artifact));
    }

    fn handle_open(&self, bot_id: &str, phone: String) {
        {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(bot_id) else {
                return;
            };
            entry.status = SessionStatus::Connected;
            entry.qr_code = None;
            entry.phone = Some(phone.clone());
            entry.retry_count = 0;
        }

        // Best-effort record of the bound identity next to the credentials.
        let phone_path = self.auth_dir(bot_id).join("phone");
        if let Err(e) = std::fs::create_dir_all(self.auth_dir(bot_id))
            .and_then(|()| std::fs::write(&phone_path, &phone))
        {
            warn!(bot_id, "Failed to record bound phone: {e}");
        }

        info!(bot_id, phone, "Web session connected");
        self.bus
            .publish_channel_status(bot_id, SessionStatus::Connected, None);
    }

    fn handle_closed(self: &Arc<Self>, bot_id: &str, logout: bool) {
        if logout {
            {
                let mut sessions = self.sessions.lock();
                if let Some(entry) = sessions.remove(bot_id) {
                    entry.cancel.cancel();
                }
            }
            self.clear_credentials(bot_id);
            info!(bot_id, "Web session logged out by the channel");
            self.bus
                .publish_channel_status(bot_id, SessionStatus::Disconnected, None);
            return;
        }

        let retry = {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(bot_id) else {
                // disconnect() already discarded the session.
                return;
            };
            entry.status = SessionStatus::Disconnected;
            entry.qr_code = None;
            entry.phone = None;
            entry.socket = None;

            if entry.retry_count < self.max_retries {
                entry.retry_count += 1;
                Some((entry.retry_count, entry.cancel.clone()))
            } else {
                None
            }
        };

        self.bus
            .publish_channel_status(bot_id, SessionStatus::Disconnected, None);

        match retry {
            Some((attempt, cancel)) => {
                let delay = self.base_delay * attempt;
                info!(
                    bot_id,
                    attempt, "Web session closed; reconnecting in {delay:?}"
                );
                let manager = Arc::clone(self);
                let bot = bot_id.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            manager.start_attempt(&bot, false);
                        }
                    }
                });
            }
            None => {
                warn!(
                    bot_id,
                    "Web session retry budget exhausted; operator must reconnect"
                );
            }
        }
    }

    // ── Credential material ───────────────────────────────────────

    fn auth_dir(&self, bot_id: &str) -> PathBuf {
        self.auth_base.join(bot_id)
    }

    fn load_credentials(&self, bot_id: &str) -> Option<serde_json::Value> {
        let path = self.auth_dir(bot_id).join(CREDENTIALS_FILE);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(bot_id, "Ignoring unreadable credential material: {e}");
                None
            }
        }
    }

    fn persist_credentials(&self, bot_id: &str, material: &serde_json::Value) {
        let dir = self.auth_dir(bot_id);
        let write = std::fs::create_dir_all(&dir).and_then(|()| {
            let raw = serde_json::to_vec(material).unwrap_or_default();
            std::fs::write(dir.join(CREDENTIALS_FILE), raw)
        });
        if let Err(e) = write {
            error!(bot_id, "Failed to persist session credentials: {e}");
        }
    }

    fn clear_credentials(&self, bot_id: &str) {
        let dir = self.auth_dir(bot_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                error!(bot_id, "Failed to clear session credentials: {e}");
            }
        }
    }
}

fn to_jid(recipient: &str) -> String {
    if recipient.contains('@') {
        recipient.to_string()
    } else {
        format!("{recipient}@s.whatsapp.net")
    }
}

/// [`ChannelSender`] view of one bot's Web session, for the pipeline.
pub struct SessionSender {
    manager: Arc<SessionManager>,
    bot_id: String,
}

impl SessionSender {
    pub fn new(manager: Arc<SessionManager>, bot_id: impl Into<String>) -> Self {
        Self {
            manager,
            bot_id: bot_id.into(),
        }
    }
}

#[async_trait]
impl ChannelSender for SessionSender {
    async fn send_text(&self, to: &str, body: &str) -> Option<String> {
        self.manager.send_text(&self.bot_id, to, body).await
    }
}
