//! Real-time fan-out bus for dashboard mirroring.
//!
//! `new_message` is scoped to a conversation room, `conversation_updated`
//! goes tenant-wide, `channel_status` goes global. Publishing is
//! fire-and-forget: a slow or absent dashboard never blocks the pipeline.
//! The bus is injected wherever events originate so tests subscribe directly
//! without a socket layer.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::SessionStatus;
use crate::store::StoredMessage;

/// Delivery scope, mirroring the dashboard's room subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "room")]
pub enum Scope {
    /// One conversation room: `conversation:<id>`.
    Conversation(String),
    /// Every dashboard of the tenant.
    Tenant(String),
    /// All connected dashboards.
    Global,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum Event {
    NewMessage {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        message: StoredMessage,
    },
    ConversationUpdated {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "lastMessage")]
        last_message: StoredMessage,
    },
    ChannelStatus {
        #[serde(rename = "botId")]
        bot_id: String,
        status: SessionStatus,
        #[serde(rename = "qrCode")]
        qr_code: Option<String>,
    },
}

/// An event together with its delivery scope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(flatten)]
    pub event: Event,
}

type ListenerFn = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Fan-out bus. Thread-safe; listener callbacks run on the publisher's task
/// and must not block.
pub struct EventBus {
    listeners: RwLock<Vec<(u64, ListenerFn)>>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn publish(&self, scope: Scope, event: Event) {
        let envelope = Envelope { scope, event };
        let listeners = self.listeners.read();
        for (_, listener) in listeners.iter() {
            listener(&envelope);
        }
    }

    /// Subscribe to all events. Returns a handle for unsubscribing.
    pub fn subscribe(&self, listener: impl Fn(&Envelope) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    // ── Convenience emitters ────────────────────────────────────

    pub fn publish_new_message(&self, message: &StoredMessage) {
        self.publish(
            Scope::Conversation(message.conversation_id.clone()),
            Event::NewMessage {
                conversation_id: message.conversation_id.clone(),
                message: message.clone(),
            },
        );
    }

    pub fn publish_conversation_updated(&self, tenant_id: &str, last_message: &StoredMessage) {
        self.publish(
            Scope::Tenant(tenant_id.to_string()),
            Event::ConversationUpdated {
                conversation_id: last_message.conversation_id.clone(),
                last_message: last_message.clone(),
            },
        );
    }

    pub fn publish_channel_status(
        &self,
        bot_id: &str,
        status: SessionStatus,
        qr_code: Option<String>,
    ) {
        self.publish(
            Scope::Global,
            Event::ChannelStatus {
                bot_id: bot_id.to_string(),
                status,
                qr_code,
            },
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
