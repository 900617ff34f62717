use async_trait::async_trait;

/// A customer message normalized from any channel's wire payload.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw channel identity of the sender (digits, E.164 or JID spelling).
    pub from: String,
    /// Channel-assigned unique id; the dedup key.
    pub channel_ref: String,
    /// Epoch seconds reported by the channel.
    pub timestamp: i64,
    pub text: String,
    /// Display name the channel attached, when it did.
    pub contact_name: Option<String>,
    /// Which bot the message is for: the Cloud webhook's recipient
    /// phone-number id, or the Web session's bot id.
    pub routing_id: String,
}

/// Outbound side of a channel adapter, bound to one bot's credentials.
///
/// Returns the channel-assigned message ref, or `None` on a
/// provider-reported failure (logged by the adapter, non-fatal to the
/// caller).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Option<String>;
}
