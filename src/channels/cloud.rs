//! WhatsApp Cloud API adapter.
//!
//! Inbound: Meta pushes webhook payloads; [`parse_webhook_payload`] extracts
//! text messages (other types are ignored) together with the recipient
//! phone-number id that routes them to a bot. Outbound: [`CloudChannel`]
//! sends through the Graph API with the bot's own credentials.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::traits::{ChannelSender, IncomingMessage};
use crate::store::BotConfig;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

// ── Webhook payload shapes ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    value: WebhookValue,
}

#[derive(Debug, Deserialize)]
struct WebhookValue {
    metadata: Option<WebhookMetadata>,
    contacts: Option<Vec<WebhookContact>>,
    messages: Option<Vec<WebhookMessage>>,
    statuses: Option<Vec<MessageStatus>>,
}

#[derive(Debug, Deserialize)]
struct WebhookMetadata {
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookContact {
    profile: Option<ContactProfile>,
    wa_id: String,
}

#[derive(Debug, Deserialize)]
struct ContactProfile {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    from: String,
    id: String,
    timestamp: String,
    #[serde(rename = "type")]
    message_type: String,
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct MessageStatus {
    id: String,
    status: String,
    #[serde(default)]
    recipient_id: String,
}

/// Verification handshake: Meta sends `hub.mode`, `hub.verify_token` and
/// `hub.challenge`; a matching token echoes the challenge back.
pub fn verify_webhook(mode: &str, token: &str, challenge: &str, expected: &str) -> Option<String> {
    if mode == "subscribe" && !expected.is_empty() && token == expected {
        Some(challenge.to_string())
    } else {
        None
    }
}

/// Extract text messages from a webhook delivery. Malformed entries and
/// non-text message types are skipped, never errors; the channel retries
/// deliveries it considers failed.
pub fn parse_webhook_payload(payload: &Value) -> Vec<IncomingMessage> {
    let mut parsed = Vec::new();

    let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
        return parsed;
    };

    for entry in entries {
        let Ok(entry) = serde_json::from_value::<WebhookEntry>(entry.clone()) else {
            debug!("Skipping malformed webhook entry");
            continue;
        };
        for change in entry.changes {
            let value = change.value;
            if let Some(statuses) = &value.statuses {
                for status in statuses {
                    debug!(
                        "Delivery status {} = {} for {}",
                        status.id, status.status, status.recipient_id
                    );
                }
            }
            let Some(messages) = value.messages else {
                continue;
            };
            let routing_id = value
                .metadata
                .as_ref()
                .map(|m| m.phone_number_id.clone())
                .unwrap_or_default();

            for message in messages {
                if message.message_type != "text" {
                    debug!(
                        "Ignoring non-text webhook message {} ({})",
                        message.id, message.message_type
                    );
                    continue;
                }
                let Some(text) = message.text else { continue };

                let contact_name = value
                    .contacts
                    .as_ref()
                    .and_then(|contacts| contacts.iter().find(|c| c.wa_id == message.from))
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone());

                let timestamp = message
                    .timestamp
                    .parse::<i64>()
                    .unwrap_or_else(|_| Utc::now().timestamp());

                parsed.push(IncomingMessage {
                    from: message.from,
                    channel_ref: message.id,
                    timestamp,
                    text: text.body,
                    contact_name,
                    routing_id: routing_id.clone(),
                });
            }
        }
    }

    parsed
}

/// Check the `X-Hub-Signature-256` header against the raw request body.
pub fn verify_signature(app_secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let actual = mac.finalize().into_bytes();
    constant_time_eq(&actual, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Outbound ──────────────────────────────────────────────────────

/// Graph API sender bound to one bot's Cloud credentials.
pub struct CloudChannel {
    phone_number_id: String,
    api_token: String,
    base_url: String,
    client: Client,
}

impl CloudChannel {
    pub fn new(phone_number_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self::with_base_url(phone_number_id, api_token, GRAPH_API_BASE)
    }

    pub fn with_base_url(
        phone_number_id: impl Into<String>,
        api_token: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            phone_number_id: phone_number_id.into(),
            api_token: api_token.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Build a sender from a bot config, when its credential set is complete.
    pub fn from_bot(bot: &BotConfig) -> Option<Self> {
        if !bot.has_cloud_credentials() {
            return None;
        }
        Some(Self::new(
            bot.phone_number_id.clone()?,
            bot.api_token.clone()?,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[async_trait]
impl ChannelSender for CloudChannel {
    async fn send_text(&self, to: &str, body: &str) -> Option<String> {
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": {"body": body}
        });

        let response = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("WhatsApp Cloud send to {to} failed: {e}");
                return None;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            error!("WhatsApp Cloud API error ({status}): {detail}");
            return None;
        }

        match response.json::<SendResponse>().await {
            Ok(sent) => {
                info!("WhatsApp Cloud message sent to {to}");
                sent.messages.into_iter().next().map(|m| m.id)
            }
            Err(e) => {
                warn!("WhatsApp Cloud send succeeded but response was unreadable: {e}");
                None
            }
        }
    }
}
