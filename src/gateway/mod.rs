//! HTTP gateway: webhook ingress, session control surface, agent sends and
//! the WebSocket fan-out bridge for dashboards.
//!
//! Webhook deliveries are always acknowledged with 200, since the channel
//! retries anything else; the dedup gate owns replay suppression.

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::channels::{ChannelSender, CloudChannel, cloud};
use crate::config::Config;
use crate::events::EventBus;
use crate::pipeline::Pipeline;
use crate::session::{SessionManager, SessionSender, SessionStatus};
use crate::store::{BotConfig, ConversationMode, Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub pipeline: Arc<Pipeline>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", get(webhook_verify).post(webhook_deliver))
        .route("/channels/{bot_id}/connect", post(channel_connect))
        .route("/channels/{bot_id}/disconnect", post(channel_disconnect))
        .route("/channels/{bot_id}/status", get(channel_status))
        .route("/conversations/{id}/messages", post(agent_send))
        .route("/conversations/{id}/mode", patch(update_mode))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Serve the gateway until the process is stopped.
pub async fn run(config: &Config, state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

// ── Webhook channel ───────────────────────────────────────────────

/// Meta verification handshake. The webhook endpoint is shared by all
/// tenants, so the presented token is checked against every stored bot.
async fn webhook_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");

    let known = !token.is_empty() && state.store.verify_token_known(token).unwrap_or(false);
    let expected = if known { token } else { "" };
    match cloud::verify_webhook(mode, token, challenge, expected) {
        Some(echo) => {
            info!("Webhook verification succeeded");
            (StatusCode::OK, echo)
        }
        None => {
            warn!("Webhook verification failed");
            (StatusCode::FORBIDDEN, "Forbidden".to_string())
        }
    }
}

async fn webhook_deliver(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, &'static str) {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        // Unparseable bodies are acknowledged; there is nothing to retry into.
        warn!("Discarding unparseable webhook body");
        return (StatusCode::OK, "OK");
    };

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    for incoming in cloud::parse_webhook_payload(&payload) {
        let bot = match state.store.bot_config_by_phone_number_id(&incoming.routing_id) {
            Ok(Some(bot)) => bot,
            Ok(None) => {
                warn!(
                    routing_id = incoming.routing_id,
                    "No bot for webhook routing id"
                );
                continue;
            }
            Err(e) => {
                warn!("Bot lookup failed: {e}");
                continue;
            }
        };

        if let Some(app_secret) = bot.app_secret.as_deref().filter(|s| !s.is_empty()) {
            if !cloud::verify_signature(app_secret, &body, signature) {
                warn!(bot_id = bot.id, "Webhook signature mismatch; dropping message");
                continue;
            }
        }

        let sender = CloudChannel::from_bot(&bot);
        let sender_ref = sender.as_ref().map(|s| s as &dyn ChannelSender);
        if let Err(e) = state
            .pipeline
            .process_incoming(&bot, &incoming, sender_ref)
            .await
        {
            warn!(bot_id = bot.id, "Webhook message processing failed: {e}");
        }
    }

    (StatusCode::OK, "OK")
}

// ── Session control ───────────────────────────────────────────────

async fn channel_connect(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.store.bot_config(&bot_id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("bot config"),
        Err(e) => return internal_error(&e.to_string()),
    }
    let snapshot = state.sessions.connect(&bot_id);
    (StatusCode::OK, axum::Json(json!(snapshot))).into_response()
}

async fn channel_disconnect(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    state.sessions.disconnect(&bot_id).await;
    let snapshot = state.sessions.status(&bot_id);
    (StatusCode::OK, axum::Json(json!(snapshot))).into_response()
}

async fn channel_status(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    let snapshot = state.sessions.status(&bot_id);
    (StatusCode::OK, axum::Json(json!(snapshot))).into_response()
}

// ── Conversations ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AgentSendBody {
    content: String,
    #[serde(rename = "agentId")]
    agent_id: String,
}

async fn agent_send(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    axum::Json(body): axum::Json<AgentSendBody>,
) -> impl IntoResponse {
    let conversation = match state.store.conversation(&conversation_id) {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return not_found("conversation"),
        Err(e) => return internal_error(&e.to_string()),
    };
    let bot = match state.store.bot_config(&conversation.bot_config_id) {
        Ok(Some(bot)) => bot,
        Ok(None) => return not_found("bot config"),
        Err(e) => return internal_error(&e.to_string()),
    };

    let sender = sender_for_bot(&state, &bot);
    let sender_ref = sender.as_deref();
    match state
        .pipeline
        .send_agent_message(&conversation_id, &body.content, &body.agent_id, sender_ref)
        .await
    {
        Ok(message) => (StatusCode::CREATED, axum::Json(json!(message))).into_response(),
        Err(e) => internal_error(&e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: Option<ConversationMode>,
    /// Missing field = leave assignment alone; explicit null = unassign.
    #[serde(
        rename = "assignedAgentId",
        default,
        deserialize_with = "present_or_null"
    )]
    assigned_agent_id: Option<Option<String>>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

/// Operator mode toggle. Passing `assignedAgentId` (even null) drives mode
/// through agent assignment; a bare `mode` flips the flag directly.
async fn update_mode(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    axum::Json(body): axum::Json<ModeBody>,
) -> impl IntoResponse {
    let updated = if let Some(assignment) = body.assigned_agent_id {
        state
            .store
            .assign_agent(&conversation_id, assignment.as_deref())
    } else if let Some(mode) = body.mode {
        state.store.set_conversation_mode(&conversation_id, mode)
    } else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": "mode or assignedAgentId required"})),
        )
            .into_response();
    };

    match updated {
        Ok(Some(conversation)) => (StatusCode::OK, axum::Json(json!(conversation))).into_response(),
        Ok(None) => not_found("conversation"),
        Err(e) => internal_error(&e.to_string()),
    }
}

/// Pick the adapter an operator-authored send goes through: the bot's Cloud
/// credentials when present, else its connected Web session.
fn sender_for_bot(state: &AppState, bot: &BotConfig) -> Option<Box<dyn ChannelSender>> {
    if let Some(cloud) = CloudChannel::from_bot(bot) {
        return Some(Box::new(cloud));
    }
    if state.sessions.status(&bot.id).status == SessionStatus::Connected {
        return Some(Box::new(SessionSender::new(
            state.sessions.clone(),
            bot.id.clone(),
        )));
    }
    None
}

// ── WebSocket fan-out bridge ──────────────────────────────────────

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_bridge(state, socket))
}

/// Forward every bus event to the dashboard as one JSON frame.
async fn ws_bridge(state: AppState, mut socket: WebSocket) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let subscription = state.bus.subscribe(move |envelope| {
        if let Ok(frame) = serde_json::to_string(envelope) {
            let _ = tx.send(frame);
        }
    });

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            received = socket.recv() => match received {
                // Dashboards only listen; anything inbound besides
                // keepalives means the peer is going away.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state.bus.unsubscribe(subscription);
}

fn not_found(what: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

fn internal_error(detail: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({"error": detail})),
    )
        .into_response()
}
