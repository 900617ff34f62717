//! End-to-end flows: webhook-shaped inbound traffic through dedup,
//! resolution, persistence, fan-out and bot response; Web-session inbound
//! through the same pipeline with replies on the owning session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use botdesk::channels::{ChannelSender, IncomingMessage};
use botdesk::config::{Config, SessionConfig};
use botdesk::events::EventBus;
use botdesk::pipeline::Pipeline;
use botdesk::providers::{ChatRequest, Completion, Provider};
use botdesk::session::transport::{SessionEvent, SessionLink, SessionSocket, SessionTransport};
use botdesk::session::{SessionManager, SessionSender, SessionStatus};
use botdesk::store::{BotConfig, SenderType, Store};

// ── Doubles ───────────────────────────────────────────────────────

#[derive(Debug)]
struct StubProvider {
    fail_with: Option<&'static str>,
}

#[async_trait]
impl Provider for StubProvider {
    async fn generate(&self, request: ChatRequest) -> anyhow::Result<Completion> {
        if let Some(reason) = self.fail_with {
            anyhow::bail!("{reason}");
        }
        assert!(!request.messages.is_empty());
        Ok(Completion {
            content: "¡Hola! ¿En qué puedo ayudarte?".into(),
            prompt_tokens: 42,
            completion_tokens: 9,
            total_tokens: 51,
            model: request.model,
            estimated_cost: 0.000012,
        })
    }
}

struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send_text(&self, to: &str, body: &str) -> Option<String> {
        let mut sent = self.sent.lock();
        sent.push((to.to_string(), body.to_string()));
        Some(format!("wamid.out.{}", sent.len()))
    }
}

struct WebSocketStub {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SessionSocket for WebSocketStub {
    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<Option<String>> {
        let mut sent = self.sent.lock();
        sent.push((to.to_string(), body.to_string()));
        Ok(Some(format!("web.out.{}", sent.len())))
    }

    async fn logout(&self) {}
    async fn close(&self) {}
}

/// Transport whose single connection immediately authenticates and then
/// delivers the scripted messages.
struct LiveSessionTransport {
    inbound: Mutex<Vec<IncomingMessage>>,
    socket: Arc<WebSocketStub>,
    keepalive: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
}

#[async_trait]
impl SessionTransport for LiveSessionTransport {
    async fn connect(
        &self,
        _bot_id: &str,
        _credentials: Option<serde_json::Value>,
    ) -> anyhow::Result<SessionLink> {
        let (tx, rx) = mpsc::channel(16);
        tx.send(SessionEvent::Open {
            phone: "5491199999999".into(),
        })
        .await
        .unwrap();
        for message in self.inbound.lock().drain(..) {
            tx.try_send(SessionEvent::Message(message)).unwrap();
        }
        self.keepalive.lock().push(tx);
        Ok(SessionLink {
            events: rx,
            socket: self.socket.clone(),
        })
    }
}

fn support_bot() -> BotConfig {
    BotConfig {
        id: "bot-1".into(),
        tenant_id: "tenant-1".into(),
        name: "Support".into(),
        system_prompt: "Be concise".into(),
        provider: "openai".into(),
        model: "gpt-4o-mini".into(),
        temperature: 0.7,
        max_tokens: 1024,
        api_key: Some("sk-test".into()),
        phone_number_id: Some("pn-1".into()),
        api_token: Some("cloud-token".into()),
        verify_token: Some("verify".into()),
        app_secret: None,
    }
}

fn pipeline_with(store: Arc<Store>, bus: Arc<EventBus>, fail_with: Option<&'static str>) -> Pipeline {
    Pipeline::with_provider_factory(
        store,
        bus,
        &Config::default(),
        Box::new(move |_, _| Ok(Box::new(StubProvider { fail_with }))),
    )
}

fn incoming(channel_ref: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        from: "5491100000000".into(),
        channel_ref: channel_ref.into(),
        timestamp: 1_700_000_000,
        text: text.into(),
        contact_name: Some("Ana".into()),
        routing_id: "pn-1".into(),
    }
}

// ── Scenarios ─────────────────────────────────────────────────────

/// Same "hola" delivered twice with ref m1: exactly one inbound row, at
/// most one bot reply.
#[tokio::test]
async fn duplicate_delivery_yields_one_message_and_one_reply() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let bot = support_bot();
    store.create_bot_config(&bot).unwrap();
    let pipeline = pipeline_with(store.clone(), bus, None);
    let sender = RecordingSender {
        sent: Mutex::new(Vec::new()),
    };

    let first = pipeline
        .process_incoming(&bot, &incoming("m1", "hola"), Some(&sender))
        .await
        .unwrap();
    let second = pipeline
        .process_incoming(&bot, &incoming("m1", "hola"), Some(&sender))
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());

    let conversation_id = first.unwrap().conversation.id;
    let messages = store.recent_messages(&conversation_id, 50).unwrap();
    let inbound: Vec<_> = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::Client)
        .collect();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].content, "hola");

    let replies = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::Bot)
        .count();
    assert!(replies <= 1);
    assert_eq!(sender.sent.lock().len(), 1);
}

/// Credential failure at the provider: inbound stored and fanned out, no
/// bot message, no usage rows.
#[tokio::test]
async fn provider_credential_error_is_contained() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = events.clone();
        bus.subscribe(move |envelope| {
            sink.lock()
                .push(serde_json::to_value(envelope).unwrap()["event"].clone());
        });
    }
    let bot = support_bot();
    store.create_bot_config(&bot).unwrap();
    let pipeline = pipeline_with(
        store.clone(),
        bus,
        Some("Anthropic API key is required"),
    );
    let sender = RecordingSender {
        sent: Mutex::new(Vec::new()),
    };

    let outcome = pipeline
        .process_incoming(&bot, &incoming("m1", "hola"), Some(&sender))
        .await
        .unwrap()
        .unwrap();

    let messages = store.recent_messages(&outcome.conversation.id, 50).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_type, SenderType::Client);
    assert!(store
        .token_usage_for_conversation(&outcome.conversation.id)
        .unwrap()
        .is_empty());
    assert!(sender.sent.lock().is_empty());

    // The inbound message still reached the dashboards.
    let seen = events.lock();
    assert!(seen.contains(&serde_json::json!("new_message")));
    assert!(seen.contains(&serde_json::json!("conversation_updated")));
}

/// A connected Web session feeds the same pipeline, and the reply goes out
/// through the session socket as a JID.
#[tokio::test]
async fn web_session_inbound_replies_on_the_session() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let bot = support_bot();
    store.create_bot_config(&bot).unwrap();

    let socket = Arc::new(WebSocketStub {
        sent: Mutex::new(Vec::new()),
    });
    let transport = Arc::new(LiveSessionTransport {
        inbound: Mutex::new(vec![IncomingMessage {
            from: "5491100000000@s.whatsapp.net".into(),
            channel_ref: "web.in.1".into(),
            timestamp: 1_700_000_000,
            text: "hola".into(),
            contact_name: Some("Ana".into()),
            routing_id: "bot-1".into(),
        }]),
        socket: socket.clone(),
        keepalive: Mutex::new(Vec::new()),
    });

    let auth_dir = tempfile::TempDir::new().unwrap();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
    let sessions = Arc::new(SessionManager::new(
        transport,
        auth_dir.path().to_path_buf(),
        &SessionConfig::default(),
        bus.clone(),
        inbound_tx,
    ));
    let pipeline = pipeline_with(store.clone(), bus, None);

    sessions.connect("bot-1");

    // Drive the ingress loop by hand, exactly as the serve task does.
    let inbound = inbound_rx.recv().await.expect("web inbound");
    assert_eq!(inbound.bot_id, "bot-1");
    let sender = SessionSender::new(sessions.clone(), "bot-1");
    let outcome = pipeline
        .process_incoming(&bot, &inbound.message, Some(&sender))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sessions.status("bot-1").status, SessionStatus::Connected);
    // Identity normalized from the JID spelling (Argentine mobile rule).
    assert_eq!(outcome.client.phone, "541100000000");

    let sent = socket.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "541100000000@s.whatsapp.net");

    let messages = store.recent_messages(&outcome.conversation.id, 50).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].sender_type, SenderType::Bot);
    assert_eq!(messages[1].channel_ref.as_deref(), Some("web.out.1"));
}

/// Humans take over: flipping the mode stops auto-responses without
/// touching inbound bookkeeping.
#[tokio::test]
async fn human_takeover_stops_replies() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let bot = support_bot();
    store.create_bot_config(&bot).unwrap();
    let pipeline = pipeline_with(store.clone(), bus, None);
    let sender = RecordingSender {
        sent: Mutex::new(Vec::new()),
    };

    let outcome = pipeline
        .process_incoming(&bot, &incoming("m1", "hola"), Some(&sender))
        .await
        .unwrap()
        .unwrap();
    store
        .assign_agent(&outcome.conversation.id, Some("agent-7"))
        .unwrap();

    pipeline
        .process_incoming(&bot, &incoming("m2", "quiero hablar con alguien"), Some(&sender))
        .await
        .unwrap()
        .unwrap();

    let messages = store.recent_messages(&outcome.conversation.id, 50).unwrap();
    let replies = messages
        .iter()
        .filter(|m| m.sender_type == SenderType::Bot)
        .count();
    assert_eq!(replies, 1, "only the pre-takeover reply");

    // The agent answers through the same contract.
    let agent_message = pipeline
        .send_agent_message(&outcome.conversation.id, "Acá estoy", "agent-7", Some(&sender))
        .await
        .unwrap();
    assert_eq!(agent_message.sender_type, SenderType::Agent);
    assert_eq!(
        agent_message.metadata.unwrap()["agentId"],
        serde_json::json!("agent-7")
    );
}
