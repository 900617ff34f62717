//! SQLite-backed durable store for tenant bots, clients, conversations,
//! messages and token usage.
//!
//! Concurrency-sensitive invariants are carried by the schema, not by
//! application locks: one client per (tenant, phone) and at most one ACTIVE
//! conversation per client are both unique indexes, so concurrent writers
//! lose with a constraint violation and retry against the winner's row.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (concurrent creator won).
    #[error("uniqueness conflict on {0}")]
    Conflict(&'static str),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ── Row types ─────────────────────────────────────────────────────

/// Per-tenant bot settings; the routing target for inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub system_prompt: String,
    /// Provider discriminator: `openai` or `anthropic`.
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Per-bot LLM key; falls back to the fleet-wide key when unset.
    pub api_key: Option<String>,
    /// Cloud API credentials. All three present ⇒ the bot can send via Cloud.
    pub phone_number_id: Option<String>,
    pub api_token: Option<String>,
    pub verify_token: Option<String>,
    /// When set, webhook deliveries must carry a valid X-Hub-Signature-256.
    pub app_secret: Option<String>,
}

impl BotConfig {
    /// Whether the bot has a complete Cloud API credential set.
    pub fn has_cloud_credentials(&self) -> bool {
        self.phone_number_id.as_deref().is_some_and(|v| !v.is_empty())
            && self.api_token.as_deref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "ACTIVE" => Ok(Self::Active),
            "CLOSED" => Ok(Self::Closed),
            other => Err(StoreError::Corrupt(format!("conversation status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationMode {
    Bot,
    Human,
}

impl ConversationMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "BOT",
            Self::Human => "HUMAN",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "BOT" => Ok(Self::Bot),
            "HUMAN" => Ok(Self::Human),
            other => Err(StoreError::Corrupt(format!("conversation mode {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub client_id: String,
    pub bot_config_id: String,
    pub status: ConversationStatus,
    pub mode: ConversationMode,
    pub assigned_agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderType {
    Client,
    Bot,
    Agent,
}

impl SenderType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "CLIENT",
            Self::Bot => "BOT",
            Self::Agent => "AGENT",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "CLIENT" => Ok(Self::Client),
            "BOT" => Ok(Self::Bot),
            "AGENT" => Ok(Self::Agent),
            other => Err(StoreError::Corrupt(format!("sender type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub content: String,
    /// Channel-assigned id; the dedup key. Null when the outbound send failed.
    pub channel_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Insert shape for a message row. Rows are immutable once written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub content: String,
    pub channel_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageRow {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub model: String,
    pub estimated_cost: f64,
}

// ── Store ─────────────────────────────────────────────────────────

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bot_configs (
                id TEXT PRIMARY KEY NOT NULL,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                provider TEXT NOT NULL DEFAULT 'openai',
                model TEXT NOT NULL,
                temperature REAL NOT NULL DEFAULT 0.7,
                max_tokens INTEGER NOT NULL DEFAULT 1024,
                api_key TEXT,
                phone_number_id TEXT,
                api_token TEXT,
                verify_token TEXT,
                app_secret TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_bot_configs_phone_number_id
                ON bot_configs(phone_number_id);

            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY NOT NULL,
                tenant_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                name TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_clients_tenant_phone
                ON clients(tenant_id, phone);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY NOT NULL,
                client_id TEXT NOT NULL REFERENCES clients(id),
                bot_config_id TEXT NOT NULL REFERENCES bot_configs(id),
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                mode TEXT NOT NULL DEFAULT 'BOT',
                assigned_agent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_one_active
                ON conversations(client_id) WHERE status = 'ACTIVE';

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY NOT NULL,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_type TEXT NOT NULL,
                content TEXT NOT NULL,
                channel_ref TEXT,
                metadata TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
                ON messages(conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_channel_ref
                ON messages(channel_ref);

            CREATE TABLE IF NOT EXISTS token_usage (
                id TEXT PRIMARY KEY NOT NULL,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                message_id TEXT NOT NULL REFERENCES messages(id),
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                model TEXT NOT NULL,
                estimated_cost REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_token_usage_conversation
                ON token_usage(conversation_id);",
        )?;
        Ok(())
    }

    // ── Bot configs ───────────────────────────────────────────────

    pub fn create_bot_config(&self, bot: &BotConfig) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_configs
                (id, tenant_id, name, system_prompt, provider, model, temperature,
                 max_tokens, api_key, phone_number_id, api_token, verify_token, app_secret)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                bot.id,
                bot.tenant_id,
                bot.name,
                bot.system_prompt,
                bot.provider,
                bot.model,
                bot.temperature,
                bot.max_tokens,
                bot.api_key,
                bot.phone_number_id,
                bot.api_token,
                bot.verify_token,
                bot.app_secret,
            ],
        )
        .map_err(|e| map_conflict(e, "bot_configs.id"))?;
        Ok(())
    }

    pub fn bot_config(&self, id: &str) -> StoreResult<Option<BotConfig>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{BOT_SELECT} WHERE id = ?1"),
            params![id],
            bot_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Route an inbound Cloud message to its bot by the webhook routing id.
    pub fn bot_config_by_phone_number_id(&self, phone_number_id: &str) -> StoreResult<Option<BotConfig>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{BOT_SELECT} WHERE phone_number_id = ?1"),
            params![phone_number_id],
            bot_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_bot_configs(&self) -> StoreResult<Vec<BotConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{BOT_SELECT} ORDER BY tenant_id, name"))?;
        let bots = stmt
            .query_map([], bot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bots)
    }

    /// The verification handshake matches any tenant's verify token.
    pub fn verify_token_known(&self, token: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bot_configs WHERE verify_token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Clients ───────────────────────────────────────────────────

    pub fn client(&self, id: &str) -> StoreResult<Option<Client>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, phone, name, created_at FROM clients WHERE id = ?1",
            params![id],
            client_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn client_by_phone(&self, tenant_id: &str, phone: &str) -> StoreResult<Option<Client>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, phone, name, created_at FROM clients
             WHERE tenant_id = ?1 AND phone = ?2",
            params![tenant_id, phone],
            client_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Fails with [`StoreError::Conflict`] when a concurrent creator won the
    /// (tenant, phone) uniqueness race.
    pub fn create_client(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<&str>,
    ) -> StoreResult<Client> {
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            phone: phone.to_string(),
            name: name.map(ToString::to_string),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO clients (id, tenant_id, phone, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client.id,
                client.tenant_id,
                client.phone,
                client.name,
                client.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| map_conflict(e, "clients(tenant_id, phone)"))?;
        Ok(client)
    }

    /// Fill the display name opportunistically; a known name is never
    /// overwritten.
    pub fn set_client_name_if_unset(&self, client_id: &str, name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE clients SET name = ?2
             WHERE id = ?1 AND (name IS NULL OR name = '')",
            params![client_id, name],
        )?;
        Ok(changed > 0)
    }

    // ── Conversations ─────────────────────────────────────────────

    pub fn conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{CONVERSATION_SELECT} WHERE id = ?1"),
            params![id],
            conversation_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn active_conversation(&self, client_id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{CONVERSATION_SELECT} WHERE client_id = ?1 AND status = 'ACTIVE'"),
            params![client_id],
            conversation_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Fails with [`StoreError::Conflict`] when the client already has an
    /// ACTIVE conversation (partial unique index).
    pub fn create_conversation(
        &self,
        client_id: &str,
        bot_config_id: &str,
    ) -> StoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            bot_config_id: bot_config_id.to_string(),
            status: ConversationStatus::Active,
            mode: ConversationMode::Bot,
            assigned_agent_id: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations
                (id, client_id, bot_config_id, status, mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id,
                conversation.client_id,
                conversation.bot_config_id,
                conversation.status.as_str(),
                conversation.mode.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| map_conflict(e, "conversations(client_id) active"))?;
        Ok(conversation)
    }

    /// Bump `updated_at`; called on every message.
    pub fn touch_conversation(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_conversation_mode(
        &self,
        id: &str,
        mode: ConversationMode,
    ) -> StoreResult<Option<Conversation>> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE conversations SET mode = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, mode.as_str(), Utc::now().to_rfc3339()],
            )?;
        }
        self.conversation(id)
    }

    pub fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Option<Conversation>> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )?;
        }
        self.conversation(id)
    }

    /// Assigning an agent flips the conversation to HUMAN mode; unassigning
    /// hands it back to the bot.
    pub fn assign_agent(
        &self,
        id: &str,
        agent_id: Option<&str>,
    ) -> StoreResult<Option<Conversation>> {
        let mode = if agent_id.is_some() {
            ConversationMode::Human
        } else {
            ConversationMode::Bot
        };
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE conversations
                 SET assigned_agent_id = ?2, mode = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, agent_id, mode.as_str(), Utc::now().to_rfc3339()],
            )?;
        }
        self.conversation(id)
    }

    // ── Messages ──────────────────────────────────────────────────

    pub fn insert_message(&self, new: NewMessage) -> StoreResult<StoredMessage> {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: new.conversation_id,
            sender_type: new.sender_type,
            content: new.content,
            channel_ref: new.channel_ref,
            metadata: new.metadata,
            timestamp: new.timestamp,
        };
        let metadata = message
            .metadata
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("message metadata: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages
                (id, conversation_id, sender_type, content, channel_ref, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.sender_type.as_str(),
                message.content,
                message.channel_ref,
                metadata,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(message)
    }

    /// Durable layer of the dedup gate.
    pub fn message_ref_exists(&self, channel_ref: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_ref = ?1",
            params![channel_ref],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The most recent `limit` messages, returned oldest → newest.
    pub fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_type, content, channel_ref, metadata, timestamp
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let mut rows: Vec<StoredMessage> = stmt
            .query_map(params![conversation_id, limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<StoreResult<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ── Token usage ───────────────────────────────────────────────

    pub fn record_token_usage(&self, usage: &TokenUsageRow) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO token_usage
                (id, conversation_id, message_id, prompt_tokens, completion_tokens,
                 total_tokens, model, estimated_cost)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                usage.id,
                usage.conversation_id,
                usage.message_id,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.model,
                usage.estimated_cost,
            ],
        )?;
        Ok(())
    }

    pub fn token_usage_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<TokenUsageRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, message_id, prompt_tokens, completion_tokens,
                    total_tokens, model, estimated_cost
             FROM token_usage WHERE conversation_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok(TokenUsageRow {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    message_id: row.get(2)?,
                    prompt_tokens: row.get(3)?,
                    completion_tokens: row.get(4)?,
                    total_tokens: row.get(5)?,
                    model: row.get(6)?,
                    estimated_cost: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ── Row mapping ───────────────────────────────────────────────────

const BOT_SELECT: &str = "SELECT id, tenant_id, name, system_prompt, provider, model, \
     temperature, max_tokens, api_key, phone_number_id, api_token, verify_token, app_secret \
     FROM bot_configs";

const CONVERSATION_SELECT: &str = "SELECT id, client_id, bot_config_id, status, mode, \
     assigned_agent_id, created_at, updated_at FROM conversations";

fn bot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotConfig> {
    Ok(BotConfig {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        system_prompt: row.get(3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        temperature: row.get(6)?,
        max_tokens: row.get(7)?,
        api_key: row.get(8)?,
        phone_number_id: row.get(9)?,
        api_token: row.get(10)?,
        verify_token: row.get(11)?,
        app_secret: row.get(12)?,
    })
}

fn client_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Client>> {
    let id: String = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    let phone: String = row.get(2)?;
    let name: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(parse_timestamp(&created_at).map(|created_at| Client {
        id,
        tenant_id,
        phone,
        name,
        created_at,
    }))
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Conversation>> {
    let status: String = row.get(3)?;
    let mode: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let id: String = row.get(0)?;
    let client_id: String = row.get(1)?;
    let bot_config_id: String = row.get(2)?;
    let assigned_agent_id: Option<String> = row.get(5)?;

    let build = || -> StoreResult<Conversation> {
        Ok(Conversation {
            id,
            client_id,
            bot_config_id,
            status: ConversationStatus::parse(&status)?,
            mode: ConversationMode::parse(&mode)?,
            assigned_agent_id,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    };
    Ok(build())
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<StoredMessage>> {
    let sender: String = row.get(2)?;
    let metadata: Option<String> = row.get(5)?;
    let timestamp: String = row.get(6)?;
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let content: String = row.get(3)?;
    let channel_ref: Option<String> = row.get(4)?;

    let build = || -> StoreResult<StoredMessage> {
        Ok(StoredMessage {
            id,
            conversation_id,
            sender_type: SenderType::parse(&sender)?,
            content,
            channel_ref,
            metadata: metadata
                .map(|raw| {
                    serde_json::from_str(&raw)
                        .map_err(|e| StoreError::Corrupt(format!("message metadata: {e}")))
                })
                .transpose()?,
            timestamp: parse_timestamp(&timestamp)?,
        })
    };
    Ok(build())
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw}: {e}")))
}

fn map_conflict(error: rusqlite::Error, what: &'static str) -> StoreError {
    if error.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
        StoreError::Conflict(what)
    } else {
        StoreError::Sqlite(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_bot() -> (Store, BotConfig) {
        let store = Store::open_in_memory().unwrap();
        let bot = test_bot("bot-1", "tenant-1");
        store.create_bot_config(&bot).unwrap();
        (store, bot)
    }

    fn test_bot(id: &str, tenant: &str) -> BotConfig {
        BotConfig {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            name: "Support".into(),
            system_prompt: "Be concise".into(),
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 1024,
            api_key: None,
            phone_number_id: Some("pn-1".into()),
            api_token: Some("token".into()),
            verify_token: Some("verify".into()),
            app_secret: None,
        }
    }

    #[test]
    fn bot_config_round_trip() {
        let (store, bot) = store_with_bot();
        let loaded = store.bot_config(&bot.id).unwrap().unwrap();
        assert_eq!(loaded.tenant_id, "tenant-1");
        assert_eq!(loaded.model, "gpt-4o-mini");
        assert!(loaded.has_cloud_credentials());
    }

    #[test]
    fn bot_lookup_by_phone_number_id() {
        let (store, bot) = store_with_bot();
        let loaded = store.bot_config_by_phone_number_id("pn-1").unwrap().unwrap();
        assert_eq!(loaded.id, bot.id);
        assert!(store.bot_config_by_phone_number_id("pn-x").unwrap().is_none());
    }

    #[test]
    fn verify_token_lookup() {
        let (store, _) = store_with_bot();
        assert!(store.verify_token_known("verify").unwrap());
        assert!(!store.verify_token_known("nope").unwrap());
    }

    #[test]
    fn duplicate_client_is_conflict() {
        let (store, _) = store_with_bot();
        store.create_client("tenant-1", "5411000", None).unwrap();
        let err = store.create_client("tenant-1", "5411000", None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // Same phone in another tenant is fine.
        assert!(store.create_client("tenant-2", "5411000", None).is_ok());
    }

    #[test]
    fn client_name_fill_never_overwrites() {
        let (store, _) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        assert!(store.set_client_name_if_unset(&client.id, "Ana").unwrap());
        assert!(!store.set_client_name_if_unset(&client.id, "Bob").unwrap());
        let loaded = store.client(&client.id).unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("Ana"));
    }

    #[test]
    fn second_active_conversation_is_conflict() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        store.create_conversation(&client.id, &bot.id).unwrap();
        let err = store.create_conversation(&client.id, &bot.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn closed_conversation_frees_the_active_slot() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let first = store.create_conversation(&client.id, &bot.id).unwrap();
        store
            .set_conversation_status(&first.id, ConversationStatus::Closed)
            .unwrap();
        assert!(store.active_conversation(&client.id).unwrap().is_none());
        let second = store.create_conversation(&client.id, &bot.id).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn assign_agent_flips_mode() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, &bot.id).unwrap();
        assert_eq!(conversation.mode, ConversationMode::Bot);

        let updated = store.assign_agent(&conversation.id, Some("agent-7")).unwrap().unwrap();
        assert_eq!(updated.mode, ConversationMode::Human);
        assert_eq!(updated.assigned_agent_id.as_deref(), Some("agent-7"));

        let back = store.assign_agent(&conversation.id, None).unwrap().unwrap();
        assert_eq!(back.mode, ConversationMode::Bot);
        assert!(back.assigned_agent_id.is_none());
    }

    #[test]
    fn message_ref_existence() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, &bot.id).unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_type: SenderType::Client,
                content: "hola".into(),
                channel_ref: Some("wamid.1".into()),
                metadata: None,
                timestamp: Utc::now(),
            })
            .unwrap();
        assert!(store.message_ref_exists("wamid.1").unwrap());
        assert!(!store.message_ref_exists("wamid.2").unwrap());
    }

    #[test]
    fn recent_messages_ordered_oldest_first() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, &bot.id).unwrap();
        let base = Utc::now();
        for i in 0..5i64 {
            store
                .insert_message(NewMessage {
                    conversation_id: conversation.id.clone(),
                    sender_type: SenderType::Client,
                    content: format!("m{i}"),
                    channel_ref: None,
                    metadata: None,
                    timestamp: base + chrono::Duration::seconds(i),
                })
                .unwrap();
        }
        let window = store.recent_messages(&conversation.id, 3).unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn message_metadata_round_trips() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, &bot.id).unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_type: SenderType::Agent,
                content: "hi".into(),
                channel_ref: None,
                metadata: Some(serde_json::json!({"agentId": "agent-7"})),
                timestamp: Utc::now(),
            })
            .unwrap();
        let loaded = store.recent_messages(&conversation.id, 1).unwrap();
        assert_eq!(
            loaded[0].metadata.as_ref().unwrap()["agentId"],
            serde_json::json!("agent-7")
        );
    }

    #[test]
    fn token_usage_append_and_list() {
        let (store, bot) = store_with_bot();
        let client = store.create_client("tenant-1", "5411000", None).unwrap();
        let conversation = store.create_conversation(&client.id, &bot.id).unwrap();
        let message = store
            .insert_message(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_type: SenderType::Bot,
                content: "reply".into(),
                channel_ref: None,
                metadata: None,
                timestamp: Utc::now(),
            })
            .unwrap();
        store
            .record_token_usage(&TokenUsageRow {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                message_id: message.id.clone(),
                prompt_tokens: 120,
                completion_tokens: 40,
                total_tokens: 160,
                model: "gpt-4o-mini".into(),
                estimated_cost: 0.000042,
            })
            .unwrap();
        let rows = store.token_usage_for_conversation(&conversation.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_tokens, 160);
    }
}
