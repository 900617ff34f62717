//! The inbound message pipeline and bot orchestrator.
//!
//! Dedup, resolve, persist, fan-out; then, only when the conversation is
//! in BOT mode: context assembly, LLM invocation, outbound send, reply
//! persistence and token accounting. An LLM failure aborts that one
//! response attempt and nothing else; the inbound message is already stored
//! and fanned out by then.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channels::{ChannelSender, IncomingMessage};
use crate::config::{Config, LlmConfig};
use crate::dedup::DedupGate;
use crate::error::{PipelineError, PipelineResult};
use crate::events::EventBus;
use crate::phone::PhoneNormalizer;
use crate::providers::{self, ChatMessage, ChatRequest, Provider};
use crate::resolver;
use crate::store::{
    BotConfig, Client, Conversation, ConversationMode, NewMessage, SenderType, Store,
    StoredMessage, TokenUsageRow,
};

/// Builds a provider from a discriminator and an effective API key.
/// Injectable so tests run without network or real credentials.
pub type ProviderFactory =
    Box<dyn Fn(&str, Option<&str>) -> anyhow::Result<Box<dyn Provider>> + Send + Sync>;

/// Result of processing one inbound message that passed the dedup gate.
#[derive(Debug)]
pub struct InboundOutcome {
    pub client: Client,
    pub conversation: Conversation,
    pub message: StoredMessage,
}

pub struct Pipeline {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    dedup: DedupGate,
    normalizer: PhoneNormalizer,
    llm: LlmConfig,
    context_messages: usize,
    provider_factory: ProviderFactory,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, config: &Config) -> Self {
        Self::with_provider_factory(
            store,
            bus,
            config,
            Box::new(|provider, api_key| providers::create_provider(provider, api_key)),
        )
    }

    pub fn with_provider_factory(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        config: &Config,
        provider_factory: ProviderFactory,
    ) -> Self {
        Self {
            store,
            bus,
            dedup: DedupGate::new(config.pipeline.dedup_capacity),
            normalizer: PhoneNormalizer::with_default_rules(),
            llm: config.llm.clone(),
            context_messages: config.pipeline.context_messages,
            provider_factory,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run one inbound message through the pipeline. `sender` is the channel
    /// adapter bound to the bot's credentials; `None` means the bot cannot
    /// send, which skips auto-response but never the inbound bookkeeping.
    ///
    /// Returns `Ok(None)` when the dedup gate dropped the message.
    pub async fn process_incoming(
        &self,
        bot: &BotConfig,
        incoming: &IncomingMessage,
        sender: Option<&dyn ChannelSender>,
    ) -> PipelineResult<Option<InboundOutcome>> {
        if !self.dedup.should_process(&self.store, &incoming.channel_ref)? {
            debug!(
                channel_ref = incoming.channel_ref,
                "Skipping duplicate channel message"
            );
            return Ok(None);
        }

        let phone = self.normalizer.normalize(&incoming.from);
        let (client, conversation) = resolver::resolve(
            &self.store,
            &bot.tenant_id,
            &bot.id,
            &phone,
            incoming.contact_name.as_deref(),
        )?;

        let timestamp =
            DateTime::from_timestamp(incoming.timestamp, 0).unwrap_or_else(Utc::now);
        let message = self.store.insert_message(NewMessage {
            conversation_id: conversation.id.clone(),
            sender_type: SenderType::Client,
            content: incoming.text.clone(),
            channel_ref: Some(incoming.channel_ref.clone()),
            metadata: None,
            timestamp,
        })?;
        self.store.touch_conversation(&conversation.id)?;

        self.bus.publish_new_message(&message);
        self.bus
            .publish_conversation_updated(&bot.tenant_id, &message);

        if conversation.mode == ConversationMode::Bot {
            match sender {
                Some(sender) => {
                    if let Err(e) = self
                        .generate_bot_response(bot, &conversation, &client.phone, sender)
                        .await
                    {
                        // Terminal for this trigger; the inbound message is
                        // stored and a human can pick it up.
                        warn!(
                            conversation_id = conversation.id,
                            "Bot response failed: {e}"
                        );
                    }
                }
                None => {
                    warn!(
                        bot_id = bot.id,
                        "Bot has no usable channel credentials; skipping auto-response"
                    );
                }
            }
        }

        Ok(Some(InboundOutcome {
            client,
            conversation,
            message,
        }))
    }

    /// Generate and deliver one bot reply: context window of the most
    /// recent messages (oldest first, system prompt prepended), LLM call,
    /// channel send, reply row, token usage row, fan-out.
    pub async fn generate_bot_response(
        &self,
        bot: &BotConfig,
        conversation: &Conversation,
        client_phone: &str,
        sender: &dyn ChannelSender,
    ) -> PipelineResult<StoredMessage> {
        let recent = self
            .store
            .recent_messages(&conversation.id, self.context_messages)?;

        let mut messages = Vec::with_capacity(recent.len() + 1);
        messages.push(ChatMessage::system(bot.system_prompt.clone()));
        for stored in &recent {
            messages.push(match stored.sender_type {
                SenderType::Client => ChatMessage::user(stored.content.clone()),
                SenderType::Bot | SenderType::Agent => {
                    ChatMessage::assistant(stored.content.clone())
                }
            });
        }

        let provider = (self.provider_factory)(&bot.provider, self.effective_api_key(bot))
            .map_err(PipelineError::Provider)?;
        let completion = provider
            .generate(ChatRequest {
                messages,
                model: bot.model.clone(),
                temperature: bot.temperature,
                max_tokens: bot.max_tokens,
            })
            .await
            .map_err(PipelineError::Provider)?;

        // A failed send is logged by the adapter and leaves a null ref; the
        // reply row is still written.
        let channel_ref = sender.send_text(client_phone, &completion.content).await;

        let message = self.store.insert_message(NewMessage {
            conversation_id: conversation.id.clone(),
            sender_type: SenderType::Bot,
            content: completion.content.clone(),
            channel_ref,
            metadata: None,
            timestamp: Utc::now(),
        })?;

        self.store.record_token_usage(&TokenUsageRow {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            message_id: message.id.clone(),
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            total_tokens: completion.total_tokens,
            model: completion.model.clone(),
            estimated_cost: completion.estimated_cost,
        })?;
        self.store.touch_conversation(&conversation.id)?;

        self.bus.publish_new_message(&message);
        self.bus
            .publish_conversation_updated(&bot.tenant_id, &message);

        info!(
            conversation_id = conversation.id,
            model = completion.model,
            tokens = completion.total_tokens,
            "Bot reply sent"
        );
        Ok(message)
    }

    /// Agent-authored send: same persist + send + fan-out contract as a bot
    /// reply, no LLM involved, authoring agent recorded in metadata.
    pub async fn send_agent_message(
        &self,
        conversation_id: &str,
        content: &str,
        agent_id: &str,
        sender: Option<&dyn ChannelSender>,
    ) -> PipelineResult<StoredMessage> {
        let conversation = self
            .store
            .conversation(conversation_id)?
            .ok_or_else(|| PipelineError::NotFound("conversation", conversation_id.into()))?;
        let client = self
            .store
            .client(&conversation.client_id)?
            .ok_or_else(|| PipelineError::NotFound("client", conversation.client_id.clone()))?;
        let bot = self
            .store
            .bot_config(&conversation.bot_config_id)?
            .ok_or_else(|| {
                PipelineError::NotFound("bot config", conversation.bot_config_id.clone())
            })?;

        let channel_ref = match sender {
            Some(sender) => sender.send_text(&client.phone, content).await,
            None => {
                warn!(
                    conversation_id,
                    "No channel adapter for agent send; persisting without delivery"
                );
                None
            }
        };

        let message = self.store.insert_message(NewMessage {
            conversation_id: conversation.id.clone(),
            sender_type: SenderType::Agent,
            content: content.to_string(),
            channel_ref,
            metadata: Some(serde_json::json!({ "agentId": agent_id })),
            timestamp: Utc::now(),
        })?;
        self.store.touch_conversation(&conversation.id)?;

        self.bus.publish_new_message(&message);
        self.bus
            .publish_conversation_updated(&bot.tenant_id, &message);

        Ok(message)
    }

    fn effective_api_key<'a>(&'a self, bot: &'a BotConfig) -> Option<&'a str> {
        let fleet_key = match bot.provider.as_str() {
            "anthropic" => self.llm.anthropic_api_key.as_deref(),
            _ => self.llm.openai_api_key.as_deref(),
        };
        bot.api_key.as_deref().filter(|k| !k.is_empty()).or(fleet_key)
    }
}
