use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::pricing;
use super::traits::{ChatRequest as CanonicalRequest, ChatRole, Completion, Provider};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        Self::with_base_url(api_key, ANTHROPIC_BASE_URL)
    }

    pub fn with_base_url(api_key: Option<&str>, base_url: &str) -> Self {
        Self {
            api_key: api_key.map(ToString::to_string),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: super::http_client(),
        }
    }

    /// Map the canonical list to Anthropic's shape: system turns hoist into
    /// the `system` field, and the first remaining turn must be
    /// user-authored. The API rejects conversations that open with an
    /// assistant turn, so a placeholder user turn is synthesized when needed.
    fn map_messages(canonical: &CanonicalRequest) -> (Option<String>, Vec<Message>) {
        let system = canonical
            .messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.clone());

        let mut messages: Vec<Message> = canonical
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| Message {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        if messages.first().is_none_or(|m| m.role != "user") {
            messages.insert(
                0,
                Message {
                    role: "user".into(),
                    content: "...".into(),
                },
            );
        }

        (system, messages)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn generate(&self, request: CanonicalRequest) -> anyhow::Result<Completion> {
        let api_key = self.api_key.as_ref().filter(|k| !k.is_empty()).ok_or_else(|| {
            anyhow::anyhow!(
                "Anthropic API key is required. Set ANTHROPIC_API_KEY or a per-bot API key."
            )
        })?;

        let (system, messages) = Self::map_messages(&request);
        let wire = ChatRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system,
            messages,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(super::api_error("Anthropic", response).await);
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let prompt_tokens = chat.usage.input_tokens;
        let completion_tokens = chat.usage.output_tokens;
        Ok(Completion {
            content,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_cost: pricing::estimate_cost(&request.model, prompt_tokens, completion_tokens),
            model: request.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::ChatMessage;

    fn canonical(messages: Vec<ChatMessage>) -> CanonicalRequest {
        CanonicalRequest {
            messages,
            model: "claude-sonnet-4-20250514".into(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    #[tokio::test]
    async fn generate_fails_without_key() {
        let provider = AnthropicProvider::new(None);
        let err = provider
            .generate(canonical(vec![ChatMessage::user("hola")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API key is required"));
    }

    #[test]
    fn system_turn_hoists_into_field() {
        let (system, messages) = AnthropicProvider::map_messages(&canonical(vec![
            ChatMessage::system("Be concise"),
            ChatMessage::user("hola"),
        ]));
        assert_eq!(system.as_deref(), Some("Be concise"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn assistant_first_gets_placeholder_user_turn() {
        let (_, messages) = AnthropicProvider::map_messages(&canonical(vec![
            ChatMessage::system("Be concise"),
            ChatMessage::assistant("previous reply"),
            ChatMessage::user("hola"),
        ]));
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "...");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn empty_conversation_gets_placeholder_user_turn() {
        let (_, messages) =
            AnthropicProvider::map_messages(&canonical(vec![ChatMessage::system("Be concise")]));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn user_first_needs_no_placeholder() {
        let (_, messages) = AnthropicProvider::map_messages(&canonical(vec![
            ChatMessage::user("hola"),
            ChatMessage::assistant("hi"),
        ]));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hola");
    }

    #[test]
    fn wire_request_skips_absent_system() {
        let wire = ChatRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            system: None,
            messages: vec![],
            temperature: 0.7,
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(!json.contains("system"));
    }

    #[test]
    fn response_joins_text_blocks_and_reads_usage() {
        let json = r#"{
            "content": [{"type": "text", "text": "Hola"}, {"type": "text", "text": "!"}],
            "usage": {"input_tokens": 20, "output_tokens": 5}
        }"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        let text: String = resp.content.into_iter().map(|b| b.text).collect();
        assert_eq!(text, "Hola!");
        assert_eq!(resp.usage.input_tokens, 20);
    }
}
