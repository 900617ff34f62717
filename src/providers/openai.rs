use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::pricing;
use super::traits::{ChatRequest as CanonicalRequest, Completion, Provider};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug)]
pub struct OpenAiProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL)
    }

    /// Point at a non-default endpoint (tests, proxies).
    pub fn with_base_url(api_key: Option<&str>, base_url: &str) -> Self {
        Self {
            api_key: api_key.map(ToString::to_string),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: super::http_client(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn generate(&self, request: CanonicalRequest) -> anyhow::Result<Completion> {
        let api_key = self.api_key.as_ref().filter(|k| !k.is_empty()).ok_or_else(|| {
            anyhow::anyhow!(
                "OpenAI API key not configured. Set OPENAI_API_KEY or a per-bot API key."
            )
        })?;

        let wire = ChatRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| Message {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&wire)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(super::api_error("OpenAI", response).await);
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let prompt_tokens = chat.usage.prompt_tokens;
        let completion_tokens = chat.usage.completion_tokens;
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
