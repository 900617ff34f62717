pub mod anthropic;
pub mod openai;
pub mod pricing;
pub mod traits;

pub use traits::{ChatMessage, ChatRequest, ChatRole, Completion, Provider};

use std::time::Duration;

/// Factory: create the provider named by a bot config's discriminator.
pub fn create_provider(name: &str, api_key: Option<&str>) -> anyhow::Result<Box<dyn Provider>> {
    match name {
        "openai" => Ok(Box::new(openai::OpenAiProvider::new(api_key))),
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(api_key))),
        _ => anyhow::bail!("Unknown provider: {name}. Supported providers: openai, anthropic."),
    }
}

/// Shared HTTP client shape for provider calls. The request timeout is the
/// only bound on bot-response latency, so it must exist.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Shape a non-2xx provider response into an error with body context.
pub(crate) async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::anyhow!("{provider} API error ({status}): {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_openai() {
        assert!(create_provider("openai", Some("sk-test")).is_ok());
        assert!(create_provider("openai", None).is_ok());
    }

    #[test]
    fn factory_anthropic() {
        assert!(create_provider("anthropic", Some("sk-ant-test")).is_ok());
    }

    #[test]
    fn factory_unknown_provider_errors() {
        let err = create_provider("mistral", None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Unknown provider"));
        assert!(msg.contains("mistral"));
    }

    #[test]
    fn factory_empty_name_errors() {
        assert!(create_provider("", None).is_err());
    }
}
