//! Static configuration loaded once at startup from `botdesk.toml`.
//!
//! Per-tenant bot settings (system prompt, model, channel credentials) are
//! data and live in the store; this file only carries process-level knobs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path the config was loaded from - not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Per-bot session credential directories live under here.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
}

fn default_db_path() -> String {
    "botdesk.db".into()
}
fn default_session_dir() -> String {
    ".wa-sessions".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            session_dir: default_session_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Fleet-wide OpenAI key; per-bot keys take precedence.
    pub openai_api_key: Option<String>,
    /// Fleet-wide Anthropic key; per-bot keys take precedence.
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// In-memory dedup cache size (channel message refs).
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// How many recent messages feed the LLM context window.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
}

fn default_dedup_capacity() -> usize {
    1000
}
fn default_context_messages() -> usize {
    20
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            context_messages: default_context_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bridge endpoint for the Web channel transport (ws:// or wss://).
    pub bridge_url: Option<String>,
    /// Base reconnect delay in seconds; attempt n waits `base × n`.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Reconnect attempts before giving up and waiting for the operator.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on a single connect attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_delay_secs() -> u64 {
    3
}
fn default_max_retries() -> u32 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            base_delay_secs: default_base_delay_secs(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load and validate a config file. Missing file yields defaults so a
    /// bare `botdesk serve` works out of the box.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config at {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Config::default()
        };

        config.config_path = path.to_path_buf();
        config.storage.db_path = expand(&config.storage.db_path);
        config.storage.session_dir = expand(&config.storage.session_dir);

        // Env keys fill in when the file leaves them unset.
        if config.llm.openai_api_key.is_none() {
            config.llm.openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        if config.llm.anthropic_api_key.is_none() {
            config.llm.anthropic_api_key =
                std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Startup-time validation. The only fatal error path in the process.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.dedup_capacity == 0 {
            anyhow::bail!("pipeline.dedup_capacity must be at least 1");
        }
        if self.pipeline.context_messages == 0 {
            anyhow::bail!("pipeline.context_messages must be at least 1");
        }
        if self.session.base_delay_secs == 0 {
            anyhow::bail!("session.base_delay_secs must be at least 1");
        }
        if let Some(url) = &self.session.bridge_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                anyhow::bail!("session.bridge_url must be a ws:// or wss:// URL, got {url}");
            }
        }
        Ok(())
    }

    /// Write a commented starter config.
    pub fn write_starter(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        std::fs::write(path, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

const STARTER_CONFIG: &str = r#"# botdesk configuration

[gateway]
host = "127.0.0.1"
port = 8080

[storage]
db_path = "botdesk.db"
session_dir = ".wa-sessions"

[llm]
# Fleet-wide keys; per-bot keys in the bot config take precedence.
# openai_api_key = "sk-..."
# anthropic_api_key = "sk-ant-..."

[session]
# WebSocket bridge carrying the Web channel socket protocol.
# bridge_url = "ws://127.0.0.1:3001"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.pipeline.dedup_capacity, 1000);
        assert_eq!(config.session.max_retries, 5);
    }

    #[test]
    fn parses_overrides() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("botdesk.toml");
        std::fs::write(
            &path,
            "[gateway]\nport = 9999\n[session]\nbridge_url = \"ws://localhost:3001\"\nmax_retries = 2\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway.port, 9999);
        assert_eq!(config.session.max_retries, 2);
        assert_eq!(config.session.bridge_url.as_deref(), Some("ws://localhost:3001"));
    }

    #[test]
    fn rejects_zero_dedup_capacity() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("botdesk.toml");
        std::fs::write(&path, "[pipeline]\ndedup_capacity = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_non_ws_bridge_url() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("botdesk.toml");
        std::fs::write(&path, "[session]\nbridge_url = \"http://localhost\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn starter_config_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("botdesk.toml");
        Config::write_starter(&path).unwrap();
        assert!(Config::load(&path).is_ok());
        // Second write refuses to clobber.
        assert!(Config::write_starter(&path).is_err());
    }
}
