#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use botdesk::config::Config;
use botdesk::events::EventBus;
use botdesk::gateway::{self, AppState};
use botdesk::pipeline::Pipeline;
use botdesk::providers;
use botdesk::session::bridge::BridgeTransport;
use botdesk::session::transport::{SessionTransport, UnconfiguredTransport};
use botdesk::session::{SessionManager, SessionSender};
use botdesk::store::{BotConfig, Store};

/// Multi-tenant WhatsApp conversation desk with LLM auto-response.
#[derive(Parser, Debug)]
#[command(name = "botdesk", version, about)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "botdesk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway and channel pipelines (default)
    Serve,
    /// Write a starter config file
    Init,
    /// Manage tenant bot configurations
    Bot {
        #[command(subcommand)]
        command: BotCommands,
    },
}

#[derive(Subcommand, Debug)]
enum BotCommands {
    /// Register a tenant bot
    Add {
        /// Tenant the bot belongs to
        #[arg(long)]
        tenant: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// System prompt for auto-responses
        #[arg(long)]
        system_prompt: String,
        /// LLM provider (openai, anthropic)
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,
        /// Per-bot LLM API key (falls back to the fleet-wide key)
        #[arg(long)]
        api_key: Option<String>,
        /// WhatsApp Cloud phone-number id (enables the webhook channel)
        #[arg(long)]
        phone_number_id: Option<String>,
        /// WhatsApp Cloud API token
        #[arg(long)]
        api_token: Option<String>,
        /// Webhook verification token
        #[arg(long)]
        verify_token: Option<String>,
        /// Meta app secret for webhook signature checks
        #[arg(long)]
        app_secret: Option<String>,
    },
    /// List registered bots
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Init => {
            Config::write_starter(&cli.config)?;
            println!("Wrote {}", cli.config.display());
            Ok(())
        }
        Commands::Bot { command } => {
            let config = Config::load(&cli.config)?;
            let store = Store::open(Path::new(&config.storage.db_path))?;
            run_bot_command(&store, command)
        }
        Commands::Serve => {
            let config = Config::load(&cli.config)?;
            serve(config).await
        }
    }
}

fn run_bot_command(store: &Store, command: BotCommands) -> Result<()> {
    match command {
        BotCommands::Add {
            tenant,
            name,
            system_prompt,
            provider,
            model,
            temperature,
            max_tokens,
            api_key,
            phone_number_id,
            api_token,
            verify_token,
            app_secret,
        } => {
            // Fail on unknown discriminators before they reach the pipeline.
            providers::create_provider(&provider, api_key.as_deref())?;

            let bot = BotConfig {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant,
                name,
                system_prompt,
                provider,
                model,
                temperature,
                max_tokens,
                api_key,
                phone_number_id,
                api_token,
                verify_token,
                app_secret,
            };
            store.create_bot_config(&bot)?;
            println!("Registered bot {} ({})", bot.name, bot.id);
            Ok(())
        }
        BotCommands::List => {
            let bots = store.list_bot_configs()?;
            if bots.is_empty() {
                println!("No bots registered. Use `botdesk bot add`.");
                return Ok(());
            }
            for bot in bots {
                let channel = if bot.has_cloud_credentials() {
                    "cloud"
                } else {
                    "web"
                };
                println!(
                    "{}  tenant={}  provider={}  model={}  channel={}  {}",
                    bot.id, bot.tenant_id, bot.provider, bot.model, channel, bot.name
                );
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(Store::open(Path::new(&config.storage.db_path))?);
    let bus = Arc::new(EventBus::new());

    let transport: Arc<dyn SessionTransport> = match &config.session.bridge_url {
        Some(url) => Arc::new(BridgeTransport::new(url.clone())),
        None => Arc::new(UnconfiguredTransport),
    };

    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(256);
    let sessions = Arc::new(SessionManager::new(
        transport,
        PathBuf::from(&config.storage.session_dir),
        &config.session,
        bus.clone(),
        inbound_tx,
    ));
    let pipeline = Arc::new(Pipeline::new(store.clone(), bus.clone(), &config));

    // Web-channel ingress: session events feed the same pipeline as the
    // webhook channel, replying through the owning session.
    {
        let pipeline = pipeline.clone();
        let store = store.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                let bot = match store.bot_config(&inbound.bot_id) {
                    Ok(Some(bot)) => bot,
                    Ok(None) => {
                        warn!(bot_id = inbound.bot_id, "Web message for unknown bot");
                        continue;
                    }
                    Err(e) => {
                        warn!("Bot lookup failed: {e}");
                        continue;
                    }
                };
                let sender = SessionSender::new(sessions.clone(), bot.id.clone());
                if let Err(e) = pipeline
                    .process_incoming(&bot, &inbound.message, Some(&sender))
                    .await
                {
                    warn!(bot_id = bot.id, "Web message processing failed: {e}");
                }
            }
        });
    }

    // Silent reconnection of every bot with saved credential material.
    let resumed = sessions.resume_saved_sessions();
    if resumed > 0 {
        info!("Resuming {resumed} saved Web session(s)");
    }

    let state = AppState {
        store,
        pipeline,
        sessions,
        bus,
    };

    tokio::select! {
        result = gateway::run(&config, state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
