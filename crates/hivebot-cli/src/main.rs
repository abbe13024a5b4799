//! Hivebot binary: config → runtime assembly → console.

mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hivebot_agent::manager::AgentManager;
use hivebot_agent::skills::SkillsLoader;
use hivebot_agent::subagent::SubagentRegistry;
use hivebot_agent::tools::{SessionsSpawnTool, ToolRegistry, UseSkillTool};
use hivebot_core::bus::MessageBus;
use hivebot_core::config::{fixed_config, load_config};
use hivebot_core::paths;
use hivebot_core::session::SessionStore;
use hivebot_providers::{ChatProvider, RotationProvider};

#[derive(Parser, Debug)]
#[command(name = "hivebot", about = "Multi-tenant AI agent runtime", version)]
struct Cli {
    /// Path to config.json (defaults to ~/.hivebot/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Send a single message and exit instead of starting the console.
    #[arg(long, short = 'm')]
    message: Option<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref());
    if config.providers.profiles.iter().all(|p| !p.is_configured()) {
        warn!("no provider profile has credentials; LLM calls will fail");
    }
    let default_model = config.agents.defaults.model.clone();
    let workspace = paths::expand_home(&config.agents.defaults.workspace);
    let config = fixed_config(config);

    let bus = Arc::new(MessageBus::new());
    let sessions = Arc::new(SessionStore::new(None)?);
    let registry = Arc::new(SubagentRegistry::load(
        paths::data_dir().join("subagents.json"),
    ));
    let provider: Arc<dyn ChatProvider> = Arc::new(RotationProvider::from_config(
        &config().providers,
        &default_model,
    ));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SessionsSpawnTool::new(
        registry.clone(),
        sessions.clone(),
        bus.inbound_sender(),
        config.clone(),
    )));
    tools.register(Arc::new(UseSkillTool::new(Arc::new(SkillsLoader::new(
        &workspace,
    )))));

    let manager = AgentManager::new(
        bus.clone(),
        sessions,
        provider,
        Arc::new(tools),
        registry,
        config,
    );

    info!("hivebot starting");
    let manager_task = tokio::spawn(manager.clone().run());

    let result = match cli.message {
        Some(message) => repl::send_once(&bus, &message).await,
        None => repl::run_console(&bus).await,
    };

    manager.shutdown_token().cancel();
    let _ = manager_task.await;
    result
}
