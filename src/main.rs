use anyhow::Result;
use promptcron::client::{ChatCompletionClient, UuidTokenMinter};
use promptcron::config::EngineConfig;
use promptcron::models::ModelRegistry;
use promptcron::notify::{LogBroadcaster, Notifier, SessionPool};
use promptcron::scheduler::SchedulerEngine;
use promptcron::store::chats::FileChatStore;
use promptcron::store::jobs::FileJobStore;
use promptcron::store::users::FileUserStore;
use promptcron::utils::{ensure_dir, get_promptcron_home};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::from_env();
    let home = ensure_dir(get_promptcron_home()?)?;
    info!(
        "promptcron {} starting (home: {})",
        promptcron::VERSION,
        home.display()
    );

    let jobs = Arc::new(FileJobStore::open(home.join("jobs.json"))?);
    let chats = Arc::new(FileChatStore::open(home.join("chats.json"))?);
    let users = Arc::new(FileUserStore::open(home.join("users.json"))?);

    let registry_path = home.join("models.json");
    let registry = if registry_path.exists() {
        ModelRegistry::from_json_file(&registry_path)?
    } else {
        warn!(
            "No model registry at {}, starting with an empty one",
            registry_path.display()
        );
        ModelRegistry::default()
    };

    let client = Arc::new(ChatCompletionClient::new(
        config.local_api_base(),
        Arc::new(UuidTokenMinter),
    ));
    let notifier = Arc::new(Notifier::new(
        SessionPool::new(),
        Arc::new(LogBroadcaster),
        config.webui_url.clone(),
    ));

    let engine = SchedulerEngine::new(
        jobs,
        chats,
        users,
        Arc::new(registry),
        client,
        notifier,
        config.check_interval,
    );

    engine.start().await;
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    engine.stop().await;
    Ok(())
}
