use std::sync::Arc;

use color_eyre::eyre::{Context, eyre};
use mira_db::MiraDb;
use mira_ipc::{LaunchSpec, SidecarFactory, SidecarManager};
use mira_worker::{ControlChannel, MiraEngine, SessionRegistry};
use owo_colors::OwoColorize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod adapter;
mod commands;
mod config;
mod render;
mod telegram;

use adapter::Bot;
use config::BotConfig;
use telegram::TelegramChannel;

fn print_banner() {
    let banner = r#"
  __  __ _
 |  \/  (_)_ __ __ _
 | |\/| | | '__/ _` |
 | |  | | | | | (_| |
 |_|  |_|_|_|  \__,_|

    WhatsApp group operations
"#;
    println!("{}", banner.bright_green());
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    print_banner();

    tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_env_filter(
            EnvFilter::builder()
                .from_env_lossy()
                .add_directive("mira_bot=info".parse()?)
                .add_directive("mira_worker=info".parse()?)
                .add_directive("mira_ipc=info".parse()?)
                .add_directive("mira_db=info".parse()?),
        )
        .init();

    let config = BotConfig::from_env().wrap_err("Invalid configuration")?;
    info!(
        data_dir = %config.data_dir.display(),
        sidecar_dir = %config.sidecar_dir.display(),
        admins = config.admins.len(),
        "Mira start"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .wrap_err("Failed to create data directory")?;
    let db = Arc::new(
        MiraDb::new(&config.data_dir)
            .await
            .wrap_err("Failed to open account registry")?,
    );

    let mut sidecar = SidecarManager::new(LaunchSpec::bun(config.sidecar_dir.clone()));
    let ipc_rx = sidecar
        .take_event_receiver()
        .ok_or_else(|| eyre!("Failed to get sidecar event receiver"))?;
    let sidecar = Arc::new(sidecar);
    sidecar.start().await.wrap_err("Failed to start sidecar")?;

    let factory = Arc::new(SidecarFactory::new(sidecar.clone()));
    let registry = Arc::new(SessionRegistry::new(db, factory, config.data_dir.clone()));

    let telegram = Arc::new(TelegramChannel::new(config.token.clone()).wrap_err("Failed to build HTTP client")?);
    let username = telegram
        .get_me()
        .await
        .wrap_err("Bot token rejected by Telegram")?;
    info!(bot = %username, "Control channel connected");

    let channel: Arc<dyn ControlChannel> = telegram.clone();
    let mut engine = MiraEngine::new(config.engine_config(), registry, channel);
    let events = engine
        .take_event_receiver()
        .ok_or_else(|| eyre!("Failed to get engine event receiver"))?;
    let engine = Arc::new(engine);

    let restored = engine
        .start(ipc_rx)
        .await
        .wrap_err("Failed to restore sessions")?;
    info!(restored, "Engine started");
    let refresher = engine.spawn_periodic_refresh(config.refresh_every);

    let bot = Arc::new(Bot::new(engine, telegram, config));
    let forwarder = tokio::spawn({
        let bot = bot.clone();
        async move { bot.forward_events(events).await }
    });

    tokio::select! {
        _ = bot.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        }
    }

    refresher.abort();
    forwarder.abort();
    sidecar.stop().await.wrap_err("Failed to stop sidecar")?;
    Ok(())
}
