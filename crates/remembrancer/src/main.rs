mod clock;
mod config;
mod dialogue;
mod store;
mod sweeper;
mod telegram;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use crate::{
    config::{open_config, write_default_config},
    dialogue::Dialogue,
    store::PgStore,
    telegram::TelegramClient,
};

#[derive(Parser)]
#[command(version)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if args.init {
        write_default_config(&args.config)?;
        info!(path = ?args.config, "Created default configuration");
        return Ok(());
    }

    let config = open_config(&args.config).context("Failed to load configuration")?;
    let interval = Duration::from_secs(config.poll.interval_seconds);
    info!(
        interval = %humantime::format_duration(interval),
        "Configuration loaded"
    );

    let client = TelegramClient::new(&config.telegram.token);
    let store = PgStore::connect_lazy(&config.database.url).context("Invalid database URL")?;
    if let Err(e) = store.migrate().await {
        warn!(error = %e, "Migrations not applied; will keep running degraded");
    }

    run_poll_loop(&client, &store, interval).await
}

/// Single-threaded poll loop: fetch a batch of updates, process them in
/// arrival order, run one delivery sweep, sleep, repeat.
async fn run_poll_loop(client: &TelegramClient, store: &PgStore, interval: Duration) -> Result<()> {
    let dialogue = Dialogue::new(client, store);

    // Whatever piled up while the bot was down is stale conversation input;
    // skip past it instead of replaying it.
    let mut offset = match client.get_updates(0).await {
        Ok(updates) => updates.last().map(|u| u.update_id).unwrap_or(0),
        Err(e) => {
            warn!(error = %e, "Could not drain update backlog");
            0
        }
    };

    info!(offset, "Starting poll loop");

    loop {
        match client.get_updates(offset + 1).await {
            Ok(updates) => {
                for update in updates {
                    offset = update.update_id;
                    let Some(inbound) = update.inbound() else {
                        continue;
                    };
                    info!(
                        update_id = update.update_id,
                        chat_id = inbound.chat_id,
                        text = ?inbound.text,
                        "Update received"
                    );
                    dialogue.handle(inbound).await;
                }
            }
            Err(e) => error!(error = %e, "getUpdates failed"),
        }

        if let Err(e) = sweeper::sweep(client, store, Utc::now().naive_utc()).await {
            warn!(error = %e, "Delivery sweep skipped");
        }

        tokio::time::sleep(interval).await;
    }
}
