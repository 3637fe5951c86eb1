//! SendLater CLI — schedule delayed chat messages and run the delivery
//! loop that fires them.
//!
//! `serve` is the long-lived scheduler process: it recovers timers from
//! the persisted blob, delivers due messages, and sweeps old records.
//! The other commands are one-shot: they mutate the blob and exit
//! without arming live timers — the next `serve` recovery pass re-arms
//! everything, which is the same protocol a process restart follows.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use sendlater_agent::{SimulatedChat, SimulatedPageHost};
use sendlater_core::SendLaterConfig;
use sendlater_core::types::{MessageStatus, Response};
use sendlater_scheduler::{ManualTimers, MessageStore, SchedulerCore, TokioTimers};

#[derive(Parser)]
#[command(
    name = "sendlater",
    version,
    about = "Schedules delayed delivery of chat messages"
)]
struct Cli {
    /// Config file (defaults to ~/.sendlater/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived scheduler: recovery, live timers, sweep.
    Serve,
    /// Schedule a message for future delivery.
    Schedule {
        /// Message body (max 4096 characters).
        text: String,
        /// Minutes until delivery.
        #[arg(long, default_value_t = 1)]
        in_mins: u64,
        /// Destination conversation; omitted = whatever is active at fire time.
        #[arg(long)]
        chat: Option<String>,
        /// Disambiguation token when several conversations share the label.
        #[arg(long)]
        chat_key: Option<String>,
    },
    /// List every scheduled and delivered message.
    List,
    /// Cancel a scheduled message.
    Cancel { id: String },
    /// Edit a scheduled message's text, and optionally its delivery time.
    Edit {
        id: String,
        text: String,
        /// New delay in minutes from now.
        #[arg(long)]
        in_mins: Option<u64>,
    },
    /// Remove terminal records older than the retention window.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SendLaterConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SendLaterConfig::load().context("loading config")?,
    };

    match cli.command {
        Command::Serve => serve(config).await,
        command => oneshot(config, command).await,
    }
}

async fn serve(config: SendLaterConfig) -> anyhow::Result<()> {
    let (handle, rx) = SchedulerCore::channel();
    let store = MessageStore::new(&config.storage.data_dir());
    let timers = Arc::new(TokioTimers::new(handle.sender()));

    let chat = Arc::new(SimulatedChat::new());
    chat.seed(&config.simulator.conversations).await;
    if let Some(active) = &config.simulator.active {
        chat.activate_by_title(active).await;
    }

    let host = Arc::new(
        SimulatedPageHost::new(handle.clone(), chat, config.delivery.clone())
            .with_url(config.pages.url_pattern.clone()),
    );
    if config.simulator.preopen {
        host.preopen_page().await;
    }

    let core = SchedulerCore::new(
        handle.clone(),
        rx,
        store,
        timers,
        host,
        config.scheduler.clone(),
        config.pages.clone(),
    );
    core.recover();
    tokio::spawn(core.run());

    let sweeper = handle.clone();
    let every = config.scheduler.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // consume the immediate tick
        loop {
            interval.tick().await;
            sweeper.sweep();
        }
    });

    tracing::info!("⏰ SendLater serving (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}

async fn oneshot(config: SendLaterConfig, command: Command) -> anyhow::Result<()> {
    let (handle, rx) = SchedulerCore::channel();
    let store = MessageStore::new(&config.storage.data_dir());
    let timers = Arc::new(ManualTimers::new());
    let chat = Arc::new(SimulatedChat::new());
    let host = Arc::new(SimulatedPageHost::new(
        handle.clone(),
        chat,
        config.delivery.clone(),
    ));
    let core = SchedulerCore::new(
        handle.clone(),
        rx,
        store,
        timers,
        host,
        config.scheduler.clone(),
        config.pages.clone(),
    );
    tokio::spawn(core.run());

    match command {
        Command::Schedule {
            text,
            in_mins,
            chat: target,
            chat_key,
        } => match handle.schedule(text, in_mins * 60_000, target, chat_key).await {
            Response::Scheduled { id } => {
                println!("Scheduled {id} ({in_mins} minute(s) from now)");
            }
            Response::Error { error } => anyhow::bail!(error),
            _ => {}
        },
        Command::List => {
            let messages = handle.messages().await;
            if messages.is_empty() {
                println!("No messages yet");
                return Ok(());
            }
            for msg in messages {
                let glyph = match msg.status {
                    MessageStatus::Scheduled => "⏱️",
                    MessageStatus::Sending => "📤",
                    MessageStatus::Sent => "✅",
                    MessageStatus::Failed => "❌",
                };
                let when = msg
                    .send_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M");
                let target = msg.target_label.as_deref().unwrap_or("(active chat)");
                let mut text = msg.text.replace('\n', " ");
                if text.chars().count() > 60 {
                    text = format!("{}…", text.chars().take(59).collect::<String>());
                }
                println!(
                    "{glyph} {:<9} {when}  {}  [{target}] {text}",
                    msg.status.to_string(),
                    msg.id
                );
                if let Some(err) = &msg.last_error {
                    println!("   ⚠ {err}");
                }
            }
        }
        Command::Cancel { id } => match handle.cancel(&id).await {
            Response::Error { error } => anyhow::bail!(error),
            _ => println!("Cancelled {id}"),
        },
        Command::Edit { id, text, in_mins } => {
            match handle.edit(&id, text, in_mins.map(|m| m * 60_000)).await {
                Response::Error { error } => anyhow::bail!(error),
                _ => println!("Updated {id}"),
            }
        }
        Command::Sweep => {
            let removed = handle.sweep_now().await;
            println!("Removed {removed} old message(s)");
        }
        Command::Serve => unreachable!("serve is handled separately"),
    }
    Ok(())
}
