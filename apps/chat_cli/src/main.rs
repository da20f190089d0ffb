use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, CacheKey, EngineDependencies, HttpRemoteSource, SilentHooks, SyncEngine,
    SystemClock,
};
use shared::domain::ServerId;
use storage::{SnapshotStore, Storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Base URL of the remote query/update gateway.
    #[arg(long, default_value = "http://127.0.0.1:8443/api")]
    remote_url: String,
    #[arg(long, default_value = "sqlite://chat_cache.db")]
    database_url: String,
    /// Identity to scope the cache to.
    #[arg(long)]
    user: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch unread counts while notification polling runs.
    Watch {
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    Members {
        server_id: String,
        #[arg(long)]
        force: bool,
    },
    Server {
        server_id: String,
        #[arg(long)]
        force: bool,
    },
    Messages {
        server_id: String,
        channel_id: String,
    },
    Send {
        server_id: String,
        channel_id: String,
        content: String,
    },
    Profiles {
        user_ids: Vec<String>,
    },
    MarkRead {
        server_id: String,
        channel_id: String,
    },
    /// List identities with a persisted cache.
    Snapshots,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cache_db = Arc::new(
        Storage::new(&storage::normalize_database_url(&cli.database_url))
            .await
            .with_context(|| format!("failed to open cache database {}", cli.database_url))?,
    );

    if let Command::Snapshots = cli.command {
        for key in cache_db.list_snapshot_keys().await? {
            println!("{key}");
        }
        return Ok(());
    }

    let remote = Arc::new(HttpRemoteSource::new(&cli.remote_url)?);
    let engine = SyncEngine::new_with_dependencies(
        remote,
        load_settings(),
        EngineDependencies {
            clock: Arc::new(SystemClock),
            hooks: Arc::new(SilentHooks),
            snapshots: Some(cache_db as Arc<dyn SnapshotStore>),
        },
    );
    if let Some(user) = &cli.user {
        engine.login(user).await?;
    }

    let outcome = run(&engine, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn run(engine: &SyncEngine, command: Command) -> Result<()> {
    match command {
        Command::Watch { seconds } => {
            let mut unread = engine.subscribe(CacheKey::Unread);
            let deadline = tokio::time::sleep(Duration::from_secs(seconds));
            tokio::pin!(deadline);
            println!("unread={}", engine.get_unread_count());
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    open = unread.changed() => {
                        if !open {
                            break;
                        }
                        println!("unread={}", engine.get_unread_count());
                        for (server, count) in engine.get_unread_counts_by_server() {
                            println!("  {server}: {count}");
                        }
                    }
                }
            }
        }
        Command::Members { server_id, force } => {
            let members = engine.fetch_server_members(&server_id, force).await?;
            let server = ServerId::parse(server_id.as_str())?;
            for member in members {
                println!(
                    "{}\t{}",
                    member.user_id,
                    engine.display_name(&server, &member.user_id)
                );
            }
        }
        Command::Server { server_id, force } => {
            let server = engine.get_server(&server_id, force).await?;
            println!("{} ({} members)", server.name, server.member_count);
            for channel in server.channels {
                println!("  #{}\t{}", channel.name, channel.channel_id);
            }
        }
        Command::Messages {
            server_id,
            channel_id,
        } => {
            for message in engine.fetch_messages(&server_id, &channel_id, true).await? {
                println!(
                    "[{}] {}: {}{}",
                    message.message_id,
                    message.author_id,
                    message.content,
                    if message.edited { " (edited)" } else { "" }
                );
            }
        }
        Command::Send {
            server_id,
            channel_id,
            content,
        } => {
            let receipt = engine.send_message(&server_id, &channel_id, &content).await?;
            match receipt.message {
                Some(message) => println!("sent message_id={}", message.message_id),
                None => println!("sent; remote id not yet visible"),
            }
        }
        Command::Profiles { user_ids } => {
            let ids: Vec<&str> = user_ids.iter().map(String::as_str).collect();
            for profile in engine.fetch_bulk_profiles(&ids).await? {
                println!("{}\t{}", profile.user_id, profile.display_name());
            }
        }
        Command::MarkRead {
            server_id,
            channel_id,
        } => {
            let marked = engine.mark_notifications_read(&server_id, &channel_id)?;
            info!(marked, "notifications marked read");
            println!("marked={marked} unread={}", engine.get_unread_count());
        }
        Command::Snapshots => {}
    }
    Ok(())
}
