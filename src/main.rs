use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rabbitmq_fallback::config::{self, Settings};
use rabbitmq_fallback::{DeliveryMode, PublishOutcome, QueueClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rabbitmq-fallback", about = "Publish to and consume from a RabbitMQ queue with a local backup file")]
struct Cli {
    /// JSON config file. Without it the default locations are searched,
    /// then RABBITMQ_* environment variables are used.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one message per argument.
    Publish {
        #[arg(required = true)]
        messages: Vec<String>,
        /// Send with delivery mode 1 instead of persistent.
        #[arg(long)]
        transient: bool,
    },
    /// Print and acknowledge messages until Ctrl-C or the idle timeout.
    Consume {
        /// Stop after this many seconds without a message.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Replay the backup file into the queue.
    Restore,
    /// Remove every ready message from the queue.
    Purge,
    /// Write a default config file.
    InitConfig { path: PathBuf },
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    if let Some(path) = path {
        return config::load_config_from(path);
    }
    match config::find_config_file() {
        Ok(found) => config::load_config_from(&found),
        Err(_) => Settings::from_env().context("No config file found and environment is incomplete"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        config::create_default_config_file(path)?;
        println!("Configuration file created at: {}", path.display());
        return Ok(());
    }

    let settings = load_settings(cli.config.as_ref())?;
    let mut client = QueueClient::init(settings).await.map_err(|e| {
        if e.is_broker_failure() {
            anyhow::anyhow!("{} (is the broker running, or set backup.file to spool locally?)", e)
        } else {
            e.into()
        }
    })?;

    match cli.command {
        Command::Publish { messages, transient } => {
            let mode = if transient { DeliveryMode::Transient } else { DeliveryMode::Persistent };
            let mut backed_up = 0;
            for message in &messages {
                if client.publish_with_mode(message.as_bytes(), mode).await? == PublishOutcome::BackedUp {
                    backed_up += 1;
                }
            }
            info!(published = messages.len() - backed_up, backed_up, "Publish finished");
        }
        Command::Consume { timeout } => {
            let idle = timeout.map(Duration::from_secs);
            let consume = client.consume(
                |delivery| {
                    println!("{}", String::from_utf8_lossy(&delivery.data));
                    Ok::<(), std::convert::Infallible>(())
                },
                idle,
            );
            tokio::select! {
                handled = consume => {
                    let handled = handled?;
                    info!(handled, "Consumer stopped");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping consumer");
                }
            }
        }
        Command::Restore => {
            if !client.is_connected() {
                warn!("Not connected to the broker, nothing restored");
            }
            let count = client.restore_from_backup().await?;
            println!("Restored {} message(s)", count);
        }
        Command::Purge => {
            let purged = client.purge().await?;
            println!("Purged {} message(s)", purged);
        }
        Command::InitConfig { .. } => {}
    }

    client.close().await?;
    Ok(())
}
