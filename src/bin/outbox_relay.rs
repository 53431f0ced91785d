//! # Outbox Relay
//!
//! Runs the outbox runtime against RabbitMQ until Ctrl-C. Useful for
//! exercising a broker setup and for watching topics flow through the
//! consumer side with `--echo`.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use outbox_core::bootstrap::{OutboxRuntime, RuntimeOptions};
use outbox_core::config::ConfigManager;
use outbox_core::delivery::{SubscriberHandler, SubscriberRegistry};
use outbox_core::logging::init_structured_logging;
use outbox_core::messaging::providers::RabbitMqConnectionFactory;
use outbox_core::messaging::TransportMessage;
use outbox_core::persistence::InMemoryStorage;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "outbox-relay")]
#[command(about = "Relay outbox messages to RabbitMQ and consume subscribed topics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (default: $OUTBOX_CONFIG_PATH or config/outbox.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Topics to consume and log in the default group
    #[arg(long = "echo", value_name = "TOPIC")]
    echo_topics: Vec<String>,

    /// Print the effective configuration (password masked) and exit
    #[arg(long)]
    print_config: bool,
}

/// Logs every received message
struct EchoHandler;

#[async_trait]
impl SubscriberHandler for EchoHandler {
    async fn handle(&self, message: &TransportMessage) -> anyhow::Result<()> {
        info!(
            id = message.id().unwrap_or_default(),
            name = message.name().unwrap_or_default(),
            group = message.group().unwrap_or_default(),
            body = %String::from_utf8_lossy(message.body()),
            "Received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Outbox relay failed");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> outbox_core::Result<()> {
    let manager = match cli.config {
        Some(path) => ConfigManager::load_from_path(Some(path))?,
        None => ConfigManager::load()?,
    };

    if cli.print_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&manager.debug_config()).unwrap_or_default()
        );
        return Ok(());
    }

    let config = manager.shared_config();

    let handler: Arc<dyn SubscriberHandler> = Arc::new(EchoHandler);
    let registry = cli
        .echo_topics
        .iter()
        .fold(SubscriberRegistry::new(), |registry, topic| {
            registry.subscribe(config.default_group_name.clone(), topic.clone(), handler.clone())
        });

    let options = RuntimeOptions {
        on_failed_threshold: Some(Arc::new(|kind, message| {
            warn!(table = %kind, message_id = message.id, name = %message.name(), "Giving up on message");
        })),
        ..RuntimeOptions::default()
    };

    let runtime = OutboxRuntime::start(
        config.clone(),
        Arc::new(RabbitMqConnectionFactory::new(config.rabbitmq.clone())),
        Arc::new(InMemoryStorage::new(config.failed_retry_count)),
        registry,
        options,
    )
    .await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }

    runtime.shutdown().await;
    Ok(())
}
