use anyhow::Context;
use clap::{Parser, Subcommand};
use rbmq_link::connection::{AmqpConnector, Delivery};
use rbmq_link::metrics::PrometheusSink;
use rbmq_link::telemetry::{init_tracing, shutdown_signal};
use rbmq_link::{Consumer, Notifier, OutboundMessage, Settings};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rbmq-link")]
#[command(about = "Publish to and consume from RabbitMQ queues", long_about = None, version)]
struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, env = "RBMQ_CONFIG", default_value = "config/rbmq.toml")]
    config: String,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message and wait until it leaves the buffers
    Publish {
        #[arg(short, long)]
        queue: String,

        #[arg(short, long)]
        payload: String,

        #[arg(long, default_value = "0")]
        priority: u8,

        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Consume a queue, logging and acknowledging every delivery
    Consume {
        /// Defaults to `queue.name` from the configuration
        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(long)]
        prefetch: Option<u16>,
    },

    /// Print the number of ready messages in a queue
    QueueSize {
        #[arg(short, long)]
        queue: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    init_tracing(&settings.log.filter, cli.json_logs || settings.log.json);

    info!("Starting rbmq-link v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Publish {
            queue,
            payload,
            priority,
            tag,
        } => {
            let notifier = Notifier::start(
                settings.notifier.clone(),
                Arc::new(AmqpConnector::new()),
                Arc::new(PrometheusSink::new("rbmq", "notifier")),
            )
            .await
            .context("connecting notifier")?;

            let mut message = OutboundMessage::new(queue, payload).with_priority(priority);
            if let Some(tag) = tag {
                message = message.with_event_tag(tag);
            }
            notifier.publish(message).await?;

            tokio::select! {
                _ = wait_until_flushed(&notifier) => {}
                _ = shutdown_signal() => warn!("Interrupted before the message was published"),
            }
            let left = notifier.shutdown().await?;
            if left > 0 {
                warn!(left, "Messages left unpublished");
            }
        }

        Commands::Consume {
            queue,
            workers,
            prefetch,
        } => {
            let queue = queue.unwrap_or_else(|| settings.queue.name.clone());
            let workers = workers.unwrap_or(settings.queue.threads_count);
            let prefetch = prefetch.unwrap_or(settings.queue.prefetch_count);
            let sink = Arc::new(PrometheusSink::new("rbmq", "consumer"));

            let consumer = Consumer::new(
                settings.consumer.clone(),
                &queue,
                prefetch,
                Arc::new(AmqpConnector::new()),
                sink,
            )?;
            let mut handle = consumer
                .init_queue(log_and_ack, workers, &queue, &settings.consumer.binding_key)
                .await
                .with_context(|| format!("announcing queue {}", queue))?;

            info!("Press Ctrl+C to shutdown");
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    handle.shutdown().await;
                }
                _ = handle.wait() => {
                    anyhow::bail!("consumer for {} stopped: broker unreachable", queue);
                }
            }
        }

        Commands::QueueSize { queue } => {
            let notifier = Notifier::start(
                settings.notifier.clone(),
                Arc::new(AmqpConnector::new()),
                Arc::new(PrometheusSink::new("rbmq", "notifier")),
            )
            .await
            .context("connecting notifier")?;
            let size = notifier.queue_size(&queue).await?;
            println!("{}", size);
            notifier.shutdown().await?;
        }
    }

    info!("Shutting down gracefully...");
    Ok(())
}

async fn log_and_ack(delivery: Delivery) {
    info!(
        queue = delivery.queue(),
        delivery_tag = delivery.delivery_tag(),
        redelivered = delivery.redelivered(),
        body = %String::from_utf8_lossy(delivery.payload()),
        "Received"
    );
    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "Ack failed");
    }
}

async fn wait_until_flushed(notifier: &Notifier) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(50));
    loop {
        ticker.tick().await;
        if notifier.unpublished() == 0 {
            break;
        }
    }
}
