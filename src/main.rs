//! eph-sample: sends messages to an in-memory event hub and consumes them
//! with an event processor host.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use event_processor_host::{
    config::{generate_host_name, LogFormat, MonitoringConfig},
    now_ms, CloseReason, Config, EventProcessor, EventProcessorHost, HostConfig, HostOptions,
    InMemoryLeaseStore, InMemoryNamespace, PartitionContext, PartitionedLog, RecordBatch,
};
use tokio::sync::Notify;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes, following Unix conventions (128+N for signal N).
#[repr(i32)]
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Invalid or unreadable configuration
    ConfigError = 1,
    /// General runtime error
    RuntimeError = 10,
    /// Interrupted by Ctrl+C before every message arrived
    SignalInterrupt = 130,
}

impl ExitCode {
    fn from_error(error: &anyhow::Error) -> Self {
        let is_config = error.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<event_processor_host::Error>(),
                Some(event_processor_host::Error::Configuration(_))
            )
        });
        if is_config {
            ExitCode::ConfigError
        } else {
            ExitCode::RuntimeError
        }
    }
}

const DEFAULT_HUB: &str = "sample-hub";

#[derive(Parser)]
#[command(name = "eph-sample")]
#[command(about = "Send messages to an in-memory event hub and consume them", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of messages to send
    #[arg(short, long, default_value_t = 50)]
    messages: usize,

    /// Partitions to create the hub with
    #[arg(short, long, default_value_t = 4)]
    partitions: usize,

    /// Override the event hub name
    #[arg(long)]
    hub: Option<String>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum Outcome {
    Completed,
    Interrupted,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::ConfigError;
        }
    };
    init_logging(config.monitoring.log_format, cli.verbose);

    match run(cli, config).await {
        Ok(Outcome::Completed) => ExitCode::Success,
        Ok(Outcome::Interrupted) => ExitCode::SignalInterrupt,
        Err(e) => {
            tracing::error!(error = %e, "Sample failed");
            ExitCode::from_error(&e)
        }
    }
}

fn init_logging(log_format: LogFormat, verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_toml(&content)?
        }
        None => Config {
            host: HostConfig::new(generate_host_name(), DEFAULT_HUB),
            options: HostOptions::default(),
            monitoring: MonitoringConfig::default(),
        },
    };
    if let Some(hub) = &cli.hub {
        config.host.event_hub_name = hub.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> Result<Outcome> {
    let namespace = InMemoryNamespace::new();
    let log = namespace
        .create_if_absent(&config.host.event_hub_name, cli.partitions)
        .await;

    for i in 0..cli.messages {
        let payload = format!("Sent number: {} Generated at: {}", i, now_ms());
        let (partition_id, offset) = log.send(None, Bytes::from(payload)).await?;
        debug!(partition = %partition_id, offset, "Sent message");
    }
    info!(
        hub = %config.host.event_hub_name,
        messages = cli.messages,
        partitions = cli.partitions,
        "Sent messages"
    );

    let received = Arc::new(AtomicUsize::new(0));
    let all_received = Arc::new(Notify::new());
    let factory = {
        let received = received.clone();
        let all_received = all_received.clone();
        let expected = cli.messages;
        move |_context: &PartitionContext| -> Box<dyn EventProcessor> {
            Box::new(CountingProcessor {
                count: 0,
                received: received.clone(),
                expected,
                all_received: all_received.clone(),
            })
        }
    };

    let host = EventProcessorHost::builder(config.host)
        .options(config.options)
        .log(log)
        .lease_store(Arc::new(InMemoryLeaseStore::new()))
        .processor_factory(factory)
        .build()?;
    host.start().await?;

    let outcome = if cli.messages == 0 {
        Outcome::Completed
    } else {
        tokio::select! {
            _ = all_received.notified() => Outcome::Completed,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping host");
                Outcome::Interrupted
            }
        }
    };

    host.stop().await?;
    info!(
        received = received.load(Ordering::SeqCst),
        events_received = host.events_received(),
        "Sample finished"
    );
    Ok(outcome)
}

/// Counts records per partition and checkpoints after every batch.
struct CountingProcessor {
    count: usize,
    received: Arc<AtomicUsize>,
    expected: usize,
    all_received: Arc<Notify>,
}

#[async_trait]
impl EventProcessor for CountingProcessor {
    async fn open(&mut self, context: &PartitionContext) -> event_processor_host::Result<()> {
        info!(
            partition = %context.partition_id(),
            epoch = context.epoch(),
            starting_offset = context.starting_offset(),
            "Processor opened"
        );
        Ok(())
    }

    async fn process(
        &mut self,
        context: &PartitionContext,
        batch: RecordBatch,
    ) -> event_processor_host::Result<()> {
        for record in &batch {
            debug!(
                partition = %context.partition_id(),
                offset = record.offset,
                payload = record.payload_str().unwrap_or("<binary>"),
                "Received message"
            );
        }
        self.count += batch.len();
        context.checkpoint().await?;

        let total = self.received.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
        if total >= self.expected {
            self.all_received.notify_one();
        }
        Ok(())
    }

    async fn close(
        &mut self,
        context: &PartitionContext,
        reason: CloseReason,
    ) -> event_processor_host::Result<()> {
        info!(
            partition = %context.partition_id(),
            count = self.count,
            reason = %reason,
            "Processor closed"
        );
        Ok(())
    }
}
