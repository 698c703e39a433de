//! ---
//! courier_section: "06-daemon"
//! courier_subsection: "binary"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Binary entrypoint for the Courier daemon."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_broker::{
    BrokerError, BrokerMetrics, BrokerSettings, DispatchOptions, FnProcessor, MessageBroker,
    StaticIdentity,
};
use courier_common::config::{CourierConfig, LoadedConfig};
use courier_common::logging::{init_tracing, LogFormat};
use courier_common::VERSION;
use courier_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use courier_msg::{Content, Endpoint, RemoteFault};
use courier_router::{InProcessRouter, MemoryBus, MemoryQueues, PubSubRouter, QueueRouter};
use serde_json::json;
use tracing::{info, warn};

const DEFAULT_CANDIDATES: [&str; 2] = ["configs/courier.toml", "/etc/courier/courier.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version = VERSION,
    about = "Courier message broker daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (json or pretty)")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the broker until interrupted")]
    Run,
    #[command(about = "Send requests to this process and report round-trip times")]
    Ping {
        #[arg(long, short = 'c', default_value_t = 4)]
        count: u32,
        #[arg(long, value_name = "MS", help = "Per-request timeout in milliseconds")]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_started = Instant::now();
    let LoadedConfig { mut config, source } = load_config(cli.config.as_deref())?;
    let load_duration = load_started.elapsed();
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing("courierd", &config.logging)?;
    info!(config_path = %source.display(), "configuration loaded");

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.set_build_info(VERSION, build_profile());

    let broker = start_broker(&config, registry.clone()).await?;
    daemon_metrics.inc_start();

    let outcome = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(&config, &broker, registry).await,
        Commands::Ping { count, timeout_ms } => {
            ping(&broker, count, timeout_ms.map(Duration::from_millis)).await
        }
    };
    broker.shutdown().await?;
    outcome
}

/// Explicit path first, then the default locations; built-in defaults when
/// nothing exists and no override is set.
fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        return CourierConfig::load_with_source(&[path]);
    }
    let env_override = std::env::var_os(CourierConfig::ENV_CONFIG_PATH).is_some();
    if !env_override && DEFAULT_CANDIDATES.iter().all(|c| !Path::new(c).exists()) {
        return Ok(LoadedConfig {
            config: CourierConfig::default(),
            source: PathBuf::from("<defaults>"),
        });
    }
    CourierConfig::load_with_source(&DEFAULT_CANDIDATES)
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

async fn start_broker(config: &CourierConfig, registry: SharedRegistry) -> Result<MessageBroker> {
    let identity = StaticIdentity::for_app(
        config.identity.app_id.clone(),
        config.identity.instance_id.clone(),
    );
    let metrics = BrokerMetrics::new(registry).context("failed to register broker metrics")?;
    let routers = &config.routers;
    let channels = routers.pubsub.channels.clone();

    let mut builder = MessageBroker::builder(identity)
        .config(BrokerSettings {
            default_timeout: config.broker.default_timeout,
            inbound_capacity: config.broker.inbound_capacity,
        })
        .metrics(metrics)
        .processor(FnProcessor::new(echo));
    if routers.in_process.enabled {
        builder = builder.router(
            InProcessRouter::new().with_channels(channels.clone()),
            routers.in_process.priority,
        );
    }
    if routers.pubsub.enabled {
        builder = builder.router(
            PubSubRouter::new(MemoryBus::new()).with_channels(channels),
            routers.pubsub.priority,
        );
    }
    if routers.queue.enabled {
        builder = builder.router(QueueRouter::new(MemoryQueues::new()), routers.queue.priority);
    }

    builder.start().await.context("failed to start message broker")
}

/// Requests are answered with their own payload.
fn echo(content: Content, sender: &Endpoint) -> std::result::Result<serde_json::Value, RemoteFault> {
    match content {
        Content::Payload(value) => Ok(json!({ "echo": value, "to": sender.to_string() })),
        other => Err(RemoteFault::new(
            "unsupported_content",
            format!("cannot echo {} content", other.kind()),
        )),
    }
}

async fn run_daemon(
    config: &CourierConfig,
    broker: &MessageBroker,
    registry: SharedRegistry,
) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    info!(
        endpoint = %broker.identity(),
        routers = ?broker.active_routers(),
        "daemon running; waiting for termination signal"
    );
    shutdown_signal().await?;
    info!(pending = broker.pending_requests(), "termination requested; shutting down");

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to wait for ctrl-c")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")
    }
}

async fn ping(broker: &MessageBroker, count: u32, timeout: Option<Duration>) -> Result<()> {
    let target = broker.identity();
    println!("PING {target}");
    let mut round_trips = Vec::with_capacity(count as usize);
    for seq in 1..=count {
        let mut options = DispatchOptions::new().to(target.clone());
        if let Some(timeout) = timeout {
            options = options.timeout(timeout);
        }
        let started = Instant::now();
        match broker.dispatch(json!({ "seq": seq }), options).await {
            Ok(_) => {
                let elapsed = started.elapsed();
                println!(
                    "reply from {target}: seq={seq} time={:.3} ms",
                    elapsed.as_secs_f64() * 1000.0
                );
                round_trips.push(elapsed);
            }
            Err(err @ BrokerError::Timeout { .. }) => println!("seq={seq} {err}"),
            Err(err) => {
                warn!(seq, error = %err, "ping failed");
                return Err(err.into());
            }
        }
    }

    let received = round_trips.len();
    println!(
        "{count} sent, {received} received, {:.0}% loss",
        (count as usize - received) as f64 * 100.0 / count.max(1) as f64
    );
    if let (Some(min), Some(max)) = (round_trips.iter().min(), round_trips.iter().max()) {
        let avg = round_trips.iter().sum::<Duration>() / received as u32;
        println!(
            "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
            min.as_secs_f64() * 1000.0,
            avg.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0
        );
    }
    Ok(())
}
