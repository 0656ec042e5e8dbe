//! netcheck: report whether the internet and the corporate network are reachable.
//!
//! Exit code: 0 both up, 1 internet down, 2 corporate down, 3 both down.

mod aggregate;
mod cancel;
mod checker;
mod config;
mod metrics;
mod network;
mod result;
mod retry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cancel::Shutdown;
use checker::Checker;
use config::{Config, ConfigLayer};
use network::NetProber;
use retry::Backoff;

#[derive(Parser, Debug)]
#[command(
    name = "netcheck",
    version,
    about = "Check internet and corporate network reachability",
    long_about = "Probes external hosts (TCP, ping, captive-portal HTTP) and corporate hosts (TCP, internal DNS) concurrently, once. \
                  Exit code: 0 both reachable, 1 internet down, 2 corporate down, 3 both down."
)]
struct Cli {
    /// Config file (TOML). Default: /etc/netcheck, ~/.netcheck, then ./netcheck.toml
    #[arg(long, short = 'c', env = "NETCHECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// External host or host:port; repeat or comma-separate
    /// e.g. --external 8.8.8.8:53 --external 1.1.1.1
    #[arg(long, value_delimiter(','), num_args = 1.., env = "NETCHECK_EXTERNAL")]
    pub external: Option<Vec<String>>,

    /// Corporate host or host:port; repeat or comma-separate
    /// e.g. --corp fileserver.corp.local:445
    #[arg(long, value_delimiter(','), num_args = 1.., env = "NETCHECK_CORP")]
    pub corp: Option<Vec<String>>,

    /// Captive-portal probe URL; empty disables the HTTP probe
    /// [default: https://www.google.com/generate_204]
    #[arg(long, env = "NETCHECK_HTTP_URL")]
    pub http_url: Option<String>,

    /// Internal DNS name whose resolution indicates corporate reachability
    #[arg(long, env = "NETCHECK_DNS_PROBE")]
    pub dns_probe: Option<String>,

    /// TCP connect timeout, e.g. 2s [default: 2s]
    #[arg(long, value_parser = humantime::parse_duration, env = "NETCHECK_TCP_TIMEOUT")]
    pub tcp_timeout: Option<Duration>,

    /// HTTP request timeout [default: 5s]
    #[arg(long, value_parser = humantime::parse_duration, env = "NETCHECK_HTTP_TIMEOUT")]
    pub http_timeout: Option<Duration>,

    /// Ping timeout [default: 3s]
    #[arg(long, value_parser = humantime::parse_duration, env = "NETCHECK_PING_TIMEOUT")]
    pub ping_timeout: Option<Duration>,

    /// Attempts per probe [default: 2]
    #[arg(long, env = "NETCHECK_ATTEMPTS")]
    pub attempts: Option<u32>,

    /// Delay between attempts [default: 1500ms]
    #[arg(long, value_parser = humantime::parse_duration, env = "NETCHECK_BACKOFF")]
    pub backoff: Option<Duration>,

    /// Keep the delay fixed or double it after every failed attempt [default: fixed]
    #[arg(long, value_enum, env = "NETCHECK_BACKOFF_STRATEGY")]
    pub backoff_strategy: Option<Backoff>,

    /// ICMP echoes per ping attempt [default: same as --attempts]
    #[arg(long, env = "NETCHECK_PING_COUNT")]
    pub ping_count: Option<u32>,

    /// Print the result as JSON
    #[arg(long, alias = "stdout-json", env = "NETCHECK_JSON")]
    pub json: bool,

    /// Write Prometheus metrics to this file (textfile collector format)
    #[arg(long, env = "NETCHECK_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace) [default: info]
    #[arg(long, env = "NETCHECK_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            external: self.external.clone(),
            corp: self.corp.clone(),
            http_url: self.http_url.clone(),
            dns_probe: self.dns_probe.clone(),
            tcp_timeout: self.tcp_timeout,
            http_timeout: self.http_timeout,
            ping_timeout: self.ping_timeout,
            attempts: self.attempts,
            backoff: self.backoff,
            backoff_strategy: self.backoff_strategy,
            ping_count: self.ping_count,
            json: self.json.then_some(true),
            metrics_file: self.metrics_file.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

/// `RUST_LOG` directives when set, otherwise everything at `level` and above.
fn log_filter(level: tracing::Level, rust_log: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(rust_log.unwrap_or_default())
}

/// Trigger `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: Shutdown) {
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::warn!("Termination requested, cancelling checks");
        shutdown.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let file = ConfigLayer::discover(cli.config.as_deref()).context("Failed to load config")?;
    let (config_path, file_layer) = match file {
        Some((path, layer)) => (Some(path), layer),
        None => (None, ConfigLayer::default()),
    };
    let config = Config::resolve(cli.layer().merge(file_layer)).context("Invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            config.log_level,
            std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        ))
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &config_path {
        tracing::debug!("Loaded config from {}", path.display());
    }
    tracing::debug!("Effective config: {:?}", config);

    let sinks = metrics::sinks(config.metrics_file.as_deref())?;
    let prober = NetProber::new()?;

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    let json = config.json;
    let checker = Checker::new(config, prober, shutdown);
    let result = checker.run().await;

    if json {
        println!(
            "{}",
            result.to_json().context("Failed to serialize result")?
        );
    } else {
        print!("{}", result.render_human());
    }

    for sink in &sinks {
        if let Err(e) = sink.record(&result) {
            tracing::warn!("Failed to record metrics: {:#}", e);
        }
    }

    Ok(ExitCode::from(result.exit_code()))
}
