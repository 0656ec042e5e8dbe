//! Configuration: targets, timeouts, retry settings and output options
//!
//! Settings come in layers. The command line (including `NETCHECK_*`
//! environment variables) overrides the TOML config file, which overrides
//! the built-in defaults. Each source produces a [`ConfigLayer`]; layers are
//! merged and then resolved into a validated [`Config`].

use std::fmt;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::network::DEFAULT_HTTP_URL;
use crate::retry::{Backoff, RetryPolicy};

pub const DEFAULT_EXTERNAL_HOSTS: &[&str] = &["8.8.8.8:53", "1.1.1.1:53"];
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_ATTEMPTS: u32 = 2;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1500);

const CONFIG_FILE_NAME: &str = "netcheck.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("empty host in target list")]
    EmptyHost,
    #[error("invalid target '{0}'")]
    InvalidTarget(String),
    #[error("invalid port in '{input}': {source}")]
    InvalidPort {
        input: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid HTTP probe URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("attempts must be at least 1")]
    InvalidAttempts,
    #[error("ping count must be at least 1")]
    InvalidPingCount,
    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),
}

/// A probe target. A missing or zero port disables the TCP probe for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostTarget {
    pub host: String,
    pub port: Option<u16>,
}

impl HostTarget {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Port to dial, if the TCP probe applies to this target
    pub fn tcp_port(&self) -> Option<u16> {
        self.port.filter(|port| *port > 0)
    }
}

impl FromStr for HostTarget {
    type Err = ConfigError;

    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6 literals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidTarget(s.to_string()))?;
            if host.is_empty() {
                return Err(ConfigError::EmptyHost);
            }
            let port = match after {
                "" => None,
                tail => {
                    let port = tail
                        .strip_prefix(':')
                        .ok_or_else(|| ConfigError::InvalidTarget(s.to_string()))?;
                    Some(parse_port(s, port)?)
                }
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            None => Ok(Self::new(s, None)),
            // More than one colon without brackets: an IPv6 literal, no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, None)),
            Some((host, port)) => {
                let host = host.trim();
                if host.is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
                Ok(Self::new(host, Some(parse_port(s, port)?)))
            }
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, ConfigError> {
    port.trim()
        .parse::<u16>()
        .map_err(|source| ConfigError::InvalidPort {
            input: input.to_string(),
            source,
        })
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.host.contains(':')) {
            (Some(port), true) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), false) => write!(f, "{}:{}", self.host, port),
            (None, _) => f.write_str(&self.host),
        }
    }
}

/// One source of settings. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub external: Option<Vec<String>>,
    pub corp: Option<Vec<String>>,
    pub http_url: Option<String>,
    pub dns_probe: Option<String>,
    #[serde(deserialize_with = "humantime_opt")]
    pub tcp_timeout: Option<Duration>,
    #[serde(deserialize_with = "humantime_opt")]
    pub http_timeout: Option<Duration>,
    #[serde(deserialize_with = "humantime_opt")]
    pub ping_timeout: Option<Duration>,
    pub attempts: Option<u32>,
    #[serde(deserialize_with = "humantime_opt")]
    pub backoff: Option<Duration>,
    pub backoff_strategy: Option<Backoff>,
    pub ping_count: Option<u32>,
    pub json: Option<bool>,
    pub metrics_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

fn humantime_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

impl ConfigLayer {
    /// Parse a TOML document
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &text)
    }

    /// Load the config file: `explicit` must exist; otherwise the first
    /// existing file of [`default_config_paths`] is used, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        if let Some(path) = explicit {
            return Ok(Some((path.to_path_buf(), Self::from_file(path)?)));
        }
        for path in default_config_paths() {
            if path.is_file() {
                let layer = Self::from_file(&path)?;
                return Ok(Some((path, layer)));
            }
        }
        Ok(None)
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn merge(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            external: self.external.or(lower.external),
            corp: self.corp.or(lower.corp),
            http_url: self.http_url.or(lower.http_url),
            dns_probe: self.dns_probe.or(lower.dns_probe),
            tcp_timeout: self.tcp_timeout.or(lower.tcp_timeout),
            http_timeout: self.http_timeout.or(lower.http_timeout),
            ping_timeout: self.ping_timeout.or(lower.ping_timeout),
            attempts: self.attempts.or(lower.attempts),
            backoff: self.backoff.or(lower.backoff),
            backoff_strategy: self.backoff_strategy.or(lower.backoff_strategy),
            ping_count: self.ping_count.or(lower.ping_count),
            json: self.json.or(lower.json),
            metrics_file: self.metrics_file.or(lower.metrics_file),
            log_level: self.log_level.or(lower.log_level),
        }
    }
}

/// `/etc/netcheck/netcheck.toml`, `~/.netcheck/netcheck.toml`, `./netcheck.toml`
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![Path::new("/etc/netcheck").join(CONFIG_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".netcheck").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    paths
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub external_hosts: Vec<HostTarget>,
    pub corp_hosts: Vec<HostTarget>,
    /// Captive-portal URL; `None` disables the HTTP probe and the fallback
    pub http_url: Option<String>,
    /// Internal name whose resolution indicates corporate DNS reachability
    pub dns_probe: Option<String>,
    pub tcp_timeout: Duration,
    pub http_timeout: Duration,
    pub ping_timeout: Duration,
    pub ping_count: u32,
    pub retry: RetryPolicy,
    pub json: bool,
    pub metrics_file: Option<PathBuf>,
    pub log_level: tracing::Level,
}

impl Config {
    pub fn resolve(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let external_hosts = match layer.external {
            Some(hosts) => parse_targets(&hosts)?,
            None => parse_targets(DEFAULT_EXTERNAL_HOSTS)?,
        };
        let corp_hosts = parse_targets(&layer.corp.unwrap_or_default())?;

        let http_url = match layer.http_url {
            Some(url) => non_empty(url),
            None => Some(DEFAULT_HTTP_URL.to_string()),
        };
        if let Some(url) = &http_url {
            url::Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
                url: url.clone(),
                source,
            })?;
        }

        let attempts = layer.attempts.unwrap_or(DEFAULT_ATTEMPTS);
        if attempts == 0 {
            return Err(ConfigError::InvalidAttempts);
        }
        let ping_count = layer.ping_count.unwrap_or(attempts);
        if ping_count == 0 {
            return Err(ConfigError::InvalidPingCount);
        }

        let log_level = match layer.log_level {
            Some(level) => level
                .parse::<tracing::Level>()
                .map_err(|_| ConfigError::InvalidLogLevel(level))?,
            None => tracing::Level::INFO,
        };

        Ok(Self {
            external_hosts,
            corp_hosts,
            http_url,
            dns_probe: layer.dns_probe.and_then(non_empty),
            tcp_timeout: layer.tcp_timeout.unwrap_or(DEFAULT_TCP_TIMEOUT),
            http_timeout: layer.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
            ping_timeout: layer.ping_timeout.unwrap_or(DEFAULT_PING_TIMEOUT),
            ping_count,
            retry: RetryPolicy::new(
                attempts,
                layer.backoff.unwrap_or(DEFAULT_BACKOFF),
                layer.backoff_strategy.unwrap_or_default(),
            ),
            json: layer.json.unwrap_or(false),
            metrics_file: layer.metrics_file,
            log_level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        // Built-in defaults always validate.
        Self::resolve(ConfigLayer::default()).unwrap_or_else(|e| unreachable!("{e}"))
    }
}

fn parse_targets<S: AsRef<str>>(items: &[S]) -> Result<Vec<HostTarget>, ConfigError> {
    items.iter().map(|s| s.as_ref().parse()).collect()
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
