//! Per-target checks and the concurrent fan-out over all targets

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::aggregate::{aggregate, Collected};
use crate::cancel::Shutdown;
use crate::config::{Config, HostTarget};
use crate::network::Prober;
use crate::result::{CheckOutcome, Classification, ProbeDetail, RunResult};
use crate::retry::RetryPolicy;

pub const CANCELLED: &str = "cancelled";

/// Run the probe subset for `classification` against one target.
///
/// External: TCP (when a port is set), ping, HTTP (when a URL is configured).
/// Corporate: TCP (when a port is set), DNS (when a probe name is configured).
/// Every probe goes through the retry policy; the outcome succeeds if any
/// probe that ran succeeded, unless the run was cancelled by then.
pub async fn check_target<P>(
    classification: Classification,
    target: &HostTarget,
    config: &Config,
    prober: &P,
    shutdown: &Shutdown,
) -> CheckOutcome
where
    P: Prober + ?Sized,
{
    let started = Instant::now();
    let timestamp = Utc::now();
    let retry = &config.retry;
    let mut details = ProbeDetail::default();

    if let Some(port) = target.tcp_port() {
        details.tcp = retried(retry, shutdown, || {
            prober.tcp(&target.host, port, config.tcp_timeout)
        })
        .await;
    }

    match classification {
        Classification::External => {
            details.ping = retried(retry, shutdown, || {
                prober.ping(&target.host, config.ping_timeout, config.ping_count)
            })
            .await;

            if let Some(url) = &config.http_url {
                details.http =
                    retried(retry, shutdown, || prober.http(url, config.http_timeout)).await;
                details.http_url = details.http.map(|_| url.clone());
            }
        }
        Classification::Corporate => {
            if let Some(name) = &config.dns_probe {
                details.dns = retried(retry, shutdown, || prober.dns(name)).await;
                details.dns_probe = details.dns.map(|_| name.clone());
            }
        }
    }

    let cancelled = shutdown.is_cancelled();
    let outcome = CheckOutcome {
        classification,
        host: target.host.clone(),
        port: target.port,
        success: !cancelled && details.any_success(),
        error: cancelled.then(|| CANCELLED.to_string()),
        details,
        duration: started.elapsed(),
        timestamp,
    };
    tracing::debug!(
        "{} {} -> {} [{}] in {:?}",
        classification,
        target,
        if outcome.success { "up" } else { "down" },
        outcome.details,
        outcome.duration
    );
    outcome
}

/// `None` when the run is already cancelled, so the probe is left out
/// rather than recorded as failed.
async fn retried<F, Fut>(retry: &RetryPolicy, shutdown: &Shutdown, probe: F) -> Option<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if shutdown.is_cancelled() {
        return None;
    }
    Some(retry.run(shutdown, probe).await)
}

/// Runs one full check cycle over every configured target
pub struct Checker<P> {
    config: Arc<Config>,
    prober: Arc<P>,
    shutdown: Shutdown,
}

impl<P: Prober + 'static> Checker<P> {
    pub fn new(config: Config, prober: P, shutdown: Shutdown) -> Self {
        Self {
            config: Arc::new(config),
            prober: Arc::new(prober),
            shutdown,
        }
    }

    /// Check every target concurrently, then aggregate.
    pub async fn run(&self) -> RunResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        let retry = &self.config.retry;
        tracing::info!(
            "Checking {} external and {} corporate target(s), {} attempt(s) per probe, {:?} {:?} backoff",
            self.config.external_hosts.len(),
            self.config.corp_hosts.len(),
            retry.attempts(),
            retry.delay(),
            retry.backoff()
        );

        let collected = self.collect().await;

        let fallback = match &self.config.http_url {
            Some(url) if !self.shutdown.is_cancelled() => {
                let prober = Arc::clone(&self.prober);
                let timeout = self.config.http_timeout;
                let target = url.clone();
                Some((url.as_str(), move || async move {
                    prober.http(&target, timeout).await
                }))
            }
            _ => None,
        };
        let verdict = aggregate(collected, fallback).await;

        let result = RunResult {
            internet_ok: verdict.internet_ok,
            corporate_ok: verdict.corporate_ok,
            timestamp,
            elapsed: started.elapsed(),
            internet_details: verdict.outcomes.external,
            corporate_details: verdict.outcomes.corporate,
            summary: verdict.summary,
        };
        tracing::info!(
            "Internet: {}, corporate: {}, {}/{} checks OK in {:.3}s",
            if result.internet_ok { "up" } else { "down" },
            if result.corporate_ok { "up" } else { "down" },
            result.summary.successful,
            result.summary.total_checks,
            result.elapsed.as_secs_f64()
        );
        result
    }

    /// Spawn one task per (classification, target) and wait for all of them.
    async fn collect(&self) -> Collected {
        let mut collected = Collected::default();
        if self.shutdown.is_cancelled() {
            tracing::warn!("Run cancelled before any check started");
            return collected;
        }

        let targets = self
            .config
            .external_hosts
            .iter()
            .map(|t| (Classification::External, t))
            .chain(
                self.config
                    .corp_hosts
                    .iter()
                    .map(|t| (Classification::Corporate, t)),
            );

        let mut tasks = FuturesUnordered::new();
        for (classification, target) in targets {
            let config = Arc::clone(&self.config);
            let prober = Arc::clone(&self.prober);
            let shutdown = self.shutdown.clone();
            let target = target.clone();

            tasks.push(tokio::spawn(async move {
                if shutdown.is_cancelled() {
                    tracing::debug!("Skipping {} {}: cancelled", classification, target);
                    return None;
                }
                let outcome =
                    check_target(classification, &target, &config, prober.as_ref(), &shutdown)
                        .await;
                Some(outcome)
            }));
        }

        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Some(outcome)) => collected.insert(outcome),
                Ok(None) => {}
                Err(e) => tracing::error!("Check task failed: {}", e),
            }
        }
        tracing::debug!("Collected {} outcome(s)", collected.len());
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::FALLBACK_KEY;
    use crate::retry::Backoff;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Prober answering from fixed tables and counting calls
    #[derive(Default)]
    struct ScriptedProber {
        tcp_up: HashSet<(String, u16)>,
        ping_up: HashSet<String>,
        http_up: bool,
        /// HTTP starts answering from this (1-based) call on
        http_ok_from_call: Option<u32>,
        dns_up: bool,
        /// Triggered by every TCP probe
        cancel_on_tcp: Option<Shutdown>,
        calls: Mutex<Vec<String>>,
        http_calls: AtomicU32,
    }

    impl ScriptedProber {
        fn with_tcp(mut self, host: &str, port: u16) -> Self {
            self.tcp_up.insert((host.to_string(), port));
            self
        }

        fn with_ping(mut self, host: &str) -> Self {
            self.ping_up.insert(host.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn tcp(&self, host: &str, port: u16, _timeout: Duration) -> bool {
            self.calls.lock().unwrap().push(format!("tcp {host}:{port}"));
            if let Some(shutdown) = &self.cancel_on_tcp {
                shutdown.trigger();
            }
            self.tcp_up.contains(&(host.to_string(), port))
        }

        async fn dns(&self, name: &str) -> bool {
            self.calls.lock().unwrap().push(format!("dns {name}"));
            self.dns_up
        }

        async fn http(&self, url: &str, _timeout: Duration) -> bool {
            self.calls.lock().unwrap().push(format!("http {url}"));
            let call = self.http_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.http_up || self.http_ok_from_call.is_some_and(|from| call >= from)
        }

        async fn ping(&self, host: &str, _timeout: Duration, _count: u32) -> bool {
            self.calls.lock().unwrap().push(format!("ping {host}"));
            self.ping_up.contains(host)
        }
    }

    fn config(external: &[&str], corp: &[&str]) -> Config {
        Config {
            external_hosts: external.iter().map(|s| s.parse().unwrap()).collect(),
            corp_hosts: corp.iter().map(|s| s.parse().unwrap()).collect(),
            http_url: None,
            dns_probe: None,
            retry: RetryPolicy::new(1, Duration::ZERO, Backoff::Fixed),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn external_check_runs_tcp_ping_and_http() {
        let mut cfg = config(&[], &[]);
        cfg.http_url = Some("http://portal.test/".into());
        let prober = ScriptedProber::default().with_tcp("8.8.8.8", 53);
        let target = HostTarget::new("8.8.8.8", Some(53));

        let outcome = check_target(
            Classification::External,
            &target,
            &cfg,
            &prober,
            &Shutdown::new(),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.details.tcp, Some(true));
        assert_eq!(outcome.details.ping, Some(false));
        assert_eq!(outcome.details.http, Some(false));
        assert_eq!(outcome.details.http_url.as_deref(), Some("http://portal.test/"));
        assert_eq!(outcome.details.dns, None);
        assert_eq!(outcome.error, None);
        assert_eq!(
            prober.calls(),
            vec!["tcp 8.8.8.8:53", "ping 8.8.8.8", "http http://portal.test/"]
        );
    }

    #[tokio::test]
    async fn corporate_check_without_port_or_dns_has_no_probes() {
        let cfg = config(&[], &[]);
        let prober = ScriptedProber::default();
        let target = HostTarget::new("intranet", None);

        let outcome = check_target(
            Classification::Corporate,
            &target,
            &cfg,
            &prober,
            &Shutdown::new(),
        )
        .await;

        assert!(!outcome.success);
        assert!(outcome.details.is_empty());
        assert!(prober.calls().is_empty());
    }

    #[tokio::test]
    async fn corporate_check_uses_tcp_and_dns() {
        let mut cfg = config(&[], &[]);
        cfg.dns_probe = Some("intranet.corp.local".into());
        let prober = ScriptedProber {
            dns_up: true,
            ..Default::default()
        };
        let target = HostTarget::new("fileserver", Some(445));

        let outcome = check_target(
            Classification::Corporate,
            &target,
            &cfg,
            &prober,
            &Shutdown::new(),
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.details.tcp, Some(false));
        assert_eq!(outcome.details.dns, Some(true));
        assert_eq!(outcome.details.dns_probe.as_deref(), Some("intranet.corp.local"));
        assert_eq!(outcome.details.ping, None);
        assert_eq!(prober.calls(), vec!["tcp fileserver:445", "dns intranet.corp.local"]);
    }

    #[tokio::test]
    async fn cancellation_mid_check_forces_failure() {
        let shutdown = Shutdown::new();
        let prober = ScriptedProber {
            cancel_on_tcp: Some(shutdown.clone()),
            ..Default::default()
        }
        .with_tcp("8.8.8.8", 53);
        let mut cfg = config(&[], &[]);
        cfg.http_url = Some("http://portal.test/".into());
        let target = HostTarget::new("8.8.8.8", Some(53));

        let outcome =
            check_target(Classification::External, &target, &cfg, &prober, &shutdown).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED));
        assert_eq!(outcome.details.tcp, Some(true));
        // Probes skipped after cancellation did not run, so they are absent.
        assert_eq!(outcome.details.ping, None);
        assert_eq!(outcome.details.http, None);
        assert_eq!(outcome.details.http_url, None);
        assert_eq!(prober.calls(), vec!["tcp 8.8.8.8:53"]);
    }

    #[tokio::test]
    async fn tcp_success_alone_makes_internet_reachable() {
        let prober = ScriptedProber::default().with_tcp("8.8.8.8", 53);
        let checker = Checker::new(config(&["8.8.8.8:53"], &[]), prober, Shutdown::new());

        let result = checker.run().await;

        assert!(result.internet_ok);
        assert!(!result.corporate_ok);
        assert_eq!(result.exit_code(), 2);
        assert_eq!(result.internet_details.len(), 1);
        let outcome = &result.internet_details["external:8.8.8.8:53"];
        assert_eq!(outcome.details.tcp, Some(true));
        assert_eq!(outcome.details.ping, Some(false));
        assert_eq!(outcome.details.http, None);
    }

    #[tokio::test]
    async fn summary_counts_mixed_tcp_results() {
        let prober = ScriptedProber::default().with_tcp("10.0.0.1", 443);
        let checker = Checker::new(
            config(&["10.0.0.1:443", "10.0.0.2:443"], &[]),
            prober,
            Shutdown::new(),
        );

        let result = checker.run().await;

        assert!(result.internet_ok);
        assert_eq!(result.summary.external_checks, 2);
        assert_eq!(result.summary.successful, 1);
        assert_eq!(result.summary.failed, 1);
    }

    #[tokio::test]
    async fn fallback_probe_runs_once_after_fan_in() {
        let mut cfg = config(&["203.0.113.1:443"], &["intranet:445"]);
        cfg.http_url = Some("http://portal.test/".into());
        cfg.retry = RetryPolicy::new(3, Duration::ZERO, Backoff::Fixed);
        let prober = ScriptedProber::default();
        let checker = Checker::new(cfg, prober, Shutdown::new());

        let result = checker.run().await;

        assert!(!result.internet_ok);
        assert!(!result.corporate_ok);
        assert_eq!(result.exit_code(), 3);
        // 3 retried attempts inside the check plus one fallback attempt
        assert_eq!(checker.prober.http_calls.load(Ordering::SeqCst), 4);
        assert!(!result.internet_details.contains_key(FALLBACK_KEY));
    }

    #[tokio::test]
    async fn successful_fallback_adds_distinct_entry() {
        let mut cfg = config(&["203.0.113.1:443"], &[]);
        cfg.http_url = Some("http://portal.test/".into());
        // The in-check HTTP attempt fails, the fallback attempt succeeds.
        let prober = ScriptedProber {
            http_ok_from_call: Some(2),
            ..Default::default()
        };
        let checker = Checker::new(cfg, prober, Shutdown::new());

        let result = checker.run().await;

        assert!(result.internet_ok);
        assert_eq!(result.internet_details.len(), 2);
        assert!(!result.internet_details["external:203.0.113.1:443"].success);
        let fallback = &result.internet_details[FALLBACK_KEY];
        assert!(fallback.success);
        assert!(fallback.details.http_fallback);
        assert_eq!(result.summary.external_checks, 2);
        assert_eq!(result.summary.successful, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_yields_empty_result() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut cfg = config(&["8.8.8.8:53"], &["intranet:445"]);
        cfg.http_url = Some("http://portal.test/".into());
        let prober = ScriptedProber {
            http_up: true,
            ..Default::default()
        }
        .with_tcp("8.8.8.8", 53)
        .with_ping("8.8.8.8");
        let checker = Checker::new(cfg, prober, shutdown);

        let result = checker.run().await;

        assert!(result.internet_details.is_empty());
        assert!(result.corporate_details.is_empty());
        assert!(!result.internet_ok);
        assert!(!result.corporate_ok);
        assert_eq!(result.exit_code(), 3);
        assert_eq!(result.summary.total_checks, 0);
        assert!(checker.prober.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_recorded_outcomes_only() {
        let shutdown = Shutdown::new();
        let mut cfg = config(&["8.8.8.8:53", "1.1.1.1:53"], &["intranet:445"]);
        cfg.http_url = Some("http://portal.test/".into());
        cfg.dns_probe = Some("intranet.corp.local".into());
        let prober = ScriptedProber {
            http_up: true,
            dns_up: true,
            cancel_on_tcp: Some(shutdown.clone()),
            ..Default::default()
        }
        .with_tcp("8.8.8.8", 53)
        .with_tcp("1.1.1.1", 53);
        let checker = Checker::new(cfg, prober, shutdown);

        let result = checker.run().await;

        // The first task raised the cancel; the others had not started yet.
        assert_eq!(result.internet_details.len(), 1);
        let outcome = &result.internet_details["external:8.8.8.8:53"];
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED));
        assert!(!result.internet_details.contains_key("external:1.1.1.1:53"));
        assert!(!result.internet_details.contains_key(FALLBACK_KEY));
        assert!(result.corporate_details.is_empty());

        assert_eq!(result.summary.total_checks, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.corporate_checks, 0);
        assert_eq!(result.exit_code(), 3);
        assert_eq!(checker.prober.calls(), vec!["tcp 8.8.8.8:53"]);
        assert_eq!(checker.prober.http_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_targets_are_deduplicated() {
        let prober = ScriptedProber::default().with_ping("1.1.1.1");
        let checker = Checker::new(
            config(&["1.1.1.1:53", "1.1.1.1:53"], &["1.1.1.1:53"]),
            prober,
            Shutdown::new(),
        );

        let result = checker.run().await;

        assert_eq!(result.internet_details.len(), 1);
        assert_eq!(result.corporate_details.len(), 1);
        assert_eq!(result.summary.total_checks, 2);
        assert!(result.internet_ok);
        assert!(!result.corporate_ok);
        assert_eq!(result.exit_code(), 2);
    }
}
