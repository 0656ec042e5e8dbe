//! Reachability probes: TCP connect, DNS lookup, HTTP GET, ICMP echo

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;

/// Default captive-portal probe URL (answers 204 when the path is open)
pub const DEFAULT_HTTP_URL: &str = "https://www.google.com/generate_204";

pub const USER_AGENT: &str = concat!("netcheck/", env!("CARGO_PKG_VERSION"));

const PING_PAYLOAD: [u8; 56] = [0; 56];

/// One timeout-bounded reachability test per protocol.
///
/// Failures of any kind come back as `false`; nothing here returns an error.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn tcp(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// True iff `name` resolves to at least one address.
    async fn dns(&self, name: &str) -> bool;

    /// Any 2xx or 3xx answer counts; redirects are not followed.
    async fn http(&self, url: &str, timeout: Duration) -> bool;

    /// Sends up to `count` echoes, true on the first reply.
    async fn ping(&self, host: &str, timeout: Duration, count: u32) -> bool;
}

/// Probes backed by the real network stack
pub struct NetProber {
    http_client: reqwest::Client,
    resolver: TokioResolver,
    ping_v4: Option<PingClient>,
    ping_v6: Option<PingClient>,
}

impl NetProber {
    /// Must be called from within a tokio runtime (ICMP sockets register with it).
    pub fn new() -> anyhow::Result<Self> {
        Self::with_http_builder(reqwest::Client::builder())
    }

    fn with_http_builder(builder: reqwest::ClientBuilder) -> anyhow::Result<Self> {
        let http_client = builder
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                tracing::warn!(
                    "System resolver config unavailable ({}), using Cloudflare 1.1.1.1",
                    e
                );
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };

        let ping_v4 = match PingClient::new(&PingConfig::default()) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("ICMPv4 socket unavailable, ping probes will fail: {}", e);
                None
            }
        };
        let ping_v6 = match PingClient::new(&PingConfig::builder().kind(ICMP::V6).build()) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::debug!("ICMPv6 socket unavailable: {}", e);
                None
            }
        };

        Ok(Self {
            http_client,
            resolver,
            ping_v4,
            ping_v6,
        })
    }

    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next(),
            Err(e) => {
                tracing::debug!("Resolving {} failed: {}", host, e);
                None
            }
        }
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn tcp(&self, host: &str, port: u16, timeout: Duration) -> bool {
        tracing::debug!("TCP connect {}:{} (timeout {:?})", host, port, timeout);
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                tracing::debug!("TCP {}:{}: OK", host, port);
                true
            }
            Ok(Err(e)) => {
                tracing::debug!("TCP {}:{}: {}", host, port, e);
                false
            }
            Err(_) => {
                tracing::debug!("TCP {}:{}: timed out", host, port);
                false
            }
        }
    }

    async fn dns(&self, name: &str) -> bool {
        tracing::debug!("DNS lookup {}", name);
        let result = match self.resolver.lookup_ip(name).await {
            Ok(lookup) => lookup.iter().next().is_some(),
            Err(e) => {
                tracing::debug!("DNS {}: {}", name, e);
                false
            }
        };
        if result {
            tracing::debug!("DNS {}: OK", name);
        }
        result
    }

    async fn http(&self, url: &str, timeout: Duration) -> bool {
        tracing::debug!("Requesting {} (timeout {:?})", url, timeout);
        let result = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "*/*")
            .timeout(timeout)
            .send()
            .await
            .map(|r| {
                let status = r.status();
                status.is_success() || status.is_redirection()
            })
            .unwrap_or(false);
        if result {
            tracing::debug!("HTTP probe {}: OK", url);
        } else {
            tracing::debug!("HTTP probe {}: failed or timeout", url);
        }
        result
    }

    async fn ping(&self, host: &str, timeout: Duration, count: u32) -> bool {
        let Ok(Some(ip)) = tokio::time::timeout(timeout, self.resolve(host)).await else {
            tracing::debug!("Ping {}: could not resolve within {:?}", host, timeout);
            return false;
        };
        let client = match ip {
            IpAddr::V4(_) => self.ping_v4.as_ref(),
            IpAddr::V6(_) => self.ping_v6.as_ref(),
        };
        let Some(client) = client else {
            tracing::debug!("Ping {}: no ICMP socket for {}", host, ip);
            return false;
        };

        let count = count.max(1);
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout / count);

        let echoes = async {
            for seq in 0..count {
                match pinger.ping(PingSequence(seq as u16), &PING_PAYLOAD).await {
                    Ok((_, rtt)) => {
                        tracing::debug!("Ping {} ({}): reply in {:?}", host, ip, rtt);
                        return true;
                    }
                    Err(e) => tracing::debug!("Ping {} ({}) seq {}: {}", host, ip, seq, e),
                }
            }
            false
        };
        tokio::time::timeout(timeout, echoes).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Ignores proxy environment variables so loopback servers are reached directly.
    fn prober() -> NetProber {
        NetProber::with_http_builder(reqwest::Client::builder().no_proxy()).unwrap()
    }

    /// Minimal HTTP server answering every request with `status_line`.
    async fn serve_status(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nLocation: http://127.0.0.1:1/elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/generate_204", addr)
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { while listener.accept().await.is_ok() {} });

        let prober = prober();
        assert!(prober.tcp("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = prober();
        assert!(!prober.tcp("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn http_probe_accepts_no_content() {
        let url = serve_status("204 No Content").await;
        let prober = prober();
        assert!(prober.http(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn http_probe_accepts_redirect_without_following() {
        let url = serve_status("302 Found").await;
        let prober = prober();
        assert!(prober.http(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn http_probe_rejects_client_error() {
        let url = serve_status("404 Not Found").await;
        let prober = prober();
        assert!(!prober.http(&url, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn http_probe_rejects_malformed_url() {
        let prober = prober();
        assert!(!prober.http("not a url", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn ping_of_unresolvable_name_fails() {
        let prober = prober();
        assert!(
            !prober
                .ping("host.invalid", Duration::from_millis(200), 1)
                .await
        );
    }
}
