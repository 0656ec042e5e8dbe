//! Bounded retry around a single boolean probe

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;

use crate::cancel::Shutdown;

/// How the delay between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles after each failed attempt
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `probe` until it returns true or attempts run out.
    ///
    /// Sleeps only between attempts, never after the last one. Cancellation
    /// is checked before every attempt and raced against both the probe and
    /// the sleep; once observed the policy returns false without retrying.
    pub async fn run<F, Fut>(&self, shutdown: &Shutdown, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut delay = self.delay;
        for attempt in 1..=self.attempts {
            if shutdown.is_cancelled() {
                tracing::debug!("Cancelled before attempt {}/{}", attempt, self.attempts);
                return false;
            }

            let ok = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                ok = probe() => ok,
            };
            if ok {
                return true;
            }

            if attempt < self.attempts {
                tracing::trace!(
                    "Attempt {}/{} failed, retrying in {:?}",
                    attempt,
                    self.attempts,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return false,
                    _ = sleep(delay) => {}
                }
                if self.backoff == Backoff::Exponential {
                    delay = delay.saturating_mul(2);
                }
            }
        }
        false
    }
}
