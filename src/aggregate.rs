//! Reduce per-target outcomes into the two path verdicts

use std::future::Future;
use std::time::Instant;

use crate::result::{CheckOutcome, Classification, OutcomeMap, RunSummary, FALLBACK_KEY};

/// Outcomes gathered by the orchestrator, bucketed by classification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collected {
    pub external: OutcomeMap,
    pub corporate: OutcomeMap,
}

impl Collected {
    /// Later outcomes with the same key replace earlier ones.
    pub fn insert(&mut self, outcome: CheckOutcome) {
        let bucket = match outcome.classification {
            Classification::External => &mut self.external,
            Classification::Corporate => &mut self.corporate,
        };
        bucket.insert(outcome.key(), outcome);
    }

    pub fn len(&self) -> usize {
        self.external.len() + self.corporate.len()
    }
}

impl FromIterator<CheckOutcome> for Collected {
    fn from_iter<I: IntoIterator<Item = CheckOutcome>>(iter: I) -> Self {
        let mut collected = Self::default();
        for outcome in iter {
            collected.insert(outcome);
        }
        collected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub internet_ok: bool,
    pub corporate_ok: bool,
    pub outcomes: Collected,
    pub summary: RunSummary,
}

/// Fold outcomes into the verdict, without any probing.
pub fn reduce(outcomes: Collected) -> Verdict {
    let internet_ok = outcomes.external.values().any(|o| o.success);
    let corporate_ok = outcomes.corporate.values().any(|o| o.success);
    let summary = RunSummary::from_outcomes(
        outcomes.external.values().chain(outcomes.corporate.values()),
    );
    Verdict {
        internet_ok,
        corporate_ok,
        outcomes,
        summary,
    }
}

/// Fold outcomes into the verdict.
///
/// When no external outcome succeeded and a `fallback` is supplied, it is
/// awaited once (no retry). A successful fallback adds a synthesized outcome
/// under [`FALLBACK_KEY`] and marks the internet path reachable. The summary
/// is computed afterwards so it includes that outcome.
pub async fn aggregate<F, Fut>(mut outcomes: Collected, fallback: Option<(&str, F)>) -> Verdict
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = bool>,
{
    let any_external = outcomes.external.values().any(|o| o.success);
    if !any_external {
        if let Some((url, probe)) = fallback {
            tracing::info!("No external target reachable, trying HTTP fallback {}", url);
            let started = Instant::now();
            if probe().await {
                tracing::info!("HTTP fallback {} succeeded", url);
                outcomes.external.insert(
                    FALLBACK_KEY.to_string(),
                    CheckOutcome::fallback(url, started.elapsed()),
                );
            } else {
                tracing::debug!("HTTP fallback {} failed", url);
            }
        }
    }
    reduce(outcomes)
}
