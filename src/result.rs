//! Check outcomes and the immutable result of one run

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Map key of the synthesized outcome recorded by the HTTP fallback probe
pub const FALLBACK_KEY: &str = "http_fallback";

/// Which monitored path a target belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    External,
    Corporate,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::External => "external",
            Classification::Corporate => "corporate",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-probe verdicts of one check. `None` means the probe did not run,
/// which is different from having failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_probe: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub http_fallback: bool,
}

impl ProbeDetail {
    fn verdicts(&self) -> [(&'static str, Option<bool>); 4] {
        [
            ("tcp", self.tcp),
            ("ping", self.ping),
            ("http", self.http),
            ("dns", self.dns),
        ]
    }

    /// True iff at least one probe ran and succeeded
    pub fn any_success(&self) -> bool {
        self.verdicts().iter().any(|(_, ok)| *ok == Some(true))
    }

    /// True iff no probe ran
    pub fn is_empty(&self) -> bool {
        self.verdicts().iter().all(|(_, ok)| ok.is_none())
    }
}

impl fmt::Display for ProbeDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no probes");
        }
        let mut first = true;
        for (name, ok) in self.verdicts() {
            let Some(ok) = ok else { continue };
            if !first {
                f.write_char(' ')?;
            }
            first = false;
            write!(f, "{}={}", name, if ok { "ok" } else { "fail" })?;
        }
        if self.http_fallback {
            f.write_str(" (fallback)")?;
        }
        Ok(())
    }
}

/// Result of running the relevant probes against one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    #[serde(rename = "type")]
    pub classification: Classification,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub details: ProbeDetail,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl CheckOutcome {
    /// `classification:host:port`, port 0 when absent
    pub fn key(&self) -> String {
        outcome_key(self.classification, &self.host, self.port)
    }

    /// Outcome recorded when the post-run HTTP fallback succeeds
    pub fn fallback(url: &str, duration: Duration) -> Self {
        Self {
            classification: Classification::External,
            host: url.to_string(),
            port: None,
            success: true,
            error: None,
            details: ProbeDetail {
                http: Some(true),
                http_url: Some(url.to_string()),
                http_fallback: true,
                ..Default::default()
            },
            duration,
            timestamp: Utc::now(),
        }
    }
}

pub fn outcome_key(classification: Classification, host: &str, port: Option<u16>) -> String {
    format!("{}:{}:{}", classification, host, port.unwrap_or(0))
}

pub type OutcomeMap = BTreeMap<String, CheckOutcome>;

/// Counters derived from the final outcome maps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_checks: usize,
    pub successful: usize,
    pub failed: usize,
    pub external_checks: usize,
    pub corporate_checks: usize,
    pub external_successful: usize,
    pub corporate_successful: usize,
}

impl RunSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a CheckOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.total_checks += 1;
            if outcome.success {
                summary.successful += 1;
            } else {
                summary.failed += 1;
            }
            match outcome.classification {
                Classification::External => {
                    summary.external_checks += 1;
                    summary.external_successful += usize::from(outcome.success);
                }
                Classification::Corporate => {
                    summary.corporate_checks += 1;
                    summary.corporate_successful += usize::from(outcome.success);
                }
            }
        }
        summary
    }

    pub fn external_failed(&self) -> usize {
        self.external_checks - self.external_successful
    }

    pub fn corporate_failed(&self) -> usize {
        self.corporate_checks - self.corporate_successful
    }
}

/// Everything one run produced. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    #[serde(rename = "internet")]
    pub internet_ok: bool,
    #[serde(rename = "corporate")]
    pub corporate_ok: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "elapsed_s", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub internet_details: OutcomeMap,
    pub corporate_details: OutcomeMap,
    pub summary: RunSummary,
}

impl RunResult {
    /// 0 both paths up, 1 internet down, 2 corporate down, 3 both down
    pub fn exit_code(&self) -> u8 {
        exit_code(self.internet_ok, self.corporate_ok)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct View<'a> {
            #[serde(flatten)]
            result: &'a RunResult,
            exit_code: u8,
        }
        serde_json::to_string_pretty(&View {
            result: self,
            exit_code: self.exit_code(),
        })
    }

    pub fn render_human(&self) -> String {
        let status = if self.internet_ok && self.corporate_ok {
            "✅"
        } else {
            "❌"
        };
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "NetCheck Results {}", status);
        let _ = writeln!(out, "Internet:  {}", self.internet_ok);
        let _ = writeln!(out, "Corporate: {}", self.corporate_ok);
        let _ = writeln!(out, "Duration:  {:.3}s", self.elapsed.as_secs_f64());
        let _ = writeln!(
            out,
            "Checks:    {} total ({} external, {} corporate)",
            self.summary.total_checks, self.summary.external_checks, self.summary.corporate_checks
        );
        let _ = writeln!(
            out,
            "Success:   {}/{}",
            self.summary.successful, self.summary.total_checks
        );
        for (key, outcome) in self.internet_details.iter().chain(&self.corporate_details) {
            let mark = if outcome.success { "ok  " } else { "FAIL" };
            let _ = write!(
                out,
                "  [{}] {} {} ({}ms)",
                mark,
                key,
                outcome.details,
                outcome.duration.as_millis()
            );
            if let Some(error) = &outcome.error {
                let _ = write!(out, " error: {}", error);
            }
            out.push('\n');
        }
        out
    }
}

pub fn exit_code(internet_ok: bool, corporate_ok: bool) -> u8 {
    match (internet_ok, corporate_ok) {
        (true, true) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (false, false) => 3,
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
