//! Per-run metrics export
//!
//! Sinks receive the finished [`RunResult`] once. Counters are reported per
//! classification, for both paths alike.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::result::{Classification, RunResult};

pub trait MetricsSink: Send + Sync {
    fn record(&self, result: &RunResult) -> anyhow::Result<()>;
}

/// Emits the run metrics as one structured log event
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, result: &RunResult) -> anyhow::Result<()> {
        let s = &result.summary;
        tracing::info!(
            internet_up = result.internet_ok,
            corporate_up = result.corporate_ok,
            duration_seconds = result.elapsed.as_secs_f64(),
            external_checks = s.external_checks,
            external_successful = s.external_successful,
            external_failed = s.external_failed(),
            corporate_checks = s.corporate_checks,
            corporate_successful = s.corporate_successful,
            corporate_failed = s.corporate_failed(),
            "run metrics"
        );
        Ok(())
    }
}

/// Writes a Prometheus text exposition file, e.g. for node_exporter's
/// textfile collector. The file is replaced atomically on every run.
pub struct TextfileSink {
    path: PathBuf,
}

impl TextfileSink {
    /// Fails if the target directory does not exist.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        if !dir.is_dir() {
            anyhow::bail!(
                "Metrics directory {} does not exist (metrics file {})",
                dir.display(),
                path.display()
            );
        }
        Ok(Self { path })
    }

    pub fn render(result: &RunResult) -> String {
        let s = &result.summary;
        let mut out = String::new();

        gauge(
            &mut out,
            "netcheck_internet_up",
            "Internet reachable (1/0)",
            u8::from(result.internet_ok).into(),
        );
        gauge(
            &mut out,
            "netcheck_corporate_up",
            "Corporate network reachable (1/0)",
            u8::from(result.corporate_ok).into(),
        );
        gauge(
            &mut out,
            "netcheck_check_duration_seconds",
            "Duration of the last run in seconds",
            result.elapsed.as_secs_f64(),
        );

        let per_type = [
            (
                Classification::External,
                [s.external_checks, s.external_successful, s.external_failed()],
            ),
            (
                Classification::Corporate,
                [s.corporate_checks, s.corporate_successful, s.corporate_failed()],
            ),
        ];
        let families = [
            ("netcheck_checks_total", "Checks performed in the last run"),
            ("netcheck_checks_success_total", "Successful checks in the last run"),
            ("netcheck_checks_failed_total", "Failed checks in the last run"),
        ];
        for (column, (name, help)) in families.into_iter().enumerate() {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            for (classification, counts) in &per_type {
                let _ = writeln!(out, "{}{{type=\"{}\"}} {}", name, classification, counts[column]);
            }
        }
        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
}

impl MetricsSink for TextfileSink {
    fn record(&self, result: &RunResult) -> anyhow::Result<()> {
        let file_name = self
            .path
            .file_name()
            .with_context(|| format!("Invalid metrics file path {}", self.path.display()))?;
        let tmp = self
            .path
            .with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        std::fs::write(&tmp, Self::render(result))
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        tracing::debug!("Metrics written to {}", self.path.display());
        Ok(())
    }
}

/// Sinks for this run: always the log sink, plus the textfile sink if configured.
pub fn sinks(metrics_file: Option<&Path>) -> anyhow::Result<Vec<Box<dyn MetricsSink>>> {
    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink)];
    if let Some(path) = metrics_file {
        sinks.push(Box::new(TextfileSink::new(path)?));
    }
    Ok(sinks)
}
