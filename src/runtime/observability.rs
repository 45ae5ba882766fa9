//! Structured logging setup and runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use durable_workflow::runtime::observability::{ObservabilityConfig, LogFormat, init_logging};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// init_logging(&config).ok();
/// ```
///
/// Runtime lines carry `instance_id`, and activity lines also carry
/// `task_id`, `activity_name`, `attempt` and `worker`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to the crate's own targets (e.g. "info", "debug")
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!(
        "warn,durable_workflow::runtime={level},durable_workflow::workflow={level},durable_workflow::activity={level},durable_workflow::client={level}"
    )
}

/// Install a global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails if a global subscriber is already set, which callers running
/// several runtimes in one process can ignore.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub workflow_completions: u64,
    pub workflow_failures: u64,
    pub workflow_terminations: u64,
    pub activity_success: u64,
    pub activity_failures: u64,
    pub activity_retries: u64,
    pub activity_timeouts: u64,
    pub append_conflicts: u64,
}

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    workflow_completions: AtomicU64,
    workflow_failures: AtomicU64,
    workflow_terminations: AtomicU64,
    activity_success: AtomicU64,
    activity_failures: AtomicU64,
    activity_retries: AtomicU64,
    activity_timeouts: AtomicU64,
    append_conflicts: AtomicU64,
}

impl RuntimeMetrics {
    #[inline]
    pub fn record_workflow_completion(&self) {
        self.workflow_completions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_workflow_failure(&self) {
        self.workflow_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_workflow_termination(&self) {
        self.workflow_terminations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_failure(&self) {
        self.activity_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_retry(&self) {
        self.activity_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_timeout(&self) {
        self.activity_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_append_conflict(&self) {
        self.append_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workflow_completions: self.workflow_completions.load(Ordering::Relaxed),
            workflow_failures: self.workflow_failures.load(Ordering::Relaxed),
            workflow_terminations: self.workflow_terminations.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            activity_retries: self.activity_retries.load(Ordering::Relaxed),
            activity_timeouts: self.activity_timeouts.load(Ordering::Relaxed),
            append_conflicts: self.append_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_snapshot() {
        let m = RuntimeMetrics::default();
        m.record_workflow_completion();
        m.record_activity_retry();
        m.record_activity_retry();
        m.record_append_conflict();
        let snap = m.snapshot();
        assert_eq!(snap.workflow_completions, 1);
        assert_eq!(snap.activity_retries, 2);
        assert_eq!(snap.append_conflicts, 1);
        assert_eq!(snap.workflow_failures, 0);
    }

    #[test]
    fn default_filter_scopes_crate_targets() {
        let expr = default_filter_expression("debug");
        assert!(expr.starts_with("warn,"));
        assert!(expr.contains("durable_workflow::workflow=debug"));
        assert!(EnvFilter::try_new(expr).is_ok());
    }
}
