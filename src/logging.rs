//! Replay-safe logging for workflow code.
//!
//! Workflow code runs again on every turn, so a naive `tracing::info!` would
//! repeat for each replay. Log calls made through the context are buffered
//! only when they belong to newly observed progress, and the runtime emits
//! the buffer after the turn's events are persisted.

use crate::WorkflowContext;

/// Target used for every line emitted on behalf of workflow code.
pub const WORKFLOW_LOG_TARGET: &str = "durable_workflow::workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A buffered log line produced during one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub category: String,
    pub message: String,
}

/// Emit buffered records through `tracing` for `instance_id`.
pub(crate) fn emit_records(instance_id: &str, records: &[LogRecord]) {
    for r in records {
        match r.level {
            LogLevel::Debug => {
                tracing::debug!(target: WORKFLOW_LOG_TARGET, instance_id = %instance_id, category = %r.category, "{}", r.message)
            }
            LogLevel::Info => {
                tracing::info!(target: WORKFLOW_LOG_TARGET, instance_id = %instance_id, category = %r.category, "{}", r.message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: WORKFLOW_LOG_TARGET, instance_id = %instance_id, category = %r.category, "{}", r.message)
            }
            LogLevel::Error => {
                tracing::error!(target: WORKFLOW_LOG_TARGET, instance_id = %instance_id, category = %r.category, "{}", r.message)
            }
        }
    }
}

/// Logger bound to a category that drops lines while the code is replaying.
#[derive(Clone)]
pub struct ReplaySafeLogger {
    category: String,
    ctx: WorkflowContext,
}

impl ReplaySafeLogger {
    pub(crate) fn new(category: String, ctx: WorkflowContext) -> Self {
        Self { category, ctx }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Record `message` only when `newly_observed` is true.
    pub fn log(&self, level: LogLevel, newly_observed: bool, message: impl Into<String>) {
        self.ctx
            .log_with_category(level, newly_observed, &self.category, message.into());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, !self.ctx.is_replaying(), message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, !self.ctx.is_replaying(), message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, !self.ctx.is_replaying(), message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, !self.ctx.is_replaying(), message);
    }
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        let newly_observed = !$ctx.is_replaying();
        $ctx.log($crate::logging::LogLevel::Info, newly_observed, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        let newly_observed = !$ctx.is_replaying();
        $ctx.log($crate::logging::LogLevel::Warn, newly_observed, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        let newly_observed = !$ctx.is_replaying();
        $ctx.log($crate::logging::LogLevel::Error, newly_observed, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        let newly_observed = !$ctx.is_replaying();
        $ctx.log($crate::logging::LogLevel::Debug, newly_observed, format!($($arg)+));
    }};
}
