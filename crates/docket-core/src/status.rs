//! Progress and diagnostic reporting.

/// Sink for human-readable progress notices and diagnostic detail.
///
/// `status` carries short notices meant for a status line ("starting…",
/// "success; no output"). `log` carries raw detail such as stream output and
/// kernel status transitions.
pub trait StatusSink: Send + Sync {
    /// Report a short progress notice.
    fn status(&self, message: &str);

    /// Record diagnostic detail.
    fn log(&self, message: &str);
}

/// Sink that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn status(&self, message: &str) {
        tracing::info!(target: "docket::status", "{}", message);
    }

    fn log(&self, message: &str) {
        tracing::debug!(target: "docket::log", "{}", message);
    }
}
