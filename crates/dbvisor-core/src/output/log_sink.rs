use super::{OutputSink, StreamKind};
use std::sync::Arc;
use tracing::Level;

/// Chooses the log level for a console line
pub trait LogDispatcher: Send + Sync {
    fn dispatch(&self, stream: StreamKind, line: &str) -> Level;
}

/// stdout at INFO, stderr at ERROR
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLogDispatcher;

impl LogDispatcher for DefaultLogDispatcher {
    fn dispatch(&self, stream: StreamKind, _line: &str) -> Level {
        match stream {
            StreamKind::Stdout => Level::INFO,
            StreamKind::Stderr => Level::ERROR,
        }
    }
}

/// For daemons that write all their chatter to stderr: stderr lines are only logged
/// at ERROR when they contain the marker, everything else goes to INFO.
#[derive(Debug, Clone)]
pub struct ErrorMarkerDispatcher {
    marker: String,
}

impl ErrorMarkerDispatcher {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for ErrorMarkerDispatcher {
    fn default() -> Self {
        Self::new("ERROR")
    }
}

impl LogDispatcher for ErrorMarkerDispatcher {
    fn dispatch(&self, stream: StreamKind, line: &str) -> Level {
        match stream {
            StreamKind::Stderr if line.contains(&self.marker) => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Forwards console lines to `tracing` under the `dbvisor::console` target
pub struct LogSink {
    process: String,
    stream: StreamKind,
    dispatcher: Arc<dyn LogDispatcher>,
}

impl LogSink {
    pub fn new(
        process: impl Into<String>,
        stream: StreamKind,
        dispatcher: Arc<dyn LogDispatcher>,
    ) -> Self {
        Self {
            process: process.into(),
            stream,
            dispatcher,
        }
    }
}

impl OutputSink for LogSink {
    fn consume(&self, line: &str) -> anyhow::Result<()> {
        let process = self.process.as_str();
        let stream = self.stream;
        match self.dispatcher.dispatch(stream, line) {
            Level::ERROR => tracing::error!(target: "dbvisor::console", process, %stream, "{line}"),
            Level::WARN => tracing::warn!(target: "dbvisor::console", process, %stream, "{line}"),
            Level::INFO => tracing::info!(target: "dbvisor::console", process, %stream, "{line}"),
            Level::DEBUG => tracing::debug!(target: "dbvisor::console", process, %stream, "{line}"),
            _ => tracing::trace!(target: "dbvisor::console", process, %stream, "{line}"),
        }
        Ok(())
    }
}
