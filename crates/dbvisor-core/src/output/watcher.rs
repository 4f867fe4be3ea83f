use super::OutputSink;
use crate::error::SupervisorError;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Sink that remembers whether a literal substring has shown up in the console.
///
/// The flag only ever goes from `false` to `true`.
#[derive(Debug)]
pub struct ConsoleMessageWatcher {
    pattern: String,
    seen: AtomicBool,
    notify: Notify,
}

impl ConsoleMessageWatcher {
    pub fn new(pattern: impl Into<String>) -> Result<Self, SupervisorError> {
        let pattern = pattern.into();
        if pattern.contains(['\n', '\r']) {
            return Err(SupervisorError::InvalidPattern(pattern));
        }

        Ok(Self {
            pattern,
            seen: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn has_seen_it(&self) -> bool {
        self.seen.load(Ordering::SeqCst)
    }

    /// Resolves once the pattern has been seen
    pub async fn seen(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_seen_it() {
                return;
            }
            notified.await;
        }
    }
}

impl OutputSink for ConsoleMessageWatcher {
    fn consume(&self, line: &str) -> anyhow::Result<()> {
        if !self.has_seen_it() && line.contains(&self.pattern) {
            self.seen.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
