use crate::process::{ExitValue, ProcessState};
use std::time::Duration;
use thiserror::Error;

/// Core error types for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch {command_line} (in {working_directory}): {source}")]
    Launch {
        command_line: String,
        working_directory: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Process {name} was already started once and is now {state}; processes cannot be restarted")]
    AlreadyStarted { name: String, state: ProcessState },

    #[error("Process {name} was never started")]
    NeverStarted { name: String },

    #[error("Process {name} is not running")]
    NotRunning { name: String },

    #[error("Process {name} has not exited yet")]
    StillRunning { name: String },

    #[error(
        "{long_name} exited with {exit} before printing {pattern:?}; last console output:\n{tail}"
    )]
    UnexpectedExit {
        long_name: String,
        pattern: String,
        exit: ExitValue,
        tail: String,
    },

    #[error("{long_name} was not reaped within {waited:?} after being killed")]
    ReapTimeout { long_name: String, waited: Duration },

    #[error("{long_name} did not exit within {timeout:?}")]
    AttemptTimedOut { long_name: String, timeout: Duration },

    #[error("{long_name} failed with {exit}; last console output:\n{tail}")]
    FailedExit {
        long_name: String,
        exit: ExitValue,
        tail: String,
    },

    #[error("Installation did not succeed after {attempts} attempt(s)")]
    InstallRetryExhausted {
        attempts: u32,
        #[source]
        source: Box<SupervisorError>,
    },

    #[error("Invalid console pattern {0:?}: it must not contain a line break")]
    InvalidPattern(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Exit observer for {name} went away without reporting an exit value")]
    ObserverLost { name: String },

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Calls made in the wrong lifecycle order. These are always surfaced to the caller.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::AlreadyRunning { .. }
                | SupervisorError::AlreadyStarted { .. }
                | SupervisorError::NeverStarted { .. }
                | SupervisorError::NotRunning { .. }
                | SupervisorError::StillRunning { .. }
        )
    }

    /// Whether a bounded-retry installer may try again with a fresh process
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::AttemptTimedOut { .. } | SupervisorError::FailedExit { .. }
        )
    }
}

/// Aggregated failure of one or more sinks for a single write
#[derive(Error, Debug)]
#[error("{} of {attempted} output sink call(s) failed: {}", failures.len(), summary(failures))]
pub struct MultiplexError {
    pub attempted: usize,
    pub failures: Vec<anyhow::Error>,
}

impl MultiplexError {
    pub(crate) fn merge(&mut self, other: MultiplexError) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }
}

/// Aggregated failure of cleanup hooks
#[derive(Error, Debug)]
#[error("{} cleanup hook(s) failed: {}", failures.len(), summary(failures))]
pub struct CleanupError {
    pub failures: Vec<anyhow::Error>,
}

fn summary(failures: &[anyhow::Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(SupervisorError::NeverStarted { name: "mysqld".into() }.is_usage_error());
        assert!(SupervisorError::NotRunning { name: "mysqld".into() }.is_usage_error());
        assert!(SupervisorError::AlreadyRunning { name: "mysqld".into() }.is_usage_error());
        assert!(!SupervisorError::Configuration("x".into()).is_usage_error());

        assert!(
            SupervisorError::AttemptTimedOut {
                long_name: "mysql_install_db".into(),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!SupervisorError::NotRunning { name: "mysqld".into() }.is_retryable());
    }

    #[test]
    fn test_unexpected_exit_display_carries_tail() {
        let error = SupervisorError::UnexpectedExit {
            long_name: "/usr/sbin/mysqld --port=3306 (in /usr/sbin)".into(),
            pattern: "ready for connections".into(),
            exit: ExitValue::Code(1),
            tail: "[ERROR] Can't start server".into(),
        };
        let display = format!("{error}");
        assert!(display.contains("--port=3306"));
        assert!(display.contains("exit code 1"));
        assert!(display.contains("[ERROR] Can't start server"));
    }

    #[test]
    fn test_retry_exhausted_keeps_source() {
        let error = SupervisorError::InstallRetryExhausted {
            attempts: 3,
            source: Box::new(SupervisorError::AttemptTimedOut {
                long_name: "install".into(),
                timeout: Duration::from_millis(100),
            }),
        };
        assert!(format!("{error}").contains("3 attempt(s)"));
        let source = std::error::Error::source(&error).map(|s| s.to_string());
        assert!(source.unwrap().contains("did not exit within"));
    }

    #[test]
    fn test_multiplex_error_display() {
        let error = MultiplexError {
            attempted: 3,
            failures: vec![anyhow::anyhow!("disk full")],
        };
        assert_eq!(format!("{error}"), "1 of 3 output sink call(s) failed: disk full");
    }
}
