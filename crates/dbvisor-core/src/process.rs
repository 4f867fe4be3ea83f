use crate::config::ProcessSpec;
use crate::error::SupervisorError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Unique identifier for a process
pub type ProcessId = u32;

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitValue {
    /// Natural exit with the given code
    Code(i32),
    /// Killed by a signal the supervisor did not send (Unix only)
    Signal(i32),
    /// Killed through `destroy()`; no natural exit code is available
    Destroyed,
}

impl ExitValue {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitValue::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitValue::Signal(signal);
            }
        }

        ExitValue::Destroyed
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitValue::Code(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, ExitValue::Destroyed)
    }
}

impl fmt::Display for ExitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitValue::Code(code) => write!(f, "exit code {code}"),
            ExitValue::Signal(signal) => write!(f, "signal {signal}"),
            ExitValue::Destroyed => f.write_str("explicit kill"),
        }
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Starting,
    Running,
    Exited,
    Destroyed,
}

impl ProcessState {
    pub fn was_started(&self) -> bool {
        !matches!(self, ProcessState::Created)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Both outcomes leave no process behind
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Platform hooks for spawning and forcefully terminating a daemon together with
/// everything it forked.
///
/// Implementations live in the platform crates. `terminate_tree` is synchronous so it
/// can also run from cleanup hooks and `Drop` implementations.
pub trait ProcessTermination: Send + Sync {
    /// Adjust the command before spawning, e.g. to give the child its own process group
    fn configure(&self, command: &mut tokio::process::Command);

    /// Forcefully kill the process and all of its descendants
    fn terminate_tree(&self, pid: ProcessId) -> TerminationResult;

    /// Platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Shared state of one supervised process.
///
/// `alive` is the single source of truth for usability. It drops to `false` as soon as
/// the OS process is reaped ([`ProcessHandle::mark_reaped`]), which can be well before
/// the exit value is published: [`ProcessHandle::record_exit`] runs only after the
/// console streams were drained, and it is the only writer of the exit value.
#[derive(Debug)]
pub struct ProcessHandle {
    short_name: String,
    long_name: String,
    alive: AtomicBool,
    recorded: AtomicBool,
    state: Mutex<ProcessState>,
    reaped: watch::Sender<bool>,
    exit: watch::Sender<Option<ExitValue>>,
}

impl ProcessHandle {
    pub fn new(spec: &ProcessSpec) -> Self {
        let (exit, _) = watch::channel(None);
        let (reaped, _) = watch::channel(false);
        Self {
            short_name: spec.short_name(),
            long_name: spec.long_name(),
            alive: AtomicBool::new(false),
            recorded: AtomicBool::new(false),
            state: Mutex::new(ProcessState::Created),
            reaped,
            exit,
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn long_name(&self) -> &str {
        &self.long_name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_value(&self) -> Option<ExitValue> {
        *self.exit.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ExitValue>> {
        self.exit.subscribe()
    }

    /// `Created → Starting`. Any other state means `start()` was already called.
    pub fn begin_start(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ProcessState::Created => {
                *state = ProcessState::Starting;
                Ok(())
            }
            ProcessState::Starting | ProcessState::Running => Err(SupervisorError::AlreadyRunning {
                name: self.short_name.clone(),
            }),
            other => Err(SupervisorError::AlreadyStarted {
                name: self.short_name.clone(),
                state: other,
            }),
        }
    }

    /// Spawn failed: the handle counts as never started.
    pub fn abort_start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ProcessState::Starting {
            *state = ProcessState::Created;
        }
    }

    /// `Starting → Running`, set before the exit observer is spawned.
    pub fn mark_running(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = ProcessState::Running;
        self.alive.store(true, Ordering::SeqCst);
    }

    /// The OS process is gone. `alive` turns `false` here even though the exit value may
    /// only be published later.
    pub fn mark_reaped(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reaped.send_replace(true);
    }

    /// Resolves once the OS process was reaped
    pub async fn reaped(&self) {
        let mut reaped = self.reaped.subscribe();
        // the sender lives in `self`, so the channel cannot close while we borrow it
        let _ = reaped.wait_for(|reaped| *reaped).await;
    }

    /// Records the exit, marking the process reaped if that did not happen yet. Returns
    /// `false` when the exit was already recorded, in which case nothing changes.
    ///
    /// `on_recorded` runs after the state change and before any waiter is woken.
    pub fn record_exit<F: FnOnce(ExitValue)>(&self, exit: ExitValue, on_recorded: F) -> bool {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.mark_reaped();

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state = if exit.is_destroyed() {
                ProcessState::Destroyed
            } else {
                ProcessState::Exited
            };
        }
        on_recorded(exit);
        self.exit.send_replace(Some(exit));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ProcessHandle {
        let spec = ProcessSpec::builder()
            .executable("/usr/sbin/mysqld")
            .arg("--port=3306")
            .build()
            .unwrap();
        ProcessHandle::new(&spec)
    }

    #[test]
    fn test_names_come_from_spec() {
        let handle = handle();
        assert_eq!(handle.short_name(), "mysqld");
        assert!(handle.long_name().contains("--port=3306"));
        assert!(handle.long_name().contains("/usr/sbin"));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let handle = handle();
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(!handle.is_alive());

        handle.begin_start().unwrap();
        assert!(matches!(
            handle.begin_start(),
            Err(SupervisorError::AlreadyRunning { .. })
        ));
        handle.mark_running();
        assert!(handle.is_alive());

        assert!(handle.record_exit(ExitValue::Code(0), |_| {}));
        assert!(!handle.is_alive());
        assert_eq!(handle.state(), ProcessState::Exited);
        assert_eq!(handle.exit_value(), Some(ExitValue::Code(0)));

        assert!(matches!(
            handle.begin_start(),
            Err(SupervisorError::AlreadyStarted {
                state: ProcessState::Exited,
                ..
            })
        ));
    }

    #[test]
    fn test_exit_is_recorded_once() {
        let handle = handle();
        handle.begin_start().unwrap();
        handle.mark_running();

        assert!(handle.record_exit(ExitValue::Destroyed, |_| {}));
        assert!(!handle.record_exit(ExitValue::Code(0), |_| {}));
        assert_eq!(handle.exit_value(), Some(ExitValue::Destroyed));
        assert_eq!(handle.state(), ProcessState::Destroyed);
    }

    #[tokio::test]
    async fn test_reaped_before_exit_is_published() {
        let handle = handle();
        handle.begin_start().unwrap();
        handle.mark_running();

        handle.mark_reaped();
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_value(), None);
        assert_eq!(handle.state(), ProcessState::Running);
        handle.reaped().await;

        assert!(handle.record_exit(ExitValue::Code(1), |_| {}));
        assert_eq!(handle.exit_value(), Some(ExitValue::Code(1)));
        assert_eq!(handle.state(), ProcessState::Exited);
    }

    #[test]
    fn test_aborted_start_returns_to_created() {
        let handle = handle();
        handle.begin_start().unwrap();
        handle.abort_start();
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(handle.begin_start().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_value_from_status() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            ExitValue::from_status(std::process::ExitStatus::from_raw(3 << 8)),
            ExitValue::Code(3)
        );
        assert_eq!(
            ExitValue::from_status(std::process::ExitStatus::from_raw(9)),
            ExitValue::Signal(9)
        );
        assert_eq!(format!("{}", ExitValue::Destroyed), "explicit kill");
    }
}
