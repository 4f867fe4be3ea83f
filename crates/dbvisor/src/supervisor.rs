use crate::exit_waiter::ExitWaiter;
use crate::factory::PlatformTerminationFactory;
use crate::launcher::ProcessLauncher;
use crate::listener::ProcessListener;
use dbvisor_core::{
    CleanupRegistry, CleanupToken, ConsoleMessageWatcher, DefaultLogDispatcher, ExitValue,
    LogDispatcher, LogSink, OutputMultiplexer, OutputSink, ProcessHandle, ProcessId, ProcessSpec,
    ProcessState, ProcessTermination, RollingLogBuffer, StreamKind, SupervisorConfig,
    SupervisorError,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Owns one external daemon from launch to teardown.
///
/// A supervisor runs its process at most once. Console output of both streams lands in a
/// shared rolling buffer and in `tracing`; callers can attach their own sinks through
/// [`ProcessSupervisor::stdout`] and [`ProcessSupervisor::stderr`].
pub struct ProcessSupervisor {
    spec: ProcessSpec,
    config: SupervisorConfig,
    handle: Arc<ProcessHandle>,
    stdout: Arc<OutputMultiplexer>,
    stderr: Arc<OutputMultiplexer>,
    console: Arc<RollingLogBuffer>,
    termination: Arc<dyn ProcessTermination>,
    dispatcher: Arc<dyn LogDispatcher>,
    listeners: Vec<Arc<dyn ProcessListener>>,
    cleanup: Option<Arc<CleanupRegistry>>,
    cleanup_token: Arc<Mutex<Option<CleanupToken>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    pid: Mutex<Option<ProcessId>>,
}

impl ProcessSupervisor {
    pub fn new(spec: ProcessSpec) -> Result<Self, SupervisorError> {
        Self::with_config(spec, SupervisorConfig::default())
    }

    pub fn with_config(spec: ProcessSpec, config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config
            .validate()
            .map_err(|e| SupervisorError::Configuration(format!("Invalid supervisor config: {e}")))?;

        let handle = Arc::new(ProcessHandle::new(&spec));
        let console = Arc::new(RollingLogBuffer::new(config.console_buffer_max_lines));
        let stdout = Arc::new(OutputMultiplexer::new(StreamKind::Stdout));
        let stderr = Arc::new(OutputMultiplexer::new(StreamKind::Stderr));
        stdout.add_sink(console.clone());
        stderr.add_sink(console.clone());

        Ok(Self {
            spec,
            config,
            handle,
            stdout,
            stderr,
            console,
            termination: PlatformTerminationFactory::create_termination(),
            dispatcher: Arc::new(DefaultLogDispatcher),
            listeners: Vec::new(),
            cleanup: None,
            cleanup_token: Arc::default(),
            kill: Mutex::new(None),
            pid: Mutex::new(None),
        })
    }

    /// Registers a kill hook in `registry` for as long as the process runs
    pub fn with_cleanup_registry(mut self, registry: Arc<CleanupRegistry>) -> Self {
        self.cleanup = Some(registry);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProcessListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_log_dispatcher(mut self, dispatcher: Arc<dyn LogDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn short_name(&self) -> &str {
        self.handle.short_name()
    }

    pub fn long_name(&self) -> &str {
        self.handle.long_name()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub fn state(&self) -> ProcessState {
        self.handle.state()
    }

    pub fn pid(&self) -> Option<ProcessId> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stdout(&self) -> &Arc<OutputMultiplexer> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Arc<OutputMultiplexer> {
        &self.stderr
    }

    pub fn exit_waiter(&self) -> ExitWaiter {
        ExitWaiter::new(self.handle.clone())
    }

    /// The last lines of stdout and stderr, interleaved, newline-joined
    pub fn recent_console_output(&self) -> String {
        self.console.contents()
    }

    pub fn exit_value(&self) -> Result<ExitValue, SupervisorError> {
        if let Some(exit) = self.handle.exit_value() {
            return Ok(exit);
        }

        if self.handle.state().was_started() {
            Err(SupervisorError::StillRunning {
                name: self.short_name().to_string(),
            })
        } else {
            Err(SupervisorError::NeverStarted {
                name: self.short_name().to_string(),
            })
        }
    }

    /// Launches the process and returns as soon as it exists. A crash right after launch
    /// is not detected here; use the wait methods for that.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.handle.begin_start()?;

        let log_sinks: [Arc<dyn OutputSink>; 2] = [
            Arc::new(LogSink::new(
                self.short_name(),
                StreamKind::Stdout,
                self.dispatcher.clone(),
            )),
            Arc::new(LogSink::new(
                self.short_name(),
                StreamKind::Stderr,
                self.dispatcher.clone(),
            )),
        ];
        self.stdout.add_sink(log_sinks[0].clone());
        self.stderr.add_sink(log_sinks[1].clone());

        let launcher = ProcessLauncher::new(self.termination.clone(), self.config.output_drain_timeout());
        let launched = launcher.launch(
            &self.spec,
            self.handle.clone(),
            self.stdout.clone(),
            self.stderr.clone(),
            self.exit_hook(),
        );

        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.stdout.remove_sink(&log_sinks[0]);
                self.stderr.remove_sink(&log_sinks[1]);
                self.handle.abort_start();
                return Err(e);
            }
        };

        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = launched.pid;
        *self.kill.lock().unwrap_or_else(PoisonError::into_inner) = Some(launched.kill);

        if let (Some(registry), Some(pid), true) =
            (&self.cleanup, launched.pid, self.config.destroy_on_shutdown)
        {
            self.register_cleanup(registry, pid);
        }

        Ok(())
    }

    fn exit_hook(&self) -> impl FnOnce(ExitValue) + Send + use<> {
        let name = self.short_name().to_string();
        let spec = self.spec.clone();
        let listeners = self.listeners.clone();
        let cleanup = self.cleanup.clone();
        let cleanup_token = self.cleanup_token.clone();

        move |exit| {
            if let (Some(registry), Some(token)) = (
                cleanup,
                cleanup_token
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            ) {
                registry.deregister(token);
            }

            let success = exit.code().is_some_and(|code| spec.is_success(code));
            for listener in &listeners {
                if success {
                    listener.on_process_complete(&name, exit);
                } else {
                    listener.on_process_failed(&name, exit);
                }
            }
        }
    }

    fn register_cleanup(&self, registry: &Arc<CleanupRegistry>, pid: ProcessId) {
        let handle = self.handle.clone();
        let termination = self.termination.clone();

        let token = registry.register(self.long_name(), move || {
            if !handle.is_alive() {
                return Ok(());
            }
            match termination.terminate_tree(pid) {
                result if result.is_gone() => Ok(()),
                result => Err(anyhow::anyhow!(
                    "could not terminate {} (pid {pid}): {result:?}",
                    handle.short_name()
                )),
            }
        });

        let mut slot = self
            .cleanup_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.handle.is_alive() {
            *slot = Some(token);
        } else {
            // exited before the token was stored, so the exit hook could not remove it
            registry.deregister(token);
        }
    }

    /// Starts the process and waits until `pattern` shows up on stdout or stderr.
    ///
    /// `Ok(true)` once the pattern was seen. `Ok(false)` if `max_wait` passed while the
    /// process kept running; it is left running. Dying first is an `UnexpectedExit`
    /// carrying the recent console output.
    pub async fn start_and_wait_for_console_message(
        &self,
        pattern: &str,
        max_wait: Duration,
    ) -> Result<bool, SupervisorError> {
        let watcher = Arc::new(ConsoleMessageWatcher::new(pattern)?);
        let _attached = AttachedSink::new(watcher.clone(), [&self.stdout, &self.stderr]);

        self.start().await?;

        let outcome = tokio::time::timeout(max_wait, async {
            tokio::select! {
                biased;
                () = watcher.seen() => true,
                () = self.handle.reaped() => false,
            }
        })
        .await;

        match outcome {
            Ok(true) => {
                info!(process = %self.short_name(), "Saw {pattern:?}");
                Ok(true)
            }
            Err(_) if watcher.has_seen_it() => Ok(true),
            Err(_) if self.handle.is_alive() => {
                warn!(
                    process = %self.short_name(),
                    "{pattern:?} not seen within {max_wait:?}, leaving the process running"
                );
                Ok(false)
            }
            // reaped, possibly right at the deadline
            Ok(false) | Err(_) => {
                // output still in flight is drained before the exit is published
                let exit = self.exit_waiter().wait().await?;
                if watcher.has_seen_it() {
                    return Ok(true);
                }
                Err(SupervisorError::UnexpectedExit {
                    long_name: self.long_name().to_string(),
                    pattern: pattern.to_string(),
                    exit,
                    tail: self.recent_console_output(),
                })
            }
        }
    }

    /// Kills the process and everything it forked, then waits for the reap.
    ///
    /// Fails with `NotRunning` unless the process is alive, including when it was never
    /// started.
    pub async fn destroy(&self) -> Result<ExitValue, SupervisorError> {
        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        let kill = match kill {
            Some(kill) if self.handle.is_alive() => kill,
            _ => {
                return Err(SupervisorError::NotRunning {
                    name: self.short_name().to_string(),
                });
            }
        };

        info!(pid = ?self.pid(), process = %self.short_name(), "Destroying {}", self.long_name());
        if kill.send(()).is_err() {
            debug!(process = %self.short_name(), "Exit observer already finished");
        }

        let waited = self.config.destroy_timeout();
        match self.exit_waiter().wait_max(waited).await? {
            Some(exit) => Ok(exit),
            None => Err(SupervisorError::ReapTimeout {
                long_name: self.long_name().to_string(),
                waited,
            }),
        }
    }

    pub async fn wait_for_exit(&self) -> Result<ExitValue, SupervisorError> {
        self.exit_waiter().wait().await
    }

    /// `Ok(None)` if the process is still running after `max`
    pub async fn wait_for_exit_max(&self, max: Duration) -> Result<Option<ExitValue>, SupervisorError> {
        self.exit_waiter().wait_max(max).await
    }

    /// Gives the process `max` to exit on its own, then destroys it
    pub async fn wait_for_exit_or_destroy(&self, max: Duration) -> Result<ExitValue, SupervisorError> {
        if let Some(exit) = self.wait_for_exit_max(max).await? {
            return Ok(exit);
        }

        match self.destroy().await {
            // exited on its own between the wait and the kill
            Err(SupervisorError::NotRunning { .. }) => self.wait_for_exit().await,
            result => result,
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.config.destroy_on_drop {
            return;
        }

        let token = self
            .cleanup_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(registry), Some(token)) = (&self.cleanup, token) {
            registry.deregister(token);
        }

        if !self.handle.is_alive() {
            return;
        }

        warn!(
            pid = ?self.pid(),
            "Supervisor for {} dropped while the process is running, killing it",
            self.short_name()
        );

        // The runtime may already be shutting down, so kill synchronously as well.
        if let Some(kill) = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = kill.send(());
        }
        if let Some(pid) = self.pid() {
            let result = self.termination.terminate_tree(pid);
            if !result.is_gone() {
                warn!(pid, "Emergency termination failed: {result:?}");
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("long_name", &self.long_name())
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Keeps a sink attached to a set of multiplexers until dropped
struct AttachedSink<'a> {
    sink: Arc<dyn OutputSink>,
    targets: Vec<&'a OutputMultiplexer>,
}

impl<'a> AttachedSink<'a> {
    fn new<const N: usize>(sink: Arc<dyn OutputSink>, targets: [&'a Arc<OutputMultiplexer>; N]) -> Self {
        let targets: Vec<&OutputMultiplexer> = targets.into_iter().map(|t| &**t).collect();
        for target in &targets {
            target.add_sink(sink.clone());
        }
        Self { sink, targets }
    }
}

impl Drop for AttachedSink<'_> {
    fn drop(&mut self) {
        for target in &self.targets {
            target.remove_sink(&self.sink);
        }
    }
}
