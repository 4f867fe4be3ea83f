use dbvisor_core::{
    ExitValue, OutputMultiplexer, ProcessHandle, ProcessId, ProcessSpec, ProcessTermination,
    SupervisorError, pump,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A spawned process as seen by its owner
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: Option<ProcessId>,
    /// Asks the exit observer to kill the process tree. Dropping it does nothing.
    pub kill: oneshot::Sender<()>,
}

/// Spawns OS processes and wires their console into the multiplexers
pub struct ProcessLauncher {
    termination: Arc<dyn ProcessTermination>,
    drain_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(termination: Arc<dyn ProcessTermination>, drain_timeout: Duration) -> Self {
        Self {
            termination,
            drain_timeout,
        }
    }

    fn command(&self, spec: &ProcessSpec) -> Command {
        let mut command = Command::new(spec.executable());
        command
            .args(spec.argv())
            .envs(spec.environment())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        if spec.stdin().is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        if let Some(dir) = spec.working_directory() {
            command.current_dir(dir);
        }

        self.termination.configure(&mut command);
        command
    }

    /// Spawns the process described by `spec`.
    ///
    /// The handle must already be in `Starting`. It is `Running` and alive when this
    /// returns `Ok`, before the exit observer can run. The handle stops being alive as
    /// soon as the process is reaped. `on_exit` is called once, after both streams were
    /// drained and before exit waiters are woken.
    pub fn launch<F>(
        &self,
        spec: &ProcessSpec,
        handle: Arc<ProcessHandle>,
        stdout: Arc<OutputMultiplexer>,
        stderr: Arc<OutputMultiplexer>,
        on_exit: F,
    ) -> Result<LaunchedProcess, SupervisorError>
    where
        F: FnOnce(ExitValue) + Send + 'static,
    {
        debug!(
            command = %spec.command_line(),
            working_directory = %spec.working_directory_display(),
            "Spawning process"
        );

        let mut child =
            self.command(spec)
                .spawn()
                .map_err(|source| SupervisorError::Launch {
                    command_line: spec.command_line(),
                    working_directory: spec.working_directory_display(),
                    source,
                })?;

        let pid = child.id();
        handle.mark_running();
        info!(pid = ?pid, process = %handle.short_name(), "Launched {}", handle.long_name());

        if let (Some(bytes), Some(mut stdin)) = (spec.stdin(), child.stdin.take()) {
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!("Child closed stdin early: {e}");
                }
            });
        }

        let pumps = [
            child.stdout.take().map(|io| tokio::spawn(pump(io, stdout))),
            child.stderr.take().map(|io| tokio::spawn(pump(io, stderr))),
        ];

        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(observe_exit(
            child,
            pid,
            kill_rx,
            pumps,
            self.termination.clone(),
            self.drain_timeout,
            handle,
            on_exit,
        ));

        Ok(LaunchedProcess { pid, kill })
    }
}

#[allow(clippy::too_many_arguments)]
async fn observe_exit<F>(
    mut child: Child,
    pid: Option<ProcessId>,
    mut kill_rx: oneshot::Receiver<()>,
    pumps: [Option<JoinHandle<usize>>; 2],
    termination: Arc<dyn ProcessTermination>,
    drain_timeout: Duration,
    handle: Arc<ProcessHandle>,
    on_exit: F,
) where
    F: FnOnce(ExitValue) + Send + 'static,
{
    let exit = tokio::select! {
        biased;
        Ok(()) = &mut kill_rx => {
            if let Some(pid) = pid {
                let result = tokio::task::spawn_blocking(move || termination.terminate_tree(pid)).await;
                match result {
                    Ok(result) if result.is_gone() => debug!(pid, "Process tree terminated"),
                    Ok(result) => warn!(pid, "Process tree termination incomplete: {result:?}"),
                    Err(e) => warn!(pid, "Process tree termination task failed: {e}"),
                }
            }
            if let Err(e) = child.start_kill() {
                debug!("Direct kill after tree termination: {e}");
            }
            if let Err(e) = child.wait().await {
                warn!(pid = ?pid, "Failed to reap destroyed process: {e}");
            }
            ExitValue::Destroyed
        }
        status = child.wait() => match status {
            Ok(status) => ExitValue::from_status(status),
            Err(e) => {
                warn!(pid = ?pid, "Lost track of process: {e}");
                ExitValue::Destroyed
            }
        },
    };
    handle.mark_reaped();

    let drain = async {
        for pump in pumps.into_iter().flatten() {
            if let Err(e) = pump.await {
                warn!("Output pump failed: {e}");
            }
        }
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        // a grandchild can keep the pipes open after the daemon itself is gone
        debug!(pid = ?pid, "Console output still open after exit, not waiting for it");
    }

    let recorded = handle.record_exit(exit, |exit| {
        info!(pid = ?pid, process = %handle.short_name(), "Process ended with {exit}");
        on_exit(exit);
    });
    if !recorded {
        debug!(pid = ?pid, "Exit was already recorded");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::factory::PlatformTerminationFactory;
    use dbvisor_core::{RollingLogBuffer, StreamKind};

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(
            PlatformTerminationFactory::create_termination(),
            Duration::from_secs(1),
        )
    }

    fn streams() -> (Arc<OutputMultiplexer>, Arc<OutputMultiplexer>) {
        (
            Arc::new(OutputMultiplexer::new(StreamKind::Stdout)),
            Arc::new(OutputMultiplexer::new(StreamKind::Stderr)),
        )
    }

    #[tokio::test]
    async fn test_launch_reports_exit_after_output() {
        let spec = ProcessSpec::builder()
            .executable("/bin/sh")
            .args(["-c", "echo out; echo err >&2; exit 4"])
            .build()
            .unwrap();
        let handle = Arc::new(ProcessHandle::new(&spec));
        let (stdout, stderr) = streams();
        let buffer = Arc::new(RollingLogBuffer::new(10));
        stdout.add_sink(buffer.clone());
        stderr.add_sink(buffer.clone());

        let (tx, rx) = oneshot::channel();
        handle.begin_start().unwrap();
        let launched = launcher()
            .launch(&spec, handle.clone(), stdout, stderr, move |exit| {
                let _ = tx.send(exit);
            })
            .unwrap();
        assert!(launched.pid.is_some());
        assert!(handle.is_alive());

        assert_eq!(rx.await.unwrap(), ExitValue::Code(4));
        assert!(!handle.is_alive());
        let mut lines = buffer.recent_lines();
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn test_kill_switch_records_destroyed() {
        let spec = ProcessSpec::builder()
            .executable("/bin/sh")
            .args(["-c", "sleep 30"])
            .build()
            .unwrap();
        let handle = Arc::new(ProcessHandle::new(&spec));
        let (stdout, stderr) = streams();

        handle.begin_start().unwrap();
        let launched = launcher()
            .launch(&spec, handle.clone(), stdout, stderr, |_| {})
            .unwrap();
        launched.kill.send(()).unwrap();

        let mut exit = handle.subscribe();
        let value = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .expect("process was not killed")
            .map(|v| *v)
            .unwrap();
        assert_eq!(value, Some(ExitValue::Destroyed));
    }

    #[tokio::test]
    async fn test_not_alive_while_grandchild_holds_the_pipes() {
        let spec = ProcessSpec::builder()
            .executable("/bin/sh")
            .args(["-c", "sleep 3 & exit 0"])
            .build()
            .unwrap();
        let handle = Arc::new(ProcessHandle::new(&spec));
        let (stdout, stderr) = streams();

        handle.begin_start().unwrap();
        let launcher = ProcessLauncher::new(
            PlatformTerminationFactory::create_termination(),
            Duration::from_secs(10),
        );
        launcher
            .launch(&spec, handle.clone(), stdout, stderr, |_| {})
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.reaped())
            .await
            .expect("exit of the shell was not noticed");
        assert!(!handle.is_alive());
        // the sleep keeps stdout open, so the drain is still pending
        assert_eq!(handle.exit_value(), None);
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_launch_error() {
        let spec = ProcessSpec::builder()
            .executable("/nonexistent/dbvisor-test-daemon")
            .build()
            .unwrap();
        let handle = Arc::new(ProcessHandle::new(&spec));
        let (stdout, stderr) = streams();

        handle.begin_start().unwrap();
        let err = launcher()
            .launch(&spec, handle.clone(), stdout, stderr, |_| {})
            .unwrap_err();

        assert!(matches!(err, SupervisorError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/dbvisor-test-daemon"));
        assert!(!handle.is_alive());
    }
}
