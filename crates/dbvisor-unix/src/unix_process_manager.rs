use dbvisor_core::{ProcessId, ProcessTermination, TerminationResult};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::sync::{Mutex, PoisonError};
    use sysinfo::System;
    use tracing::{debug, info, warn};

    /// Unix termination: every daemon gets its own process group, and destroying it
    /// SIGKILLs the whole group. If the group is gone or cannot be signalled, the process
    /// tree is walked instead.
    pub struct UnixProcessTermination {
        system: Mutex<System>,
    }

    impl Default for UnixProcessTermination {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessTermination {
        pub fn new() -> Self {
            debug!("Initializing Unix process termination");
            Self {
                system: Mutex::new(System::new()),
            }
        }

        fn kill_group(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid as i32);

            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("Process group {} not found", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to kill process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            }
        }

        fn kill_single(pid: ProcessId) -> TerminationResult {
            match signal::kill(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process {}", pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to kill process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                }
            }
        }

        /// Children first, then the root
        fn kill_tree(&self, root_pid: ProcessId) -> TerminationResult {
            let children = self.find_child_processes(root_pid);
            if !children.is_empty() {
                info!(
                    "Found {} descendant(s) of process {} to kill",
                    children.len(),
                    root_pid
                );
            }

            for child_pid in &children {
                match Self::kill_single(*child_pid) {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    result => warn!("Failed to kill descendant {}: {:?}", child_pid, result),
                }
            }

            Self::kill_single(root_pid)
        }

        pub fn find_child_processes(&self, parent_pid: ProcessId) -> Vec<ProcessId> {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::nothing(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid, &mut children);
            children
        }

        /// Grandchildren are pushed before their parent
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|p| p.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    impl ProcessTermination for UnixProcessTermination {
        fn configure(&self, command: &mut tokio::process::Command) {
            // pgid == pid, so the whole group can be signalled by the child's pid
            command.process_group(0);
        }

        fn terminate_tree(&self, pid: ProcessId) -> TerminationResult {
            match self.kill_group(pid) {
                TerminationResult::Success => TerminationResult::Success,
                TerminationResult::ProcessNotFound => Self::kill_single(pid),
                _ => self.kill_tree(pid),
            }
        }

        fn platform_name(&self) -> &'static str {
            "unix"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        #[tokio::test]
        async fn test_terminate_tree_kills_group() {
            let termination = UnixProcessTermination::new();
            let mut command = tokio::process::Command::new("/bin/sh");
            command.args(["-c", "sleep 30 & sleep 30"]);
            termination.configure(&mut command);

            let mut child = command.spawn().unwrap();
            let pid = child.id().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert_eq!(termination.terminate_tree(pid), TerminationResult::Success);

            let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .expect("child was not killed")
                .unwrap();
            assert!(!status.success());
        }

        #[tokio::test]
        async fn test_find_child_processes() {
            let termination = UnixProcessTermination::new();
            let mut command = tokio::process::Command::new("/bin/sh");
            command.args(["-c", "sleep 30 & wait"]);
            termination.configure(&mut command);

            let mut child = command.spawn().unwrap();
            let pid = child.id().unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert!(!termination.find_child_processes(pid).is_empty());

            assert!(termination.terminate_tree(pid).is_gone());
            child.wait().await.unwrap();
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::UnixProcessTermination;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessTermination;

#[cfg(not(unix))]
impl UnixProcessTermination {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessTermination {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(unix))]
impl ProcessTermination for UnixProcessTermination {
    fn configure(&self, _command: &mut tokio::process::Command) {}

    fn terminate_tree(&self, _pid: ProcessId) -> TerminationResult {
        TerminationResult::Failed("Unix termination is not available on this platform".into())
    }

    fn platform_name(&self) -> &'static str {
        "unix (unavailable)"
    }
}
