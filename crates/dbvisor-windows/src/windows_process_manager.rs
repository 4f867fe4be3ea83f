use dbvisor_core::{ProcessId, ProcessTermination, TerminationResult};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use tracing::{debug, info, warn};

/// Windows termination based on `taskkill /F /T`, with a manual walk of the process
/// tree when `taskkill` itself cannot be run.
pub struct WindowsProcessTermination {
    system: Mutex<System>,
}

impl Default for WindowsProcessTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsProcessTermination {
    pub fn new() -> Self {
        debug!("Initializing Windows process termination");
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn taskkill(pid: ProcessId, tree: bool) -> std::io::Result<bool> {
        let pid_string = pid.to_string();
        let mut args = vec!["/F", "/PID", pid_string.as_str()];
        if tree {
            args.push("/T");
        }

        let status = Command::new("taskkill")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn is_running(&self, pid: ProcessId) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::nothing(),
        );
        system.processes().keys().any(|p| p.as_u32() == pid)
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

    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|p| p.as_u32()) == Some(parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }

    fn kill_single(pid: ProcessId) -> TerminationResult {
        match Self::taskkill(pid, false) {
            Ok(true) => TerminationResult::Success,
            Ok(false) => TerminationResult::ProcessNotFound,
            Err(e) => TerminationResult::Failed(format!("taskkill failed: {e}")),
        }
    }
}

impl ProcessTermination for WindowsProcessTermination {
    fn configure(&self, command: &mut tokio::process::Command) {
        #[cfg(windows)]
        {
            // CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW
            command.creation_flags(0x0000_0200 | 0x0800_0000);
        }
        #[cfg(not(windows))]
        let _ = command;
    }

    fn terminate_tree(&self, pid: ProcessId) -> TerminationResult {
        match Self::taskkill(pid, true) {
            Ok(true) => {
                info!(pid, "Terminated process tree");
                TerminationResult::Success
            }
            Ok(false) if !self.is_running(pid) => {
                debug!(pid, "Process tree already gone");
                TerminationResult::ProcessNotFound
            }
            Ok(false) => {
                warn!(pid, "taskkill reported failure for a running process");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid, "Unable to run taskkill, walking the process tree: {e}");
                for child_pid in self.find_child_processes(pid) {
                    if let result @ (TerminationResult::AccessDenied | TerminationResult::Failed(_)) =
                        Self::kill_single(child_pid)
                    {
                        warn!(pid = child_pid, "Failed to terminate child process: {result:?}");
                    }
                }
                Self::kill_single(pid)
            }
        }
    }

    fn platform_name(&self) -> &'static str {
        "windows"
    }
}
