//! Supervision of external daemons such as database servers.
//!
//! [`ProcessSupervisor`] launches a process, captures its console into a rolling buffer
//! and into `tracing`, waits for readiness messages and exit codes, and kills the whole
//! process tree on request, on drop, or through a shared [`CleanupRegistry`].
//! [`BoundedRetryInstaller`] runs one-shot setup commands with a per-attempt timeout.

mod exit_waiter;
pub mod factory;
mod installer;
mod launcher;
mod listener;
mod supervisor;
pub mod telemetry;

pub use exit_waiter::ExitWaiter;
pub use factory::PlatformTerminationFactory;
pub use installer::BoundedRetryInstaller;
pub use launcher::{LaunchedProcess, ProcessLauncher};
pub use listener::ProcessListener;
pub use supervisor::ProcessSupervisor;
pub use telemetry::{LogFormat, init_tracing};

// Re-export core functionality
pub use dbvisor_core::*;
