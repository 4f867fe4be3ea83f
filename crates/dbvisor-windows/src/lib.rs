//! Windows process-tree termination for supervised daemons

mod windows_process_manager;

pub use windows_process_manager::WindowsProcessTermination;

pub struct WindowsTerminationFactory;

impl WindowsTerminationFactory {
    pub fn create_termination() -> WindowsProcessTermination {
        WindowsProcessTermination::new()
    }

    pub fn platform_name() -> &'static str {
        "Windows"
    }
}
