use dbvisor_core::ProcessTermination;
use std::sync::Arc;

/// Picks the platform's `ProcessTermination` at compile time
pub struct PlatformTerminationFactory;

impl PlatformTerminationFactory {
    pub fn create_termination() -> Arc<dyn ProcessTermination> {
        #[cfg(unix)]
        return Arc::new(dbvisor_unix::UnixTerminationFactory::create_termination());

        #[cfg(windows)]
        return Arc::new(dbvisor_windows::WindowsTerminationFactory::create_termination());
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return dbvisor_unix::UnixTerminationFactory::platform_name();

        #[cfg(windows)]
        return dbvisor_windows::WindowsTerminationFactory::platform_name();
    }
}
