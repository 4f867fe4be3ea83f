//! Unix process-group based termination for supervised daemons

mod unix_process_manager;

pub use unix_process_manager::UnixProcessTermination;

pub struct UnixTerminationFactory;

impl UnixTerminationFactory {
    pub fn create_termination() -> UnixProcessTermination {
        UnixProcessTermination::new()
    }

    pub fn platform_name() -> &'static str {
        "Unix"
    }
}
