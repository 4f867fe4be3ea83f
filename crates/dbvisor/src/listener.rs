use dbvisor_core::ExitValue;

/// Callbacks for the end of a supervised process.
///
/// Exactly one of the two methods is called, once, from the exit observer task. A
/// destroyed process counts as failed.
pub trait ProcessListener: Send + Sync {
    fn on_process_complete(&self, _name: &str, _exit: ExitValue) {}

    fn on_process_failed(&self, _name: &str, _exit: ExitValue) {}
}
