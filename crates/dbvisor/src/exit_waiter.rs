use dbvisor_core::{ExitValue, ProcessHandle, SupervisorError};
use std::sync::Arc;
use std::time::Duration;

/// Waits for the exit value of a supervised process.
///
/// Cheap to clone; every clone observes the same exit. Waiting suspends the calling task
/// only, the output pumps keep running.
#[derive(Debug, Clone)]
pub struct ExitWaiter {
    handle: Arc<ProcessHandle>,
}

impl ExitWaiter {
    pub fn new(handle: Arc<ProcessHandle>) -> Self {
        Self { handle }
    }

    fn ensure_started(&self) -> Result<(), SupervisorError> {
        if self.handle.state().was_started() {
            Ok(())
        } else {
            Err(SupervisorError::NeverStarted {
                name: self.handle.short_name().to_string(),
            })
        }
    }

    pub async fn wait(&self) -> Result<ExitValue, SupervisorError> {
        self.ensure_started()?;

        let mut exit = self.handle.subscribe();
        let value = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| self.observer_lost())?;
        value.ok_or_else(|| self.observer_lost())
    }

    /// `Ok(None)` when the process is still running after `max`. Nothing is killed.
    pub async fn wait_max(&self, max: Duration) -> Result<Option<ExitValue>, SupervisorError> {
        self.ensure_started()?;

        match tokio::time::timeout(max, self.wait()).await {
            Ok(exit) => exit.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn observer_lost(&self) -> SupervisorError {
        SupervisorError::ObserverLost {
            name: self.handle.short_name().to_string(),
        }
    }
}
