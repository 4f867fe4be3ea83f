use crate::supervisor::ProcessSupervisor;
use backon::{ConstantBuilder, Retryable};
use dbvisor_core::{InstallRetryConfig, SupervisorError};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Runs a one-shot installation process until it succeeds or the attempt budget is spent.
///
/// Every attempt gets a fresh supervisor from the factory. An attempt fails when the
/// process exits with a non-success code or is still running after the attempt timeout;
/// a hanging process is destroyed before the next attempt. Launch errors end the loop
/// immediately.
pub struct BoundedRetryInstaller<F> {
    factory: F,
    config: InstallRetryConfig,
}

impl<F> BoundedRetryInstaller<F>
where
    F: Fn() -> Result<ProcessSupervisor, SupervisorError> + Send + Sync,
{
    pub fn new(factory: F, config: InstallRetryConfig) -> Result<Self, SupervisorError> {
        config
            .validate()
            .map_err(|e| SupervisorError::Configuration(format!("Invalid retry config: {e}")))?;

        Ok(Self { factory, config })
    }

    pub fn config(&self) -> &InstallRetryConfig {
        &self.config
    }

    /// Returns the number of attempts it took to succeed
    pub async fn run(&self) -> Result<u32, SupervisorError> {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let attempt = move || async move {
            let number = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempt(number).await.map(|()| number)
        };

        if !self.config.retries_enabled() {
            return attempt().await;
        }

        let strategy = ConstantBuilder::default()
            .with_delay(self.config.retry_delay())
            .with_max_times(self.config.max_attempts as usize - 1);

        attempt
            .retry(strategy)
            .when(SupervisorError::is_retryable)
            .notify(|e: &SupervisorError, delay| {
                warn!(
                    "Installation attempt {} of {} failed, retrying in {delay:?}: {e}",
                    attempts.load(Ordering::SeqCst),
                    self.config.max_attempts
                );
            })
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    SupervisorError::InstallRetryExhausted {
                        attempts: attempts.load(Ordering::SeqCst),
                        source: Box::new(e),
                    }
                } else {
                    e
                }
            })
    }

    async fn attempt(&self, number: u32) -> Result<(), SupervisorError> {
        let process = (self.factory)()?;
        let timeout = self.config.attempt_timeout();
        debug!("Installation attempt {number}: {}", process.long_name());

        process.start().await?;

        match process.wait_for_exit_max(timeout).await? {
            Some(exit) if exit.code().is_some_and(|code| process.spec().is_success(code)) => {
                info!("{} succeeded on attempt {number}", process.short_name());
                Ok(())
            }
            Some(exit) => Err(SupervisorError::FailedExit {
                long_name: process.long_name().to_string(),
                exit,
                tail: process.recent_console_output(),
            }),
            None => {
                warn!("{} still running after {timeout:?}, destroying it", process.short_name());
                if let Err(e) = process.destroy().await {
                    warn!("Failed to destroy timed out attempt: {e}");
                }
                Err(SupervisorError::AttemptTimedOut {
                    long_name: process.long_name().to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dbvisor_core::ProcessSpec;
    use std::sync::Arc;
    use std::time::Duration;

    fn shell(script: &str) -> Result<ProcessSupervisor, SupervisorError> {
        let spec = ProcessSpec::builder()
            .executable("/bin/sh")
            .args(["-c", script])
            .build()?;
        ProcessSupervisor::new(spec)
    }

    #[tokio::test]
    async fn test_single_attempt_error_is_not_wrapped() {
        let installer =
            BoundedRetryInstaller::new(|| shell("exit 1"), InstallRetryConfig::single_attempt())
                .unwrap();

        assert!(matches!(
            installer.run().await,
            Err(SupervisorError::FailedExit { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_exit_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let installer = BoundedRetryInstaller::new(
            move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                shell(if call == 0 { "exit 1" } else { "exit 0" })
            },
            InstallRetryConfig::new(3, Duration::from_secs(10)),
        )
        .unwrap();

        assert_eq!(installer.run().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_launch_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let installer = BoundedRetryInstaller::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let spec = ProcessSpec::builder()
                    .executable("/nonexistent/mysql_install_db")
                    .build()?;
                ProcessSupervisor::new(spec)
            },
            InstallRetryConfig::new(3, Duration::from_secs(1)),
        )
        .unwrap();

        assert!(matches!(
            installer.run().await,
            Err(SupervisorError::Launch { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_budget_is_rejected() {
        let config = InstallRetryConfig::new(0, Duration::from_secs(1));
        assert!(matches!(
            BoundedRetryInstaller::new(|| shell("true"), config),
            Err(SupervisorError::Configuration(_))
        ));
    }
}
