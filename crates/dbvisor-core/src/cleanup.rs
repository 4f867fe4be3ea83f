use crate::error::CleanupError;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Identifies a registered cleanup hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupToken(u64);

/// Teardown hooks for processes that must not outlive the program.
///
/// Owned by whichever component starts processes and handed to supervisors explicitly.
/// Every hook runs at most once: `run_all` drains the registry, so calling it again, or
/// after the hooks were deregistered by a normal shutdown, does nothing.
#[derive(Default)]
pub struct CleanupRegistry {
    next_id: AtomicU64,
    hooks: Mutex<BTreeMap<CleanupToken, (String, CleanupFn)>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, hook: F) -> CleanupToken
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let token = CleanupToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!(hook = %name, "Registered cleanup hook");
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, (name, Box::new(hook)));
        token
    }

    /// Removes a hook without running it. Returns `false` if it already ran or was removed.
    pub fn deregister(&self, token: CleanupToken) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs and removes every registered hook. A failing or panicking hook does not keep
    /// the others from running; all failures are reported together.
    pub fn run_all(&self) -> Result<usize, CleanupError> {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        if hooks.is_empty() {
            return Ok(0);
        }

        info!("Running {} cleanup hook(s)", hooks.len());
        let mut ran = 0;
        let mut failures = Vec::new();

        for (_, (name, hook)) in hooks {
            ran += 1;
            match catch_unwind(AssertUnwindSafe(hook)) {
                Ok(Ok(())) => debug!(hook = %name, "Cleanup hook finished"),
                Ok(Err(e)) => {
                    warn!(hook = %name, "Cleanup hook failed: {e}");
                    failures.push(e.context(format!("cleanup hook {name}")));
                }
                Err(_) => {
                    error!(hook = %name, "Cleanup hook panicked");
                    failures.push(anyhow::anyhow!("cleanup hook {name} panicked"));
                }
            }
        }

        if failures.is_empty() {
            Ok(ran)
        } else {
            Err(CleanupError { failures })
        }
    }

    /// Runs all hooks when the program receives Ctrl-C
    pub fn install_ctrl_c_hook(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for Ctrl-C: {e}");
                return;
            }
            warn!("Ctrl-C received, tearing down supervised processes");
            if let Err(e) = registry.run_all() {
                error!("{e}");
            }
        })
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("hooks", &self.len())
            .finish()
    }
}
