use super::loadable::Loadable;
use super::{Authenticator, CheckOutcome};
use crate::error::AuthError;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cancel-and-restart timer: scheduling a task aborts the previous one, so only
/// the last task scheduled within `delay` runs.
///
/// Tasks may be aborted at any await point and must tolerate that.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Runs `task` after the delay unless another task is scheduled first.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub type CheckResult = Loadable<CheckOutcome, Arc<AuthError>>;

/// Re-runs `check_user` after each username change once typing pauses.
///
/// Lookup failures are published, not retried; the next change retries.
pub struct UsernameWatcher {
    authenticator: Arc<Authenticator>,
    debouncer: Debouncer,
    sender: watch::Sender<CheckResult>,
}

impl UsernameWatcher {
    #[must_use]
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        let delay = authenticator.context().config.debounce_delay;
        let (sender, _) = watch::channel(Loadable::Loading);
        Self {
            authenticator,
            debouncer: Debouncer::new(delay),
            sender,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CheckResult> {
        self.sender.subscribe()
    }

    pub fn username_changed(&self, username: &str) {
        self.sender.send_replace(Loadable::Loading);
        let username = username.trim().to_string();
        if username.is_empty() {
            self.debouncer.cancel();
            return;
        }

        let authenticator = Arc::clone(&self.authenticator);
        let sender = self.sender.clone();
        self.debouncer.schedule(async move {
            debug!(username = %username, "checking user");
            let result = authenticator.check_user(&username).await.map_err(Arc::new);
            sender.send_replace(result.into());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn only_last_task_runs() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        for value in 1..=3 {
            let runs = Arc::clone(&runs);
            let last = Arc::clone(&last);
            debouncer.schedule(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(value, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_task() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        debouncer.schedule(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
