use crate::challenge::PreparedChallenge;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Keeps the WebAuthn challenge on screen fresh.
///
/// Every `period` the challenge is fetched and prepared again and published on
/// a watch channel. A signing attempt takes its own copy with
/// [`current`](Self::current), so a refresh never changes a challenge that is
/// already being signed.
pub struct ChallengeRefresher {
    receiver: watch::Receiver<PreparedChallenge>,
    task: JoinHandle<()>,
}

impl ChallengeRefresher {
    /// Starts refreshing `initial`. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(initial: PreparedChallenge, period: Duration, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PreparedChallenge>> + Send + 'static,
    {
        let (sender, receiver) = watch::channel(initial);
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match fetch().await {
                    Ok(challenge) => {
                        debug!("webauthn challenge refreshed");
                        if sender.send(challenge).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("challenge refresh failed, keeping previous: {err}"),
                }
            }
        });
        Self { receiver, task }
    }

    /// Copy of the latest challenge.
    #[must_use]
    pub fn current(&self) -> PreparedChallenge {
        self.receiver.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PreparedChallenge> {
        self.receiver.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ChallengeRefresher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
