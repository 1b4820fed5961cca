//! Deferred teardown with cancel-on-revive.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Disposal timer for a reference-counted resource: Active while disarmed,
/// PendingDisposal once armed, Disposed when an expiry action goes through.
///
/// `arm` schedules an expiry action after a delay and returns the epoch
/// token it runs under; `disarm` invalidates every issued token and aborts
/// the pending task. Because an abort only lands at an await point, an
/// expiry action that already woke up can still run to completion, so it
/// must present its token to [`GraceTimer::is_current`] under the owner's
/// lock before tearing anything down.
#[derive(Debug, Default)]
pub(crate) struct GraceTimer {
    epoch: u64,
    pending: Option<JoinHandle<()>>,
}

impl GraceTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms the timer, superseding any pending schedule. Returns the token
    /// the expiry action receives.
    pub(crate) fn arm<F, Fut>(&mut self, delay: Duration, expire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.epoch += 1;
        let token = self.epoch;
        if let Some(task) = self.pending.take() {
            task.abort();
        }
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            expire(token).await;
        }));
        token
    }

    /// Cancels any pending schedule and invalidates issued tokens.
    pub(crate) fn disarm(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    /// True while `token` belongs to the newest armed schedule.
    pub(crate) fn is_current(&self, token: u64) -> bool {
        self.epoch == token
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = Arc::new(Mutex::new(GraceTimer::new()));
        let fired = Arc::new(AtomicBool::new(false));

        let inner_timer = timer.clone();
        let inner_fired = fired.clone();
        let token = timer.lock().arm(Duration::from_secs(10), move |token| async move {
            if inner_timer.lock().is_current(token) {
                inner_fired.store(true, Ordering::SeqCst);
            }
        });

        assert!(timer.lock().is_current(token));
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_expiry() {
        let timer = Arc::new(Mutex::new(GraceTimer::new()));
        let fired = Arc::new(AtomicBool::new(false));

        let inner_timer = timer.clone();
        let inner_fired = fired.clone();
        let token = timer.lock().arm(Duration::from_secs(10), move |token| async move {
            if inner_timer.lock().is_current(token) {
                inner_fired.store(true, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.lock().disarm();
        assert!(!timer.lock().is_current(token));

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_invalidates_older_tokens() {
        let timer = Arc::new(Mutex::new(GraceTimer::new()));
        let passed = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let inner_timer = timer.clone();
            let inner_passed = passed.clone();
            timer.lock().arm(Duration::from_secs(10), move |token| async move {
                if inner_timer.lock().is_current(token) {
                    inner_passed.lock().push(token);
                }
            });
        }

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        // Only the second schedule's token is still current.
        assert_eq!(passed.lock().clone(), vec![2]);
    }
}
