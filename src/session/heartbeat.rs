use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::Result;

use super::SessionInner;

/// Background keep-alive ticker.
///
/// The task only holds a weak reference to the session, so it ends on its own once the
/// session is gone.
pub(crate) struct Heartbeat {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(crate) fn start(session: &Arc<SessionInner>) -> Self {
        let frequency = session
            .parameters
            .heartbeat_frequency(session.config.heartbeat_frequency);
        let weak = Arc::downgrade(session);
        debug!(?frequency, "starting heartbeat");
        Self::spawn(frequency, move || {
            let session = weak.upgrade()?;
            Some(async move { session.heartbeat().await })
        })
    }

    /// Calls `beat` every `frequency` until stopped or until `beat` returns `None`.
    fn spawn<F, Fut>(frequency: Duration, mut beat: F) -> Self
    where
        F: FnMut() -> Option<Fut> + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frequency);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        let Some(call) = beat() else { break };
                        if let Err(err) = call.await {
                            warn!(error = %err, "heartbeat failed");
                        }
                    }
                }
            }
            debug!("heartbeat stopped");
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stops the ticker. A beat already in flight is allowed to finish.
    pub(crate) fn stop(&mut self) {
        if self.handle.take().is_some() {
            let _ = self.shutdown.send(true);
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> Heartbeat {
        let counter = Arc::clone(counter);
        Heartbeat::spawn(Duration::from_secs(900), move || {
            let counter = Arc::clone(&counter);
            Some(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn beats_on_every_period_after_the_first() {
        let counter = Arc::new(AtomicUsize::new(0));
        let _heartbeat = counting(&counter);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut heartbeat = counting(&counter);
        heartbeat.stop();
        heartbeat.stop();

        tokio::time::sleep(Duration::from_secs(3000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_the_session_is_gone() {
        let heartbeat = Heartbeat::spawn(Duration::from_secs(900), || {
            None::<std::future::Ready<Result<()>>>
        });
        tokio::time::sleep(Duration::from_secs(901)).await;
        tokio::task::yield_now().await;
        assert!(heartbeat.handle.as_ref().is_some_and(|h| h.is_finished()));
    }
}
