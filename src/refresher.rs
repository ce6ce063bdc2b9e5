//! Periodic background refresh.
//!
//! A [`Refresher`] owns one tokio task that runs a [`RefreshJob`] every
//! interval until it is stopped.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use log::{info, warn};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::errors::ResolverError;

/// Work run on every refresher tick.
#[async_trait]
pub trait RefreshJob: Send + Sync + 'static {
    async fn run(&self) -> Result<(), ResolverError>;
}

/// Background task waking on a fixed interval.
///
/// The first run happens one interval after spawning. A failing run is
/// logged and the next tick proceeds as usual. A run in progress is never
/// cancelled: [`Refresher::stop`] waits for it to finish.
#[derive(Debug)]
pub struct Refresher {
    shutdown: watch::Sender<bool>,
    exited: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Refresher {
    /// Spawn the refresher on the current tokio runtime.
    pub fn spawn(period: Duration, job: Arc<dyn RefreshJob>) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let (exit, exited) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Refresher started with {}s interval", period.as_secs());

            loop {
                tokio::select! {
                    biased;
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = job.run().await {
                            warn!("Refresh failed: {}", e);
                        }
                    }
                }
            }

            info!("Refresher stopped");
            let _ = exit.send(true);
        });

        Self {
            shutdown,
            exited,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Whether the background task is still alive.
    pub fn is_running(&self) -> bool {
        // The exit sender is dropped if the task panics or is aborted.
        let exited = *self.exited.borrow();
        !exited && self.exited.has_changed().is_ok()
    }

    /// Stop the refresher and wait for the background task to exit.
    ///
    /// Safe to call more than once and from several tasks at once. Every
    /// caller returns only after the background task has exited.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Refresher task ended abnormally: {}", e);
            }
        }

        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RefreshJob for Counter {
        async fn run(&self) -> Result<(), ResolverError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ResolverError::InventoryUnavailable("down".into()));
            }
            Ok(())
        }
    }

    const PERIOD: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn first_run_after_one_interval() {
        let job = Arc::new(Counter::default());
        let refresher = Refresher::spawn(PERIOD, job.clone());

        time::sleep(PERIOD / 2).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        time::sleep(PERIOD).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        time::sleep(PERIOD).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);

        refresher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_ticks() {
        let job = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let refresher = Refresher::spawn(PERIOD, job.clone());

        time::sleep(PERIOD * 3 + PERIOD / 2).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert!(refresher.is_running());

        refresher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_prompt_and_idempotent() {
        let job = Arc::new(Counter::default());
        let refresher = Refresher::spawn(Duration::from_secs(3600), job.clone());
        assert!(refresher.is_running());

        let started = Instant::now();
        refresher.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!refresher.is_running());

        refresher.stop().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    struct SlowJob {
        finished: AtomicBool,
    }

    #[async_trait]
    impl RefreshJob for SlowJob {
        async fn run(&self) -> Result<(), ResolverError> {
            time::sleep(Duration::from_secs(10)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_wait_for_run_in_progress() {
        let job = Arc::new(SlowJob {
            finished: AtomicBool::new(false),
        });
        let refresher = Refresher::spawn(Duration::from_secs(1), job.clone());

        // Let the first run start.
        time::sleep(Duration::from_secs(2)).await;
        assert!(!job.finished.load(Ordering::SeqCst));

        let first = async {
            refresher.stop().await;
            job.finished.load(Ordering::SeqCst)
        };
        let second = async {
            refresher.stop().await;
            job.finished.load(Ordering::SeqCst)
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first);
        assert!(second);
        assert!(!refresher.is_running());
    }
}
