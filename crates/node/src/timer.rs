//! Per-job wall-clock timer.
//!
//! A job with period `p` seconds and offset `s` fires at Unix times
//! `N * p + s`. The first firing is the smallest such time strictly in
//! the future (bumped by a full period when it is less than 1 ms away,
//! so a freshly merged job does not double-fire). One task per timer;
//! at most one instance of the callback runs at any moment.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a running timer task.
pub struct Timer {
    id: u64,
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Delay until the next grid point `N * period + offset` measured from
/// `now` (all durations since the Unix epoch). A delay under 1 ms is
/// pushed out by one full period.
pub fn first_delay(period: Duration, offset: Duration, now: Duration) -> Duration {
    let p = period.as_nanos() as i128;
    let elapsed = now.as_nanos() as i128 - offset.as_nanos() as i128;
    let mut delay = p - elapsed.rem_euclid(p);
    if delay < 1_000_000 {
        delay += p;
    }
    Duration::from_nanos(delay as u64)
}

impl Timer {
    /// Starts a timer running `f` on the wall-clock grid.
    pub fn spawn<F, Fut>(period: Duration, offset: Duration, mut f: F) -> Timer
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let delay = first_delay(period, offset, now);
        let (stop, mut stop_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut ticks =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // not cancellable mid-run: stop waits for f to return
                f().await;
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticks.tick() => {}
                }
            }
        });
        Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            stop,
            handle,
        }
    }

    /// Identity of this timer instance; survives job-list merges that
    /// keep the task alive.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the timer and joins the task. If the callback is running,
    /// this waits until it returns. Consumes the handle, so stopping
    /// twice is unrepresentable.
    pub async fn stop(self) {
        let _ = self.stop.send(()).await;
        let _ = self.handle.await;
    }
}
