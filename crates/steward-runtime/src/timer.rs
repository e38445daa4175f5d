//! [`IntervalTimer`] – a named periodic job on the Tokio runtime.
//!
//! The job runs on a spawned task driven by a `tokio::time::interval` and
//! stops when a `watch` stop signal flips.  Missed ticks are skipped rather
//! than bunched.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct IntervalTimer {
    name: String,
    period: Duration,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl IntervalTimer {
    /// Spawn `job` to run every `period`, first after one full period.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(name: impl Into<String>, period: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let period = period.max(MIN_PERIOD);
        let (stop, mut stopped) = watch::channel(false);
        let timer_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.wait_for(|s| *s) => break,
                    _ = interval.tick() => job(),
                }
            }
            debug!(timer = %timer_name, "timer stopped");
        });
        debug!(timer = %name, ?period, "timer started");
        Self {
            name,
            period,
            stop,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the job loop to exit.  `false` if it was already stopped.
    pub fn stop(&mut self) -> bool {
        if self.handle.take().is_none() {
            return false;
        }
        self.stop.send_replace(true);
        true
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_every_period_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut timer = IntervalTimer::start("test", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(timer.stop());
        assert!(!timer.stop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn zero_period_is_clamped() {
        let timer = IntervalTimer::start("fast", Duration::ZERO, || {});
        assert_eq!(timer.period(), MIN_PERIOD);
        assert_eq!(timer.name(), "fast");
    }
}
