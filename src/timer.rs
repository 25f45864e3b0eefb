use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

/// A fixed-rate callback on its own thread, standing in for a hardware
/// interval timer.
///
/// The callback only fires while the timer is armed. Disarming is the
/// handle-clearing half of shutdown: it is observed before the next callback
/// and never waits. [`PeriodicTimer::end`] then stops and joins the thread.
pub struct PeriodicTimer {
    armed: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    period: Duration,
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            period: Duration::ZERO,
        }
    }

    /// Starts calling `callback` every `period`. The callback must not block.
    pub fn begin<F>(&mut self, period: Duration, mut callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("periodic timer is already running");
        }
        if period.is_zero() {
            bail!("periodic timer period must be non-zero");
        }

        self.armed.store(true, Ordering::Release);
        self.running.store(true, Ordering::Release);
        let armed = Arc::clone(&self.armed);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name("frame-timer".to_string())
            .spawn(move || {
                let mut deadline = Instant::now() + period;
                while running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if deadline > now {
                        thread::park_timeout(deadline - now);
                        continue;
                    }
                    deadline += period;
                    // Fall behind instead of bursting after a long stall.
                    if deadline < now {
                        deadline = now + period;
                    }
                    if armed.load(Ordering::Acquire) {
                        callback();
                    }
                }
            })
            .context("failed to spawn frame timer thread")?;

        self.handle = Some(handle);
        self.period = period;
        debug!("periodic timer started ({} us)", period.as_micros());
        Ok(())
    }

    /// Suppresses further callbacks without stopping the thread.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops the timer thread and waits for it to exit. Safe to call when
    /// the timer was never started.
    pub fn end(&mut self) {
        self.disarm();
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("frame timer thread panicked");
            }
            debug!("periodic timer stopped");
        }
    }
}

impl Default for PeriodicTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fires_repeatedly_until_ended() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = PeriodicTimer::new();
        let counter = Arc::clone(&count);
        timer
            .begin(Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect("timer starts");
        assert!(timer.is_running());

        thread::sleep(Duration::from_millis(50));
        timer.end();
        assert!(!timer.is_running());

        let fired = count.load(Ordering::Relaxed);
        assert!(fired > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::Relaxed), fired);
    }

    #[test]
    fn disarmed_timer_stops_calling_back() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = PeriodicTimer::new();
        let counter = Arc::clone(&count);
        timer
            .begin(Duration::from_millis(1), move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect("timer starts");

        timer.disarm();
        // Allow a callback that was already past the armed check to finish.
        thread::sleep(Duration::from_millis(5));
        let settled = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), settled);
        assert!(timer.is_running());
    }

    #[test]
    fn begin_twice_is_an_error() {
        let mut timer = PeriodicTimer::new();
        timer.begin(Duration::from_millis(5), || {}).expect("timer starts");
        assert!(timer.begin(Duration::from_millis(5), || {}).is_err());
        timer.end();
        assert!(timer.begin(Duration::from_millis(5), || {}).is_ok());
    }

    #[test]
    fn end_without_begin_is_harmless() {
        let mut timer = PeriodicTimer::new();
        timer.end();
        assert!(!timer.is_running());
        assert!(timer.begin(Duration::ZERO, || {}).is_err());
    }
}
