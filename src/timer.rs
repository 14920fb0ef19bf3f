//! One-shot and periodic timers plus a monotonic millisecond clock.
//!
//! Timers run their callback on a spawned tokio task; `start`/`stop` are
//! idempotent and `stop` is safe to call from inside the callback itself
//! (cancellation just wins the next select).

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

static EPOCH: OnceLock<Instant> = OnceLock::new();

pub fn now() -> Instant {
    Instant::now()
}

/// Monotonic milliseconds since first use within this process.
pub fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// One-shot timer. Fires once `duration` after `start`; can be started
/// again after it fired or was stopped.
pub struct Timer {
    duration: Duration,
    callback: Callback,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl Timer {
    pub fn new(duration_ms: u64, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            callback: Arc::new(callback),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn start(&self) {
        let mut guard = self.running.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        let duration = self.duration;
        let callback = self.callback.clone();
        let slot = self.running.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    {
                        let mut guard = slot.lock().unwrap();
                        if token.is_cancelled() {
                            return;
                        }
                        // still ours: start() only installs a token when the
                        // slot is empty, and stop() cancels before clearing
                        *guard = None;
                    }
                    callback();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    pub fn stop(&self) {
        let mut guard = self.running.lock().unwrap();
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fires approximately every `interval` until stopped.
pub struct PeriodicTimer {
    interval: Duration,
    callback: Callback,
    running: Mutex<Option<CancellationToken>>,
}

impl PeriodicTimer {
    pub fn new(interval_ms: u64, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            callback: Arc::new(callback),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut guard = self.running.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        let interval = self.interval;
        let callback = self.callback.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if token.is_cancelled() {
                            return;
                        }
                        callback();
                    }
                    _ = token.cancelled() => return,
                }
            }
        });
    }

    pub fn stop(&self) {
        let mut guard = self.running.lock().unwrap();
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 4);
    }

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = Timer::new(20, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.start();
        timer.start(); // idempotent
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = Timer::new(100, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.start();
        timer.stop();
        timer.stop(); // idempotent
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn test_periodic_fires_until_stopped() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = PeriodicTimer::new(20, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.stop();
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 ticks, got {}", count);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }

    #[tokio::test]
    async fn test_reentrant_stop_from_callback() {
        let timer = Arc::new(Mutex::new(None::<Arc<PeriodicTimer>>));
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let t2 = timer.clone();
        let periodic = Arc::new(PeriodicTimer::new(20, move || {
            f.fetch_add(1, Ordering::SeqCst);
            if let Some(t) = t2.lock().unwrap().as_ref() {
                t.stop();
            }
        }));
        *timer.lock().unwrap() = Some(periodic.clone());
        periodic.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
