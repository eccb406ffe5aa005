//! Cross-process lock and auto-reset events living in the segment header.
//!
//! The lock word holds the owner's pid (0 = free). Acquisition spins briefly,
//! then sleeps in short steps until the deadline; [`acquire_async`] sleeps on
//! the tokio timer so a contended lock never parks a runtime thread. On Linux a word held by a
//! pid that no longer exists is taken over, so a crashed worker cannot wedge
//! the controller.
//!
//! Events are plain flags: `signal` sets them, `wait` consumes them. They are
//! wake-up hints only; the slot `ready` flags stay the source of truth.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{RenderwireError, Result};

/// Default bounded wait for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const SPIN_LIMIT: u32 = 64;
const SLEEP_STEP: Duration = Duration::from_micros(50);
const STALE_CHECK_EVERY: Duration = Duration::from_millis(10);

/// Held lock; released on drop.
pub struct ShmLockGuard<'a> {
    word: &'a AtomicU32,
    pid: u32,
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        if self
            .word
            .compare_exchange(self.pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!("shared-memory lock was taken over while held");
        }
    }
}

/// One attempt at the lock word. A word held by a dead pid is taken over
/// when `check_stale` is set.
fn try_take(word: &AtomicU32, pid: u32, check_stale: bool) -> Option<ShmLockGuard<'_>> {
    match word.compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed) {
        Ok(_) => Some(ShmLockGuard { word, pid }),
        Err(holder) if check_stale && holder != 0 && !process_alive(holder) => {
            word.compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
                .ok()
                .map(|_| {
                    tracing::warn!(dead_pid = holder, "reclaimed shared-memory lock");
                    ShmLockGuard { word, pid }
                })
        }
        Err(_) => None,
    }
}

/// Acquire the lock word, waiting at most `timeout`.
///
/// This blocks the calling thread. Code running on a tokio runtime uses
/// [`acquire_async`] instead.
pub fn acquire(word: &AtomicU32, timeout: Duration) -> Result<ShmLockGuard<'_>> {
    let pid = std::process::id();
    let start = Instant::now();
    let mut spins = 0u32;
    let mut last_stale_check = start;

    loop {
        let check_stale = last_stale_check.elapsed() >= STALE_CHECK_EVERY;
        if check_stale {
            last_stale_check = Instant::now();
        }
        if let Some(guard) = try_take(word, pid, check_stale) {
            return Ok(guard);
        }

        if start.elapsed() >= timeout {
            return Err(RenderwireError::LockTimeout);
        }
        if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(SLEEP_STEP);
        }
    }
}

/// Acquire the lock word without blocking the runtime thread.
///
/// Spins briefly, then yields to the runtime with a backoff that starts at
/// 50µs and tops out at 1ms.
pub async fn acquire_async(word: &AtomicU32, timeout: Duration) -> Result<ShmLockGuard<'_>> {
    let pid = std::process::id();
    let start = tokio::time::Instant::now();
    let mut last_stale_check = start;
    let mut step = SLEEP_STEP;

    for _ in 0..SPIN_LIMIT {
        if let Some(guard) = try_take(word, pid, false) {
            return Ok(guard);
        }
        std::hint::spin_loop();
    }

    loop {
        let check_stale = last_stale_check.elapsed() >= STALE_CHECK_EVERY;
        if check_stale {
            last_stale_check = tokio::time::Instant::now();
        }
        if let Some(guard) = try_take(word, pid, check_stale) {
            return Ok(guard);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(RenderwireError::LockTimeout);
        }
        tokio::time::sleep(step.min(timeout - elapsed)).await;
        step = (step * 2).min(Duration::from_millis(1));
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Set an event.
pub fn signal(event: &AtomicU32) {
    event.store(1, Ordering::Release);
}

/// Wait until the event is set or `timeout` passes; consumes the signal.
///
/// Polls with a backoff that starts at 50µs and tops out at 2ms.
pub async fn wait(event: &AtomicU32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut step = Duration::from_micros(50);
    loop {
        if event.swap(0, Ordering::AcqRel) == 1 {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(step.min(deadline - now)).await;
        step = (step * 2).min(Duration::from_millis(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_excludes_and_releases() {
        let word = AtomicU32::new(0);
        let guard = acquire(&word, Duration::from_millis(10)).unwrap();
        assert_eq!(word.load(Ordering::Relaxed), std::process::id());

        assert!(matches!(
            acquire(&word, Duration::from_millis(20)),
            Err(RenderwireError::LockTimeout)
        ));

        drop(guard);
        assert_eq!(word.load(Ordering::Relaxed), 0);
        assert!(acquire(&word, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_lock_contention_between_threads() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let word = word.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _g = acquire(&word, DEFAULT_LOCK_TIMEOUT).unwrap();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_owner_reclaimed() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let word = AtomicU32::new(dead_pid);
        let guard = acquire(&word, Duration::from_secs(1)).unwrap();
        assert_eq!(word.load(Ordering::Relaxed), std::process::id());
        drop(guard);
    }

    #[tokio::test]
    async fn test_async_acquire_times_out_then_succeeds() {
        let word = AtomicU32::new(0);
        let guard = acquire(&word, Duration::from_millis(10)).unwrap();
        assert!(matches!(
            acquire_async(&word, Duration::from_millis(20)).await,
            Err(RenderwireError::LockTimeout)
        ));

        drop(guard);
        let guard = acquire_async(&word, Duration::from_millis(10)).await.unwrap();
        assert_eq!(word.load(Ordering::Relaxed), std::process::id());
        drop(guard);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_acquire_keeps_runtime_responsive() {
        let word = Arc::new(AtomicU32::new(0));
        let holder = {
            let word = word.clone();
            let (held_tx, held_rx) = std::sync::mpsc::channel();
            let handle = std::thread::spawn(move || {
                let _guard = acquire(&word, Duration::from_millis(10)).unwrap();
                held_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(300));
            });
            held_rx.recv().unwrap();
            handle
        };

        let ticks = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let guard = acquire_async(&word, Duration::from_secs(2)).await.unwrap();
        drop(guard);
        ticker.abort();
        holder.join().unwrap();

        // A blocking wait would have starved the ticker on this single thread.
        assert!(ticks.load(Ordering::Relaxed) >= 5);
    }

    #[tokio::test]
    async fn test_event_auto_resets() {
        let event = AtomicU32::new(0);
        assert!(!wait(&event, Duration::from_millis(5)).await);

        signal(&event);
        assert!(wait(&event, Duration::from_millis(5)).await);
        assert!(!wait(&event, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_event_wakes_waiter() {
        let event = Arc::new(AtomicU32::new(0));
        let setter = event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal(&setter);
        });
        assert!(wait(&event, Duration::from_secs(2)).await);
    }
}
