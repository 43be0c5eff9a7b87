//! Operating system seam
//!
//! The stack needs a millisecond clock and a way to sleep. Everything else
//! (mutexes with timeouts, completion semaphores) is built on top of those two
//! calls. Without an RTOS, `delay_ms` can busy-wait on a hardware timer, and the
//! waits below become polling loops.

use crate::error::{Error, Result};
use crate::WAIT_FOREVER;
use core::sync::atomic::{AtomicBool, Ordering};

/// Clock and sleep services supplied by the application
pub trait Os: Send + Sync {
    /// Milliseconds since some fixed point in time
    fn now_ms(&self) -> u64;
    /// Sleep, or spin, for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32);
}

/// Returns `true` once `timeout_ms` elapsed since `start`
fn expired(os: &dyn Os, start: u64, timeout_ms: u32) -> bool {
    timeout_ms != WAIT_FOREVER && os.now_ms().saturating_sub(start) >= u64::from(timeout_ms)
}

/// A mutex whose acquisition may time out
///
/// Failing to acquire the lock within the timeout is a hard error; it's
/// logged and returned, never retried.
pub struct TimedMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock, waiting at most `timeout_ms`
    pub fn lock(&self, os: &dyn Os, timeout_ms: u32) -> Result<spin::MutexGuard<'_, T>> {
        if let Some(guard) = self.inner.try_lock() {
            return Ok(guard);
        }
        let start = os.now_ms();
        loop {
            for _ in 0..64 {
                if let Some(guard) = self.inner.try_lock() {
                    return Ok(guard);
                }
                core::hint::spin_loop();
            }
            if expired(os, start, timeout_ms) {
                error!("lock not acquired within {} ms", timeout_ms);
                return Err(Error::Time);
            }
            os.delay_ms(1);
        }
    }

    /// Indicates if someone holds the lock right now
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// A one-shot, polled completion semaphore
///
/// The completing side calls [`signal()`](Completion::signal); the waiting
/// side blocks in [`wait()`](Completion::wait). A waiter that gives up marks
/// the completion abandoned, and a later `signal()` reports that nobody was
/// listening.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    abandoned: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Signal the waiter
    ///
    /// Returns `false` if the waiter already gave up.
    pub fn signal(&self) -> bool {
        self.done.store(true, Ordering::Release);
        !self.abandoned.load(Ordering::Acquire)
    }

    /// Indicates if the completion was signaled
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait up to `timeout_ms` for the signal
    ///
    /// Returns [`Error::Time`] when the timeout elapses first. Use
    /// [`WAIT_FOREVER`] to wait without a bound.
    pub fn wait(&self, os: &dyn Os, timeout_ms: u32) -> Result<()> {
        let start = os.now_ms();
        while !self.is_done() {
            if expired(os, start, timeout_ms) {
                self.abandoned.store(true, Ordering::Release);
                return Err(Error::Time);
            }
            os.delay_ms(1);
        }
        Ok(())
    }
}

/// An [`Os`] backed by the standard library
#[cfg(any(test, feature = "std"))]
pub struct StdOs {
    epoch: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl Default for StdOs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
impl StdOs {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Os for StdOs {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, StdOs, TimedMutex};
    use crate::Error;
    use std::sync::Arc;

    #[test]
    fn completion_times_out() {
        let os = StdOs::new();
        let done = Completion::new();
        let start = std::time::Instant::now();
        assert_eq!(done.wait(&os, 20), Err(Error::Time));
        assert!(start.elapsed().as_millis() >= 20);
        // Nobody's listening anymore.
        assert!(!done.signal());
    }

    #[test]
    fn completion_signaled_from_thread() {
        let os = StdOs::new();
        let done = Arc::new(Completion::new());
        let signal = Arc::clone(&done);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            assert!(signal.signal());
        });
        done.wait(&os, 1000).unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn mutex_lock_times_out() {
        let os = StdOs::new();
        let mutex = TimedMutex::new(5u32);
        let guard = mutex.lock(&os, 10).unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.lock(&os, 10).err(), Some(Error::Time));
        drop(guard);
        assert_eq!(*mutex.lock(&os, 10).unwrap(), 5);
    }
}
