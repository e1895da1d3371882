//! Admission control for concurrent I/O.
//!
//! A [`Throttle`] holds a fixed pool of permits. Plain reads take a fixed
//! cost; batch operations take permits greedily and use the count they were
//! granted as their thread fan-out.
//!
//! Greedy acquisition waits until at least `min_greedy` permits are free,
//! then takes `max(min_greedy, remaining / max_greedy)`, never more than
//! remain. With 13 permits, `min_greedy = 1` and `max_greedy = 2` a greedy
//! caller gets 6 and leaves 7.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::error::{ConfigError, Result, ThrottleError};

/// How often a cancellable wait rechecks its token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Pool size used by [`Throttle::unbounded`].
const UNBOUNDED: usize = usize::MAX >> 2;

/// A shareable cancellation flag for blocking permit waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every wait observing this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A counting permit pool.
#[derive(Debug)]
pub struct Throttle {
    total: usize,
    min_greedy: usize,
    max_greedy: usize,
    remaining: Mutex<usize>,
    freed: Condvar,
}

impl Throttle {
    /// Creates a throttle with `total` permits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if either greedy bound is zero or
    /// `min_greedy` exceeds `total`.
    pub fn new(total: usize, min_greedy: usize, max_greedy: usize) -> Result<Self> {
        if min_greedy == 0 || max_greedy == 0 || min_greedy > total {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "throttle ({total}, {min_greedy}, {max_greedy}) needs 0 < min_greedy <= total and max_greedy > 0"
                ),
            }
            .into());
        }
        Ok(Self {
            total,
            min_greedy,
            max_greedy,
            remaining: Mutex::new(total),
            freed: Condvar::new(),
        })
    }

    /// A throttle that never blocks. Greedy callers get a single permit.
    pub fn unbounded() -> Self {
        Self {
            total: UNBOUNDED,
            min_greedy: 1,
            max_greedy: UNBOUNDED,
            remaining: Mutex::new(UNBOUNDED),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Permits currently free.
    pub fn current_state(&self) -> usize {
        *self.lock()
    }

    /// Pool size.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Takes the permits for one read, blocking until they are free.
    pub fn acquire_read_permit(&self) -> Permits<'_> {
        let mut remaining = self.lock();
        while *remaining < self.min_greedy {
            remaining = self.freed.wait(remaining).unwrap_or_else(|e| e.into_inner());
        }
        *remaining -= self.min_greedy;
        Permits {
            throttle: self,
            count: self.min_greedy,
        }
    }

    /// Returns a read permit. Same as dropping it.
    pub fn release_read_permit(&self, permit: Permits<'_>) {
        permit.release_permits();
    }

    fn grant(&self, remaining: &mut usize) -> Permits<'_> {
        let count = self
            .min_greedy
            .max(*remaining / self.max_greedy)
            .min(*remaining);
        *remaining -= count;
        debug!(granted = count, left = *remaining, "greedy permit grant");
        Permits {
            throttle: self,
            count,
        }
    }

    /// Takes as many permits as the greedy rule allows, blocking until at
    /// least `min_greedy` are free.
    pub fn greedy_acquire_permits(&self) -> Permits<'_> {
        let mut remaining = self.lock();
        while *remaining < self.min_greedy {
            remaining = self.freed.wait(remaining).unwrap_or_else(|e| e.into_inner());
        }
        self.grant(&mut remaining)
    }

    /// Like [`Throttle::greedy_acquire_permits`] but gives up when `cancel`
    /// fires. Nothing is held when it returns an error.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Interrupted`] if cancelled while waiting.
    pub fn greedy_acquire_permits_cancellable(&self, cancel: &CancelToken) -> Result<Permits<'_>> {
        let mut remaining = self.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(ThrottleError::Interrupted.into());
            }
            if *remaining >= self.min_greedy {
                return Ok(self.grant(&mut remaining));
            }
            remaining = self
                .freed
                .wait_timeout(remaining, CANCEL_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Takes exactly `count` permits, blocking until they are free.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::Unsatisfiable`] if `count` exceeds the pool.
    pub fn acquire_permits(&self, count: usize) -> Result<Permits<'_>> {
        if count > self.total {
            return Err(ThrottleError::Unsatisfiable {
                requested: count,
                total: self.total,
            }
            .into());
        }
        let mut remaining = self.lock();
        while *remaining < count {
            remaining = self.freed.wait(remaining).unwrap_or_else(|e| e.into_inner());
        }
        *remaining -= count;
        Ok(Permits {
            throttle: self,
            count,
        })
    }

    fn release(&self, count: usize) {
        let mut remaining = self.lock();
        *remaining += count;
        self.freed.notify_all();
    }
}

/// Permits held from a [`Throttle`]. Returned on drop.
#[derive(Debug)]
#[must_use = "permits are released as soon as they are dropped"]
pub struct Permits<'a> {
    throttle: &'a Throttle,
    count: usize,
}

impl Permits<'_> {
    /// Number of permits held. Batch operations use this as their fan-out.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the permits to the pool.
    pub fn release_permits(self) {
        drop(self);
    }
}

impl Drop for Permits<'_> {
    fn drop(&mut self) {
        if self.count > 0 {
            self.throttle.release(self.count);
            self.count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_greedy_arithmetic() {
        let throttle = Throttle::new(13, 1, 2).unwrap();
        let permits = throttle.greedy_acquire_permits();
        assert_eq!(permits.count(), 6);
        assert_eq!(throttle.current_state(), 7);
        permits.release_permits();
        assert_eq!(throttle.current_state(), 13);
    }

    #[test]
    fn test_greedy_never_below_min_or_above_remaining() {
        let throttle = Throttle::new(4, 3, 8).unwrap();
        let first = throttle.greedy_acquire_permits();
        assert_eq!(first.count(), 3);
        assert_eq!(throttle.current_state(), 1);
        drop(first);

        let throttle = Throttle::new(3, 3, 1).unwrap();
        assert_eq!(throttle.greedy_acquire_permits().count(), 3);
    }

    #[test]
    fn test_read_permits_block_until_released() {
        let throttle = Arc::new(Throttle::new(1, 1, 1).unwrap());
        let held = throttle.acquire_read_permit();
        assert_eq!(throttle.current_state(), 0);

        let waiter = {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || {
                let permit = throttle.acquire_read_permit();
                throttle.release_read_permit(permit);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        waiter.join().unwrap();
        assert_eq!(throttle.current_state(), 1);
    }

    #[test]
    fn test_cancelled_wait_holds_nothing() {
        let throttle = Arc::new(Throttle::new(2, 2, 1).unwrap());
        let held = throttle.greedy_acquire_permits();
        assert_eq!(throttle.current_state(), 0);

        let cancel = CancelToken::new();
        let waiter = {
            let throttle = Arc::clone(&throttle);
            let cancel = cancel.clone();
            thread::spawn(move || throttle.greedy_acquire_permits_cancellable(&cancel).map(|p| p.count()))
        };
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, crate::FsError::Throttle(ThrottleError::Interrupted)));

        drop(held);
        assert_eq!(throttle.current_state(), 2);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Throttle::new(1, 0, 1).is_err());
        assert!(Throttle::new(1, 2, 1).is_err());
        assert!(Throttle::new(1, 1, 0).is_err());
        let throttle = Throttle::new(2, 1, 1).unwrap();
        assert!(throttle.acquire_permits(3).is_err());
    }

    #[test]
    fn test_unbounded_grants_one() {
        let throttle = Throttle::unbounded();
        let a = throttle.greedy_acquire_permits();
        let b = throttle.greedy_acquire_permits();
        assert_eq!((a.count(), b.count()), (1, 1));
    }

    #[test]
    fn test_concurrent_churn_conserves_permits() {
        let throttle = Arc::new(Throttle::new(5, 1, 2).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let p = throttle.greedy_acquire_permits();
                        assert!(p.count() >= 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(throttle.current_state(), 5);
    }
}
