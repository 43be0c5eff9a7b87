//! Reference counts with a release hook
//!
//! Memory is owned by `Arc`s throughout the stack. A [`RefCount`] tracks the
//! *logical* lifetime of a shared object (a library handle, an attached host
//! device) so that late users can be turned away once the owner let go.

use crate::error::{Error, Result};
use core::sync::atomic::{AtomicUsize, Ordering};

/// An atomic reference count that starts at one
///
/// Once the count reaches zero it's dead: [`get()`](RefCount::get) and
/// [`put()`](RefCount::put) both fail with [`Error::Perm`].
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// Create a count holding one reference
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// Take another reference
    ///
    /// Fails if the count already dropped to zero, and leaves it there.
    pub fn get(&self) -> Result<()> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count != 0).then(|| count + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::Perm)
    }

    /// Drop a reference
    ///
    /// `release` runs exactly once, on the caller that moves the count from
    /// one to zero. Returns `true` on that call.
    pub fn put(&self, release: impl FnOnce()) -> Result<bool> {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| {
                error!("reference count underflow");
                Error::Perm
            })?;
        if previous == 1 {
            release();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Returns the current number of references
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Indicates if the count reached zero
    pub fn is_dead(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::RefCount;
    use crate::Error;
    use core::cell::Cell;

    #[test]
    fn get_and_put() {
        let refcnt = RefCount::new();
        refcnt.get().unwrap();
        assert_eq!(refcnt.count(), 2);

        let released = Cell::new(0);
        assert!(!refcnt.put(|| released.set(released.get() + 1)).unwrap());
        assert!(refcnt.put(|| released.set(released.get() + 1)).unwrap());
        assert_eq!(released.get(), 1);
        assert!(refcnt.is_dead());
    }

    #[test]
    fn get_after_zero_fails() {
        let refcnt = RefCount::new();
        refcnt.put(|| {}).unwrap();
        assert_eq!(refcnt.get(), Err(Error::Perm));
        assert_eq!(refcnt.count(), 0);
    }

    #[test]
    fn put_after_zero_never_releases_again() {
        let refcnt = RefCount::new();
        let released = Cell::new(0);
        refcnt.put(|| released.set(released.get() + 1)).unwrap();
        assert_eq!(
            refcnt.put(|| released.set(released.get() + 1)),
            Err(Error::Perm)
        );
        assert_eq!(released.get(), 1);
    }
}
