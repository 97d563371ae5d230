use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slab::Slab;

use super::TimerInner;

/// A timer's membership handle: the owning bucket and its slab key. Cleared
/// on removal and on flush; `Timer::stop` and the driver race on it through
/// the bucket's timer lock.
#[derive(Clone)]
pub(crate) struct Slot {
    pub bucket: Weak<Bucket>,
    pub key: usize,
}

/// A set of timers sharing one (rounded) expiration.
pub(crate) struct Bucket {
    expiration: AtomicI64,
    timers: Mutex<Slab<Arc<TimerInner>>>,
}

impl Bucket {
    pub fn new() -> Bucket {
        Bucket {
            expiration: AtomicI64::new(-1),
            timers: Mutex::new(Slab::new()),
        }
    }

    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::Acquire)
    }

    /// Returns true iff the expiration changed; the caller then (re)offers
    /// the bucket to the delay queue.
    pub fn set_expiration(&self, expiration: i64) -> bool {
        self.expiration.swap(expiration, Ordering::AcqRel) != expiration
    }

    pub fn add(&self, timer: &Arc<TimerInner>, back: Weak<Bucket>) {
        let mut timers = self.timers.lock().unwrap();
        let key = timers.insert(timer.clone());
        *timer.slot.lock().unwrap() = Some(Slot { bucket: back, key });
    }

    /// Remove `timer` if it is still a member; the identity check resolves
    /// the race against a concurrent flush.
    pub fn remove(&self, timer: &Arc<TimerInner>, key: usize) -> bool {
        let mut timers = self.timers.lock().unwrap();
        match timers.get(key) {
            Some(current) if Arc::ptr_eq(current, timer) => {
                timers.remove(key);
                *timer.slot.lock().unwrap() = None;
                true
            }
            _ => false,
        }
    }

    /// Take every timer out and reset the expiration to unset. The caller
    /// re-inserts or fires each timer afterwards.
    pub fn drain(&self) -> Vec<Arc<TimerInner>> {
        let mut timers = self.timers.lock().unwrap();
        self.expiration.store(-1, Ordering::Release);
        timers.drain().collect()
    }
}
