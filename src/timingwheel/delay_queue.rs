use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::bucket::Bucket;

struct Entry {
    expiration: i64,
    bucket: Arc<Bucket>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.expiration == other.expiration
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        // reversed: BinaryHeap is a max-heap, we want the soonest expiration
        other.expiration.cmp(&self.expiration)
    }
}

/// Min-heap of buckets keyed by expiration, blocking the wheel driver until
/// the next bucket is due.
pub(crate) struct DelayQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
}

impl DelayQueue {
    pub fn new() -> DelayQueue {
        DelayQueue {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
        }
    }

    pub fn offer(&self, bucket: Arc<Bucket>, expiration: i64) {
        let mut heap = self.heap.lock().unwrap();
        let preempts = heap
            .peek()
            .map_or(true, |head| expiration < head.expiration);

        heap.push(Entry { expiration, bucket });

        if preempts {
            self.available.notify_one();
        }
    }

    /// Block until the soonest bucket is due, then pop and return it.
    /// Returns None once `closed` is observed.
    pub fn poll(&self, closed: &AtomicBool, now: impl Fn() -> i64) -> Option<Arc<Bucket>> {
        let mut heap = self.heap.lock().unwrap();

        loop {
            if closed.load(Ordering::Acquire) {
                return None;
            }

            let delay = match heap.peek() {
                None => None,
                Some(entry) => {
                    let delay = entry.expiration - now();
                    if delay <= 0 {
                        let entry = heap.pop().unwrap();
                        return Some(entry.bucket);
                    }
                    Some(Duration::from_millis(delay as u64))
                }
            };

            heap = match delay {
                None => self.available.wait(heap).unwrap(),
                Some(delay) => self.available.wait_timeout(heap, delay).unwrap().0,
            };
        }
    }

    /// Kick a blocked `poll`; used on shutdown and never spurious-unsafe.
    pub fn wake(&self) {
        self.available.notify_all();
    }
}
