//! The cross-thread note queue behind `Poller::trigger`.

use std::hint;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use concurrent_queue::{ConcurrentQueue, PopError};

/// Lock-free MPSC queue of notes drained by the owning loop on every wake.
///
/// `add` reports whether the queue was empty beforehand, which lets the
/// caller skip the expensive wake syscall when a previous producer already
/// issued one. That elision is sound because producers announce themselves on
/// `pending` before publishing, and `drain` re-checks `pending` after
/// popping: a producer that observed a non-empty queue is always picked up
/// by the drain pass its predecessor's wake started.
pub struct NoteQueue<T> {
    queue: ConcurrentQueue<T>,
    pending: AtomicUsize,
}

impl<T> NoteQueue<T> {
    pub fn new() -> NoteQueue<T> {
        NoteQueue {
            queue: ConcurrentQueue::unbounded(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue a note; returns whether the queue was empty before this call.
    pub fn add(&self, note: T) -> bool {
        let prior = self.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.queue.push(note);
        prior == 0
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every queued note into `iter`, repeating until the pending count
    /// settles at zero. An announced note that has not been linked in yet is
    /// spun for; the window is a handful of instructions on the producer
    /// side.
    ///
    /// When `iter` fails the remaining notes stay queued; the only failing
    /// iterations are shutdown signals, after which the queue is purged
    /// wholesale.
    pub fn drain<F>(&self, mut iter: F) -> io::Result<()>
    where
        F: FnMut(T) -> io::Result<()>,
    {
        loop {
            let announced = self.pending.load(Ordering::Acquire);
            if announced == 0 {
                return Ok(());
            }

            let mut taken = 0;
            let mut result = Ok(());

            while taken < announced {
                match self.queue.pop() {
                    Ok(note) => {
                        taken += 1;
                        if let Err(err) = iter(note) {
                            result = Err(err);
                            break;
                        }
                    }
                    Err(PopError::Empty) => hint::spin_loop(),
                    Err(PopError::Closed) => break,
                }
            }

            let remained = self.pending.fetch_sub(taken, Ordering::AcqRel) - taken;
            result?;

            if remained == 0 {
                return Ok(());
            }
        }
    }
}

impl<T> Default for NoteQueue<T> {
    fn default() -> NoteQueue<T> {
        NoteQueue::new()
    }
}

#[cfg(test)]
mod test {
    use super::NoteQueue;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_reports_was_empty() {
        let queue = NoteQueue::new();

        assert!(queue.add(1));
        assert!(!queue.add(2));

        let mut seen = Vec::new();
        queue
            .drain(|n| {
                seen.push(n);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2]);

        assert!(queue.add(3));
    }

    #[test]
    fn drain_stops_on_error() {
        let queue = NoteQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(3);

        let mut seen = Vec::new();
        let res = queue.drain(|n| {
            seen.push(n);
            if n == 2 {
                Err(std::io::Error::other("stop"))
            } else {
                Ok(())
            }
        });

        assert!(res.is_err());
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn concurrent_adds_all_drained() {
        let queue = Arc::new(NoteQueue::new());
        let producers = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..producers)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..per_thread {
                        queue.add(i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut total = 0usize;
        queue
            .drain(|_| {
                total += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(total, producers * per_thread);
        assert!(queue.is_empty());
    }
}
