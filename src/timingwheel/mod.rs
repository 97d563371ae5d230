//! Hashed hierarchical timing wheel.
//!
//! A wheel with tick `T` and `S` slots covers `T * S` of future time; timers
//! past that horizon land in a lazily created overflow wheel whose tick is
//! the child's full interval. A driver thread pops due buckets off a delay
//! queue, advances the clock, and flushes each bucket by re-inserting its
//! timers: entries destined for the current tick fire, the rest cascade into
//! finer slots.
//!
//! Tasks run on the driver thread; keep them cheap (the event loops only
//! ever schedule a `Poller::trigger` call).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod bucket;
mod delay_queue;

use bucket::{Bucket, Slot};
use delay_queue::DelayQueue;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TimerInner {
    expiration: i64,
    task: Mutex<Option<Task>>,
    slot: Mutex<Option<Slot>>,
}

/// Handle to a scheduled task, returned by `TimingWheel::after_func`.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Cancel the timer. `true` means the task will never run; `false` means
    /// it already fired or was already stopped. A stop racing a cascade
    /// retries until the membership handle settles.
    pub fn stop(&self) -> bool {
        loop {
            let slot = self.inner.slot.lock().unwrap().clone();

            let Some(slot) = slot else {
                return false;
            };

            let Some(bucket) = slot.bucket.upgrade() else {
                // wheel is gone; the task can no longer fire
                *self.inner.slot.lock().unwrap() = None;
                return false;
            };

            if bucket.remove(&self.inner, slot.key) {
                return true;
            }

            // the driver is flushing this bucket; wait for the timer to
            // either fire (slot cleared) or cascade (slot re-pointed)
            thread::yield_now();
        }
    }
}

struct Wheel {
    tick: i64,
    size: usize,
    interval: i64,
    current: i64,
    buckets: Vec<Arc<Bucket>>,
    overflow: Option<Box<Wheel>>,
}

impl Wheel {
    fn new(tick: i64, size: usize, start: i64) -> Wheel {
        Wheel {
            tick,
            size,
            interval: tick * size as i64,
            current: truncate(start, tick),
            buckets: (0..size).map(|_| Arc::new(Bucket::new())).collect(),
            overflow: None,
        }
    }

    /// Place the timer in the right wheel and bucket; false means the timer
    /// is already due and the caller fires it.
    fn add(&mut self, timer: &Arc<TimerInner>, queue: &DelayQueue) -> bool {
        let expiration = timer.expiration;

        if expiration < self.current + self.tick {
            false
        } else if expiration < self.current + self.interval {
            let virtual_id = expiration / self.tick;
            let bucket = &self.buckets[virtual_id as usize % self.size];
            bucket.add(timer, Arc::downgrade(bucket));

            if bucket.set_expiration(virtual_id * self.tick) {
                queue.offer(bucket.clone(), virtual_id * self.tick);
            }

            true
        } else {
            let overflow = self.overflow.get_or_insert_with(|| {
                Box::new(Wheel::new(self.interval, self.size, self.current))
            });
            overflow.add(timer, queue)
        }
    }

    fn advance(&mut self, expiration: i64) {
        if expiration >= self.current + self.tick {
            self.current = truncate(expiration, self.tick);

            if let Some(overflow) = &mut self.overflow {
                overflow.advance(self.current);
            }
        }
    }
}

fn truncate(value: i64, tick: i64) -> i64 {
    value - value % tick
}

struct Inner {
    start: Instant,
    wheel: Mutex<Wheel>,
    queue: DelayQueue,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn now(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    fn add_or_run(&self, timer: &Arc<TimerInner>) {
        let pending = self.wheel.lock().unwrap().add(timer, &self.queue);

        if !pending {
            // already due; runs on the caller (insert or driver) thread
            let task = timer.task.lock().unwrap().take();
            if let Some(task) = task {
                task();
            }
        }
    }

    fn work(&self) {
        while !self.closed.load(Ordering::Acquire) {
            let Some(bucket) = self.queue.poll(&self.closed, || self.now()) else {
                continue;
            };

            let expiration = bucket.expiration();
            self.wheel.lock().unwrap().advance(expiration);

            for timer in bucket.drain() {
                *timer.slot.lock().unwrap() = None;
                self.add_or_run(&timer);
            }
        }
    }
}

/// A started wheel owns one driver thread; `stop` (or drop) joins it and
/// abandons whatever timers are still pending.
pub struct TimingWheel {
    inner: Arc<Inner>,
}

impl TimingWheel {
    /// `tick` is rounded down to whole milliseconds and must be >= 1ms.
    pub fn new(tick: Duration, size: usize) -> TimingWheel {
        let tick = tick.as_millis() as i64;
        assert!(tick >= 1, "tick must be at least one millisecond");
        assert!(size > 0, "wheel size must be positive");

        TimingWheel {
            inner: Arc::new(Inner {
                start: Instant::now(),
                wheel: Mutex::new(Wheel::new(tick, size, 0)),
                queue: DelayQueue::new(),
                closed: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) -> io::Result<()> {
        let mut worker = self.inner.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("timing-wheel".to_string())
            .spawn(move || inner.work())?;

        *worker = Some(handle);
        Ok(())
    }

    /// Stop the driver. Pending timers are left un-fired.
    pub fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.wake();

        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Schedule `task` to run once, `delay` from now. A delay below one tick
    /// runs the task immediately on the calling thread.
    pub fn after_func(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Timer {
        let expiration = self.inner.now() + delay.as_millis() as i64;

        let timer = Arc::new(TimerInner {
            expiration,
            task: Mutex::new(Some(Box::new(task))),
            slot: Mutex::new(None),
        });

        self.inner.add_or_run(&timer);

        Timer { inner: timer }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::TimingWheel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn fires_roughly_on_time() {
        let wheel = TimingWheel::new(Duration::from_millis(1), 20);
        wheel.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let begin = Instant::now();
        wheel.after_func(Duration::from_millis(200), move || {
            tx.send(begin.elapsed()).unwrap();
        });

        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(199), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[test]
    fn cascades_from_overflow_wheel() {
        // 1ms x 20 slots: a 300ms timer starts two wheels up
        let wheel = TimingWheel::new(Duration::from_millis(1), 20);
        wheel.start().unwrap();

        let (tx, rx) = mpsc::channel();
        wheel.after_func(Duration::from_millis(300), move || {
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn stopped_timer_never_fires() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 10);
        wheel.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let timer = wheel.after_func(Duration::from_millis(500), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.stop());
        assert!(!timer.stop());

        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_delay_runs_inline() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 10);
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();

        let timer = wheel.after_func(Duration::ZERO, move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.stop());
    }

    #[test]
    fn stop_leaves_pending_timers_unfired() {
        let wheel = TimingWheel::new(Duration::from_millis(10), 10);
        wheel.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        wheel.after_func(Duration::from_secs(60), move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        wheel.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
