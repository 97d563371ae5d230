//! Timing wheel under load: a thousand timers with random delays, half of
//! them stopped before firing.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use hive::TimingWheel;

#[test]
fn thousand_random_timers() {
    let wheel = TimingWheel::new(Duration::from_millis(5), 16);
    wheel.start().unwrap();

    let begin = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));
    let worst_late = Arc::new(AtomicI64::new(0));

    let mut rng = rand::rng();
    let mut timers = Vec::with_capacity(1000);

    for _ in 0..1000 {
        let delay = rng.random_range(1..2000u64);
        let expected = begin.elapsed().as_millis() as i64 + delay as i64;

        let fired = fired.clone();
        let worst_late = worst_late.clone();
        let timer = wheel.after_func(Duration::from_millis(delay), move || {
            let late = begin.elapsed().as_millis() as i64 - expected;
            worst_late.fetch_max(late, Ordering::SeqCst);
            fired.fetch_add(1, Ordering::SeqCst);
        });

        timers.push(timer);
    }

    let mut stopped = 0usize;
    for timer in &timers {
        if rng.random_bool(0.5) && timer.stop() {
            stopped += 1;
        }
    }

    // longest delay plus slack
    std::thread::sleep(Duration::from_millis(2600));

    assert_eq!(fired.load(Ordering::SeqCst), 1000 - stopped);

    // one wheel tick of drift is expected; whole-second drift is a bug
    assert!(
        worst_late.load(Ordering::SeqCst) < 1000,
        "worst lateness {}ms",
        worst_late.load(Ordering::SeqCst)
    );

    wheel.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1000 - stopped);
}

#[test]
fn stop_is_exact() {
    let wheel = TimingWheel::new(Duration::from_millis(5), 16);
    wheel.start().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let timer = wheel.after_func(Duration::from_millis(300), move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    assert!(timer.stop(), "stop before expiry must win");
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // a fired timer reports false from stop
    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let timer = wheel.after_func(Duration::from_millis(10), move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!timer.stop());
}
