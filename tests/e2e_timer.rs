//! E2E: timers — one-shot removal, periodic reactivation, worker-thread
//! flavor.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use swell::Reactor;

use common::{init_test_logging, test_config, wait_until};

#[test]
fn e2e_one_shot_timer_fires_exactly_once() {
    init_test_logging();
    let reactor = Reactor::new(test_config(2)).expect("engine");
    reactor.add_thread(2).expect("workers");

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    reactor
        .timer_event(Duration::from_millis(30), None, move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("timer_event");

    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    // Long enough that a wrongly-periodic timer would fire again.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    reactor.end();
    reactor.join();
}

#[test]
fn e2e_periodic_timer_keeps_firing() {
    init_test_logging();
    let reactor = Reactor::new(test_config(2)).expect("engine");
    reactor.add_thread(2).expect("workers");

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    reactor
        .timer_event(
            Duration::from_millis(20),
            Some(Duration::from_millis(25)),
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("timer_event");

    assert!(
        wait_until(Duration::from_secs(3), || fired.load(Ordering::SeqCst) >= 4),
        "periodic timer fired only {} times",
        fired.load(Ordering::SeqCst)
    );

    reactor.end();
    reactor.join();
}

#[test]
fn e2e_timer_thread_one_shot_and_periodic() {
    init_test_logging();
    // The thread flavor pins a worker; leave one free for the pool.
    let reactor = Reactor::new(test_config(3)).expect("engine");
    reactor.add_thread(3).expect("workers");

    let once = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&once);
    reactor.timer_thread(Duration::from_millis(20), None, move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(2), || {
        once.load(Ordering::SeqCst) == 1
    }));

    let repeated = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&repeated);
    reactor.timer_thread(
        Duration::from_millis(10),
        Some(Duration::from_millis(20)),
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        },
    );
    assert!(wait_until(Duration::from_secs(3), || {
        repeated.load(Ordering::SeqCst) >= 3
    }));

    reactor.end();
    reactor.join();
}
