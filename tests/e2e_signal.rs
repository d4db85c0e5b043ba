//! E2E: signal delivery as events.
//!
//! Runs without the libtest harness: reliable signalfd/kqueue delivery
//! needs the signal blocked on *every* thread, so the mask is set on the
//! main thread before any other thread exists, and worker threads inherit
//! it. SIGCHLD (default ignore) keeps a stray unblocked delivery harmless.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use swell::{Reactor, SignalKind};

use common::{init_test_logging, test_config, wait_until};

fn raise_to_process(kind: SignalKind) {
    #[allow(unsafe_code)]
    unsafe {
        libc::kill(libc::getpid(), kind.as_raw());
    }
}

fn main() {
    init_test_logging();

    let reactor = Reactor::new(test_config(2)).expect("engine");

    // Install the watches before any worker thread exists.
    let seen = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&seen);
    reactor
        .signal_event(SignalKind::Child, move |kind| {
            assert_eq!(kind, SignalKind::Child);
            // Keep watching for the first two deliveries, then stop.
            count.fetch_add(1, Ordering::SeqCst) < 1
        })
        .expect("signal_event");

    let waited = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&waited);
    reactor
        .signal_thread(&[SignalKind::User1], move |kind| {
            assert_eq!(kind, SignalKind::User1);
            count.fetch_add(1, Ordering::SeqCst);
            false
        })
        .expect("signal_thread");

    reactor.add_thread(2).expect("workers");
    std::thread::sleep(Duration::from_millis(100));

    // First delivery: callback returns true, watch stays armed.
    raise_to_process(SignalKind::Child);
    assert!(
        wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 1),
        "first SIGCHLD was not delivered as an event"
    );

    // Second delivery: callback returns false, watch is removed.
    raise_to_process(SignalKind::Child);
    assert!(
        wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 2),
        "second SIGCHLD was not delivered"
    );

    // Third delivery must be ignored by the now-stopped watch.
    std::thread::sleep(Duration::from_millis(100));
    raise_to_process(SignalKind::Child);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        seen.load(Ordering::SeqCst),
        2,
        "stopped signal watch still fired"
    );

    // The sigwait flavor consumes one delivery and exits.
    raise_to_process(SignalKind::User1);
    assert!(
        wait_until(Duration::from_secs(2), || {
            waited.load(Ordering::SeqCst) == 1
        }),
        "signal_thread never observed SIGUSR1"
    );

    reactor.end();
    reactor.join();
    println!("e2e_signal: ok");
}
