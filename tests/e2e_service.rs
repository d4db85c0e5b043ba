//! E2E: process-wide handle — one engine per process, free-function
//! façade, explicit lifecycle.
//!
//! Everything lives in one test because the process-wide engine can only
//! be initialized once.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use swell::service;

use common::{init_test_logging, test_config, wait_until};

#[test]
fn e2e_service_lifecycle_round_trip() {
    init_test_logging();

    assert!(service::try_engine().is_none());
    service::init(test_config(2)).expect("init");
    assert!(service::try_engine().is_some());
    assert!(
        service::init(test_config(2)).is_err(),
        "second init must be rejected"
    );

    // Free-function listen + write.
    let accepted: Arc<Mutex<Vec<socket2::Socket>>> = Arc::new(Mutex::new(Vec::new()));
    let conns = Arc::clone(&accepted);
    let listener = service::engine()
        .listen("127.0.0.1:0".parse().unwrap(), 64, move |conn| {
            let conn = conn.expect("accept");
            let fd = conn.as_raw_fd();
            conns.lock().push(conn);
            service::write(fd, &b"ready"[..]).expect("facade write");
        })
        .expect("listen");
    let addr = listener.local_addr().unwrap();

    service::start().expect("start workers");

    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).expect("read greeting");
    assert_eq!(&buf, b"ready");

    // Deferred tasks and timers through the façade.
    let ticks = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&ticks);
    service::submit(move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let count = Arc::clone(&ticks);
    service::timer_event(Duration::from_millis(20), None, move || {
        count.fetch_add(1, Ordering::SeqCst);
    })
    .expect("timer");
    assert!(wait_until(Duration::from_secs(2), || {
        ticks.load(Ordering::SeqCst) == 2
    }));

    assert!(!service::is_end());
    service::end();
    assert!(service::is_end());
    service::join();
}
