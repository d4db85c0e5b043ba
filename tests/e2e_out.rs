//! E2E: output subsystem — ordering across short and deferred writes,
//! nonblocking submission, exactly-once finalizers, vectored and
//! file-region segments, batch commit.

mod common;

use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use swell::{Reactor, Xfer};

use common::{init_test_logging, test_config, wait_until};

/// Writing to a peer that already went away must surface as an engine-side
/// reset, not a process-killing SIGPIPE.
fn ignore_sigpipe() {
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

struct Server {
    reactor: Reactor,
    accepted: Arc<Mutex<Vec<socket2::Socket>>>,
    addr: std::net::SocketAddr,
}

/// Listener that parks every accepted socket for the test body to drive.
fn server(workers: usize) -> Server {
    let reactor = Reactor::new(test_config(workers)).expect("engine");
    let accepted: Arc<Mutex<Vec<socket2::Socket>>> = Arc::new(Mutex::new(Vec::new()));
    let conns = Arc::clone(&accepted);
    let listener = reactor
        .listen("127.0.0.1:0".parse().unwrap(), 128, move |conn| {
            conns.lock().push(conn.expect("accept"));
        })
        .expect("listen");
    let addr = listener.local_addr().unwrap();
    reactor.add_thread(workers).expect("workers");
    Server {
        reactor,
        accepted,
        addr,
    }
}

fn accepted_fd(server: &Server) -> i32 {
    assert!(wait_until(Duration::from_secs(2), || {
        !server.accepted.lock().is_empty()
    }));
    server.accepted.lock()[0].as_raw_fd()
}

#[test]
fn e2e_bytes_arrive_in_submission_order_across_backpressure() {
    init_test_logging();
    ignore_sigpipe();
    let server = server(2);
    let mut client = TcpStream::connect(server.addr).expect("connect");
    let fd = accepted_fd(&server);

    // Mixed sizes, some far beyond the socket buffer, submitted from one
    // thread in sequence.
    let mut expected = Vec::new();
    for i in 0..60u32 {
        let len = if i % 7 == 0 { 256 * 1024 } else { 37 * (i as usize + 1) };
        let chunk = vec![(i % 251) as u8; len];
        expected.extend_from_slice(&chunk);
        server
            .reactor
            .write(fd, Bytes::from(chunk))
            .expect("queued write");
    }

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).expect("read everything");
    assert_eq!(received, expected, "byte order or content diverged");

    server.reactor.end();
    server.reactor.join();
}

#[test]
fn e2e_large_write_never_blocks_the_caller() {
    init_test_logging();
    ignore_sigpipe();
    let server = server(2);
    let mut client = TcpStream::connect(server.addr).expect("connect");
    let fd = accepted_fd(&server);

    let delivered = Arc::new(AtomicUsize::new(0));
    let fin = Arc::clone(&delivered);
    let payload = vec![0x5au8; 16 * 1024 * 1024];
    let total = payload.len();

    let started = Instant::now();
    server
        .reactor
        .write_with(fd, Bytes::from(payload), move || {
            fin.store(1, Ordering::SeqCst);
        })
        .expect("submit");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "write blocked the caller for {:?}",
        started.elapsed()
    );

    // Slow reader drains; every byte must eventually land.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let mut seen = 0usize;
    while seen < total {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assert!(buf[..n].iter().all(|&b| b == 0x5a));
                seen += n;
            }
            Err(e) => panic!("client read failed: {e}"),
        }
    }
    assert_eq!(seen, total);
    assert!(wait_until(Duration::from_secs(2), || {
        delivered.load(Ordering::SeqCst) == 1
    }));

    server.reactor.end();
    server.reactor.join();
}

#[test]
fn e2e_finalizer_fires_once_on_abandonment() {
    init_test_logging();
    ignore_sigpipe();
    let server = server(2);
    let client = TcpStream::connect(server.addr).expect("connect");
    let fd = accepted_fd(&server);

    // Kill the peer so the queued remainder can never be delivered.
    drop(client);
    std::thread::sleep(Duration::from_millis(50));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let huge = vec![1u8; 32 * 1024 * 1024];
    server
        .reactor
        .write_with(fd, Bytes::from(huge), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit");

    assert!(
        wait_until(Duration::from_secs(3), || fired.load(Ordering::SeqCst) == 1),
        "finalizer never fired on abandonment"
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1, "finalizer fired twice");

    server.reactor.end();
    server.reactor.join();
}

#[test]
fn e2e_vectored_and_file_segments_keep_content() {
    init_test_logging();
    ignore_sigpipe();
    let server = server(2);
    let mut client = TcpStream::connect(server.addr).expect("connect");
    let fd = accepted_fd(&server);

    // Scratch file with a known pattern.
    let path = std::env::temp_dir().join(format!("swell-out-{}.bin", std::process::id()));
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(&path, &body).expect("scratch file");
    let file = Arc::new(File::open(&path).expect("open scratch"));

    server
        .reactor
        .writev(fd, [Bytes::from_static(b"HD"), Bytes::from_static(b"R:")])
        .expect("writev");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    server
        .reactor
        .hsend_file_with(fd, &b"len=100000;"[..], file, 0, body.len(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("hsend_file");

    let mut expected = b"HDR:len=100000;".to_vec();
    expected.extend_from_slice(&body);

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).expect("read everything");
    assert_eq!(received, expected);
    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    let _ = std::fs::remove_file(&path);
    server.reactor.end();
    server.reactor.join();
}

#[test]
fn e2e_commit_merges_behind_inflight_queue() {
    init_test_logging();
    ignore_sigpipe();
    let server = server(2);
    let mut client = TcpStream::connect(server.addr).expect("connect");
    let fd = accepted_fd(&server);

    // Occupy the queue first so the batch lands behind in-flight bytes.
    let lead = vec![9u8; 8 * 1024 * 1024];
    server
        .reactor
        .write(fd, Bytes::from(lead.clone()))
        .expect("lead write");

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let mut batch = Xfer::new();
    batch.push_write(&b"first"[..]);
    batch.push_writev([Bytes::from_static(b"-"), Bytes::from_static(b"second")]);
    batch.push_finalize(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.reactor.commit(fd, &mut batch).expect("commit batch");
    assert!(batch.is_empty(), "commit must take the whole batch");

    let mut expected = lead;
    expected.extend_from_slice(b"first-second");

    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).expect("read everything");
    assert_eq!(received, expected);
    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    server.reactor.end();
    server.reactor.join();
}
