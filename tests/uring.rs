//! Scenarios against the real kernel ring. Each test skips itself when the
//! kernel (or a sandbox) refuses `io_uring_setup(2)`.

use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::Bytes;
use uring_objects::{Error, KernelRing, Output};

fn kernel_ring() -> Option<KernelRing> {
    let mut ring = KernelRing::new();
    match ring.setup(8, 0) {
        Ok(()) => Some(ring),
        Err(Error::SystemCall { code })
            if matches!(code, libc::ENOSYS | libc::EPERM | libc::EACCES) =>
        {
            eprintln!("skipping: io_uring unavailable (errno {code})");
            None
        }
        Err(err) => panic!("ring setup failed: {err}"),
    }
}

#[test]
fn nop_round_trip() {
    let Some(mut ring) = kernel_ring() else {
        return;
    };
    let op = ring.acquire_operation().unwrap();
    op.prepare_nop().unwrap();
    assert_eq!(ring.submit().unwrap(), 1);

    let completion = ring.wait_one().unwrap();
    assert_eq!(completion.extract_result().unwrap(), Output::Empty);
    let ready = ring.completion_ready_count();
    ring.acknowledge(&completion).unwrap();
    assert_eq!(ring.completion_ready_count(), ready - 1);
}

#[test]
fn send_recv_ping() {
    let Some(mut ring) = kernel_ring() else {
        return;
    };
    let (a, b) = UnixStream::pair().unwrap();

    let send = ring.acquire_operation().unwrap();
    send.prepare_send(a.as_raw_fd(), Bytes::from_static(b"ping"), 0)
        .unwrap();
    let recv = ring.acquire_operation().unwrap();
    recv.prepare_recv(b.as_raw_fd(), 64, 0).unwrap();
    assert_eq!(ring.submit().unwrap(), 2);

    let completions = ring.wait_completions(2, None).unwrap();
    let received = completions
        .iter()
        .find(|c| c.operation().ptr_eq(&recv))
        .unwrap();
    assert_eq!(
        received.extract_result().unwrap(),
        Output::Data(Bytes::from_static(b"ping"))
    );
    for completion in &completions {
        ring.acknowledge(completion).unwrap();
    }
}

#[test]
fn recv_truncates_to_transferred_length() {
    let Some(mut ring) = kernel_ring() else {
        return;
    };
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(b"abc").unwrap();

    let recv = ring.acquire_operation().unwrap();
    recv.prepare_recv(b.as_raw_fd(), 4096, 0).unwrap();
    ring.submit().unwrap();

    let completion = ring.wait_one().unwrap();
    assert_eq!(completion.result_code(), 3);
    let Output::Data(data) = completion.extract_result().unwrap() else {
        panic!("recv yields data");
    };
    assert_eq!(data.len(), 3);
    ring.acknowledge(&completion).unwrap();
}

#[test]
fn timeout_expires_with_etime() {
    let Some(mut ring) = kernel_ring() else {
        return;
    };
    let timer = ring.acquire_operation().unwrap();
    timer
        .prepare_timeout(Duration::from_millis(5), 0, 0)
        .unwrap();
    ring.submit().unwrap();

    let completion = ring.wait_one().unwrap();
    assert_eq!(completion.result_code(), -libc::ETIME);
    ring.acknowledge(&completion).unwrap();
}

#[test]
fn bounded_wait_times_out() {
    let Some(mut ring) = kernel_ring() else {
        return;
    };
    let err = ring
        .wait_completions(1, Some(Duration::from_millis(5)))
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error {err:?}");
}

#[test]
fn fresh_ring_reports_capacity() {
    let Some(ring) = kernel_ring() else {
        return;
    };
    assert_eq!(ring.submission_capacity_remaining(), 8);
    assert_eq!(ring.pending_count(), 0);
    assert_eq!(ring.completion_ready_count(), 0);
    assert!(ring.eventfd_enabled());
}
