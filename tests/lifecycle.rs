use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use bytes::Bytes;
use uring_objects::constants::SETUP_CLAMP;
use uring_objects::{
    BlockingTransport, Error, Opcode, OperationState, Output, Ring, RingConfig,
};

type TestRing = Ring<BlockingTransport>;

fn ring() -> TestRing {
    let mut ring = TestRing::new();
    ring.setup_with(&RingConfig::builder().queue_depth(16).build())
        .unwrap();
    ring
}

#[test]
fn file_write_then_read_at_offset() {
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let mut ring = ring();

    let write = ring.acquire_operation().unwrap();
    write
        .prepare_write(fd, Bytes::from_static(b"object model"), 4)
        .unwrap();
    assert_eq!(ring.submit().unwrap(), 1);
    let written = ring.wait_one().unwrap();
    assert_eq!(written.extract_result().unwrap(), Output::Value(12));
    ring.acknowledge(&written).unwrap();

    let read = ring.acquire_operation().unwrap();
    read.prepare_read(fd, 64, 4).unwrap();
    ring.submit().unwrap();
    let completion = ring.wait_one().unwrap();
    assert_eq!(completion.opcode(), Some(Opcode::Read));
    assert_eq!(
        completion.extract_result().unwrap(),
        Output::Data(Bytes::from_static(b"object model"))
    );
    ring.acknowledge(&completion).unwrap();
    assert_eq!(read.state(), OperationState::Acknowledged);
}

#[test]
fn read_past_end_yields_empty_data() {
    let file = tempfile::tempfile().unwrap();
    let mut ring = ring();
    let read = ring.acquire_operation().unwrap();
    read.prepare_read(file.as_raw_fd(), 16, 0).unwrap();
    ring.submit().unwrap();

    let completion = ring.wait_one().unwrap();
    assert_eq!(completion.result_code(), 0);
    assert_eq!(
        completion.extract_result().unwrap(),
        Output::Data(Bytes::new())
    );
}

#[test]
fn connect_accept_and_close() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let target = listener.local_addr().unwrap();

    // SAFETY: plain socket(2) call; the fd is closed through the ring below.
    let client = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(client >= 0);

    let mut ring = ring();
    let connect = ring.acquire_operation().unwrap();
    connect.prepare_connect(client, target).unwrap();
    let accept = ring.acquire_operation().unwrap();
    accept
        .prepare_accept(listener.as_raw_fd(), libc::SOCK_CLOEXEC)
        .unwrap();
    assert_eq!(ring.submit().unwrap(), 2);

    let completions = ring.wait_completions(2, None).unwrap();
    let connected = &completions[0];
    let accepted = &completions[1];
    assert!(connected.operation().ptr_eq(&connect));
    assert_eq!(connected.extract_result().unwrap(), Output::Value(0));

    let Output::Value(server) = accepted.extract_result().unwrap() else {
        panic!("accept yields a descriptor");
    };
    let peer = accepted.accepted_peer().unwrap();
    assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
    assert!(connected.accepted_peer().is_err());

    for completion in &completions {
        ring.acknowledge(completion).unwrap();
    }

    let close_server = ring.acquire_operation().unwrap();
    close_server.prepare_close(server as i32).unwrap();
    let close_client = ring.acquire_operation().unwrap();
    close_client.prepare_close(client).unwrap();
    ring.submit().unwrap();
    for completion in ring.wait_completions(2, None).unwrap() {
        assert_eq!(completion.extract_result().unwrap(), Output::Value(0));
        ring.acknowledge(&completion).unwrap();
    }
}

#[test]
fn connect_refuses_ipv6() {
    let mut ring = ring();
    let op = ring.acquire_operation().unwrap();
    let addr: SocketAddr = "[::1]:80".parse().unwrap();
    assert!(matches!(
        op.prepare_connect(3, addr),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(ring.submit(), Err(Error::InvalidState(_))));
}

#[test]
fn cancel_of_finished_operation_reports_not_found() {
    let mut ring = ring();
    let target = ring.acquire_operation().unwrap();
    target.prepare_nop().unwrap();
    ring.submit().unwrap();

    let cancel = ring.acquire_operation().unwrap();
    cancel.prepare_cancel(&target).unwrap();
    ring.submit().unwrap();

    let completions = ring.wait_completions(2, None).unwrap();
    assert_eq!(completions[0].extract_result().unwrap(), Output::Empty);
    assert_eq!(
        completions[1].extract_result().unwrap_err(),
        Error::SystemCall { code: libc::ENOENT }
    );
}

#[test]
fn count_armed_timeout_fires_on_completions() {
    let mut ring = ring();
    let timer = ring.acquire_operation().unwrap();
    timer
        .prepare_timeout(Duration::from_secs(60), 1, 0)
        .unwrap();
    let nop = ring.acquire_operation().unwrap();
    nop.prepare_nop().unwrap();
    ring.submit().unwrap();

    let completions = ring.wait_completions(2, None).unwrap();
    assert!(completions[0].operation().ptr_eq(&nop));
    assert!(completions[1].operation().ptr_eq(&timer));
    assert_eq!(completions[1].result_code(), 0);
}

#[test]
fn clamp_flag_accepts_oversized_depth() {
    let mut ring = TestRing::new();
    assert!(ring.setup(u32::MAX, 0).is_err());
    ring.setup(u32::MAX, SETUP_CLAMP).unwrap();
    assert!(ring.submission_capacity_remaining() > 0);
}

#[test]
fn drop_tears_down_with_outstanding_completions() {
    let mut ring = ring();
    let op = ring.acquire_operation().unwrap();
    op.prepare_nop().unwrap();
    ring.submit().unwrap();
    let completion = ring.wait_one().unwrap();
    drop(ring);

    // The record still owns its descriptor.
    assert_eq!(completion.extract_result().unwrap(), Output::Empty);
    assert_eq!(op.state(), OperationState::Completed);
}
