//! Integration tests for the acceptor's handshake engine
//!
//! Drives the real acceptor thread against loopback sockets and a
//! temporary user store, using the client's own handshake routine for
//! the well-behaved side. Covers:
//! 1. Happy path: authentication, CONF lease, slot installation, wake byte
//! 2. Bad password: AUTH_REJECT and socket close, slot stays free
//! 3. Sequence skew: drop with no reply frame
//! 4. Connection-table full: accepted at the kernel, closed immediately,
//!    established slots undisturbed

use crossbeam_channel::{Sender, bounded};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use teavpn::client::client::handshake;
use teavpn::codec::frame::{Credentials, Frame};
use teavpn::network::FramedStream;
use teavpn::server::acceptor::Acceptor;
use teavpn::server::auth::UserStore;
use teavpn::server::table::ConnectionTable;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    table: Arc<ConnectionTable>,
    nudge: Sender<()>,
    wake_rx: UnixStream,
    _store_dir: tempfile::TempDir,
}

fn start_server(capacity: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let alice = dir.path().join("users").join("alice");
    std::fs::create_dir_all(&alice).unwrap();
    std::fs::write(alice.join("password"), "s3cretpass\n").unwrap();
    std::fs::write(alice.join("ip"), "10.9.0.5/24 10.9.0.255\n").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let table = ConnectionTable::new(capacity);
    let (nudge_tx, nudge_rx) = bounded(1);
    let (wake_rx, wake_tx) = UnixStream::pair().unwrap();
    wake_rx.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();

    Acceptor::new(
        listener,
        table.clone(),
        UserStore::new(dir.path()),
        nudge_rx,
        wake_tx,
    )
    .spawn()
    .unwrap();

    Harness {
        addr,
        table,
        nudge: nudge_tx,
        wake_rx,
        _store_dir: dir,
    }
}

/// Connects and nudges the acceptor, the way the event loop does when the
/// listener polls readable.
fn connect(h: &Harness) -> FramedStream {
    let stream = TcpStream::connect(h.addr).unwrap();
    stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
    h.nudge.send(()).unwrap();
    FramedStream::new(stream)
}

fn expect_wake_byte(h: &mut Harness) {
    let mut byte = [0u8; 1];
    h.wake_rx.read_exact(&mut byte).unwrap();
}

#[test]
fn happy_path_leases_address_and_installs_slot() {
    let mut h = start_server(24);
    let mut framed = connect(&h);

    let conf = handshake(&mut framed, "alice", "s3cretpass").unwrap();
    assert_eq!(conf.inet4, "10.9.0.5/24");
    assert_eq!(conf.inet4_broadcast, "10.9.0.255");
    assert_eq!(conf.inet4_route, "10.9.0.255");

    expect_wake_byte(&mut h);
    assert_eq!(h.table.connected_sockets().len(), 1);
}

#[test]
fn bad_password_is_rejected_and_slot_stays_free() {
    let h = start_server(24);
    let mut framed = connect(&h);

    let err = handshake(&mut framed, "alice", "wrong").unwrap_err();
    assert!(
        err.to_string().contains("invalid username or password"),
        "unexpected error: {err}"
    );
    assert_eq!(h.table.connected_sockets().len(), 0);
}

#[test]
fn unknown_user_is_rejected() {
    let h = start_server(24);
    let mut framed = connect(&h);

    assert!(handshake(&mut framed, "mallory", "s3cretpass").is_err());
    assert_eq!(h.table.connected_sockets().len(), 0);
}

#[test]
fn sequence_skew_drops_without_reply() {
    let h = start_server(24);
    let mut framed = connect(&h);

    framed
        .write_frame(
            &Frame::Auth(Credentials {
                username: "alice".to_string(),
                password: "s3cretpass".to_string(),
            }),
            7,
        )
        .unwrap();

    // no reply frame; the connection just closes
    assert!(framed.read_frame().is_err());
    assert_eq!(h.table.connected_sockets().len(), 0);
}

#[test]
fn silent_client_is_dropped_after_the_handshake_timeout() {
    let h = start_server(24);

    let stream = TcpStream::connect(h.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
    h.nudge.send(()).unwrap();

    // never send AUTH; the 10 s handshake read timeout closes the socket
    let mut byte = [0u8; 1];
    assert_eq!((&stream).read(&mut byte).unwrap(), 0);
    assert_eq!(h.table.connected_sockets().len(), 0);
}

#[test]
fn full_table_closes_the_next_connection_without_disturbing_slots() {
    let mut h = start_server(2);

    let mut first = connect(&h);
    handshake(&mut first, "alice", "s3cretpass").unwrap();
    expect_wake_byte(&mut h);

    let mut second = connect(&h);
    handshake(&mut second, "alice", "s3cretpass").unwrap();
    expect_wake_byte(&mut h);

    let established: Vec<usize> = h
        .table
        .connected_sockets()
        .into_iter()
        .map(|(idx, _)| idx)
        .collect();
    assert_eq!(established, vec![0, 1]);

    // attempt #3 is accepted at the kernel but closed by the acceptor
    let mut third = connect(&h);
    assert!(handshake(&mut third, "alice", "s3cretpass").is_err());

    let after: Vec<usize> = h
        .table
        .connected_sockets()
        .into_iter()
        .map(|(idx, _)| idx)
        .collect();
    assert_eq!(after, vec![0, 1]);
}
