//! Relay core: event loop, fan-out queue and writer workers
//!
//! The main thread multiplexes the TUN descriptor, the listening socket,
//! the wake pipe and every established client socket through one
//! level-triggered poll call, rebuilding the readiness set each
//! iteration. Packets lifted off the TUN are stamped as DATA frames in a
//! pool cell and fanned out through a bounded queue; a fixed pool of
//! writer workers drains the queue and performs the blocking sends so the
//! event loop never stalls on a slow client. Packets arriving from
//! clients are reassembled to their declared length and written straight
//! to the TUN.
//!
//! Per destination, frames may be reordered across workers; the outbound
//! sequence number, taken under the slot lock at send time, is the
//! authoritative order indicator.

use crate::codec::frame::{FrameInfo, FrameKind, HDR_LEN, TUN_READ_SIZE};
use crate::codec::parser;
use crate::server::acceptor::Acceptor;
use crate::server::auth::UserStore;
use crate::server::config::ServerConfig;
use crate::server::pool::{AcquireBackoff, BufferPool, POOL_SIZE};
use crate::server::table::{ConnectionTable, TABLE_SIZE};
use crate::utils::device;
use crate::utils::poll::{pollfd, readable};
use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::poll::{PollTimeout, poll};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{IoSlice, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Capacity of the fan-out queue between the event loop and the workers.
pub const QUEUE_DEPTH: usize = 24;

/// Floor on the writer pool regardless of configuration.
pub const MIN_WORKERS: usize = 3;

/// One pending send: a destination slot and the pool cell holding the
/// frame. The job owns one reference count on the cell.
#[derive(Debug, Clone, Copy)]
pub struct QueueJob {
    pub conn: usize,
    pub cell: usize,
}

/// Brings up the TUN interface and the listener, starts the acceptor and
/// the writer pool, then parks the calling thread in the event loop.
pub fn run(config: ServerConfig) -> anyhow::Result<()> {
    let mut tun = device::create_tun(&config.dev)?;
    tracing::info!("created interface \"{}\"", config.dev);
    device::bring_up(&config.dev, config.mtu)?;
    device::assign_addr(
        &config.dev,
        &config.inet4.to_string(),
        &config.inet4_broadcast.to_string(),
    )?;

    let listener = bind_listener(config.bind_addr, config.bind_port)?;
    let (wake_rx, wake_tx) = UnixStream::pair().context("creating wake pipe")?;

    let pool = BufferPool::new(POOL_SIZE);
    let table = ConnectionTable::new(TABLE_SIZE);
    let (queue_tx, queue_rx) = crossbeam_channel::bounded::<QueueJob>(QUEUE_DEPTH);
    let (nudge_tx, nudge_rx) = crossbeam_channel::bounded::<()>(1);

    Acceptor::new(
        listener.try_clone().context("cloning listener")?,
        table.clone(),
        UserStore::new(&config.data_dir),
        nudge_rx,
        wake_tx,
    )
    .spawn()
    .context("spawning acceptor")?;

    let workers = (config.threads as usize).max(MIN_WORKERS);
    for i in 0..workers {
        spawn_worker(i, queue_rx.clone(), pool.clone(), table.clone())
            .context("spawning writer worker")?;
    }

    tracing::info!(
        "listening on {}:{} ({workers} writers)",
        config.bind_addr,
        config.bind_port
    );

    event_loop(&mut tun, &listener, wake_rx, &pool, &table, &queue_tx, &nudge_tx)
}

fn bind_listener(addr: Ipv4Addr, port: u16) -> anyhow::Result<TcpListener> {
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("creating TCP socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    let sockaddr = SocketAddr::from((addr, port));
    socket
        .bind(&sockaddr.into())
        .with_context(|| format!("binding {sockaddr}"))?;
    socket.listen(3).context("listening")?;
    Ok(socket.into())
}

fn event_loop(
    tun: &mut tun::Device,
    listener: &TcpListener,
    mut wake: UnixStream,
    pool: &Arc<BufferPool>,
    table: &Arc<ConnectionTable>,
    queue: &Sender<QueueJob>,
    nudge: &Sender<()>,
) -> anyhow::Result<()> {
    let mut backoff = AcquireBackoff::new();

    loop {
        let clients = table.connected_sockets();
        let cell = pool.acquire(&mut backoff);

        let mut fds = Vec::with_capacity(3 + clients.len());
        fds.push(pollfd(tun.as_raw_fd()));
        fds.push(pollfd(listener.as_raw_fd()));
        fds.push(pollfd(wake.as_raw_fd()));
        for (_, sock) in &clients {
            fds.push(pollfd(sock.as_raw_fd()));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                pool.release(cell);
                continue;
            }
            Err(e) => {
                pool.release(cell);
                tracing::error!("poll: {e}");
                continue;
            }
        }
        let ready: Vec<bool> = fds.iter().map(readable).collect();

        if ready[0] {
            tun_to_clients(tun, cell, pool, table, queue);
        } else {
            pool.release(cell);
        }

        // A full nudge channel means the acceptor already has one pending.
        if ready[1] {
            let _ = nudge.try_send(());
        }

        if ready[2] {
            let mut byte = [0u8; 1];
            let _ = wake.read(&mut byte);
        }

        for (k, (idx, sock)) in clients.iter().enumerate() {
            if ready[3 + k] {
                client_to_tun(tun, *idx, sock, pool, table, &mut backoff);
            }
        }
    }
}

/// Reads one packet off the TUN into `cell` and enqueues one send per
/// established client, all sharing the cell. The sequence field is left
/// for the workers to stamp per destination.
fn tun_to_clients(
    tun: &mut tun::Device,
    cell: usize,
    pool: &Arc<BufferPool>,
    table: &Arc<ConnectionTable>,
    queue: &Sender<QueueJob>,
) {
    let total = {
        // SAFETY: exclusive holder; the cell was acquired this iteration
        // and nothing has been published yet.
        let buf = unsafe { pool.cell_mut(cell) };
        let nread = match tun.read(&mut buf[HDR_LEN..HDR_LEN + TUN_READ_SIZE]) {
            Ok(0) => {
                pool.release(cell);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("tun read: {e}");
                pool.release(cell);
                return;
            }
        };
        let total = HDR_LEN + nread;
        parser::write_info(
            buf,
            &FrameInfo {
                kind: FrameKind::Data,
                len: total as u16,
                seq: 0,
            },
        );
        total
    };
    pool.set_len(cell, total);
    tracing::trace!("read {} bytes from tun", total - HDR_LEN);

    for (idx, _) in table.connected_sockets() {
        pool.retain(cell, 1);
        if queue.try_send(QueueJob { conn: idx, cell }).is_err() {
            tracing::warn!("fan-out queue full, dropping frame for slot {idx}");
            pool.release(cell);
        }
    }

    // the reader's own hold
    pool.release(cell);
}

enum ReadOutcome {
    Closed,
    Failed(std::io::Error),
    Malformed,
    NotData(FrameKind),
    Complete(FrameInfo),
}

/// Handles one readable client socket: reassemble a frame into a fresh
/// cell, verify the sequence, forward the payload to the TUN. Peer close
/// resets the slot immediately; errors feed the consecutive-error budget.
fn client_to_tun(
    tun: &mut tun::Device,
    idx: usize,
    sock: &Arc<TcpStream>,
    pool: &Arc<BufferPool>,
    table: &Arc<ConnectionTable>,
    backoff: &mut AcquireBackoff,
) {
    let cell = pool.acquire(backoff);
    let outcome = read_client_frame(sock, cell, pool);

    // The slot may have been reset and re-claimed since the readiness
    // snapshot; only act on it while this socket is still the occupant.
    if table.holds(idx, sock) {
        match outcome {
            ReadOutcome::Closed => {
                tracing::info!("slot {idx}: peer closed");
                table.reset(idx);
            }
            ReadOutcome::Failed(e) => {
                tracing::error!("slot {idx}: read: {e}");
                table.note_error(idx);
            }
            ReadOutcome::Malformed => {
                tracing::warn!("slot {idx}: malformed frame");
                table.note_error(idx);
            }
            ReadOutcome::NotData(kind) => {
                tracing::warn!("slot {idx}: unexpected {kind:?} frame in steady state");
                table.note_error(idx);
            }
            ReadOutcome::Complete(info) => {
                let expected = table.advance_recv_seq(idx);
                if info.seq != expected {
                    tracing::warn!(
                        "slot {idx}: sequence mismatch (expected {expected}, got {})",
                        info.seq
                    );
                }
                // SAFETY: still the exclusive holder, nothing published.
                let buf = unsafe { pool.cell(cell) };
                match tun.write(&buf[HDR_LEN..info.len as usize]) {
                    Ok(n) => tracing::trace!("slot {idx}: wrote {n} bytes to tun"),
                    Err(e) => tracing::error!("tun write: {e}"),
                }
            }
        }
    }

    pool.release(cell);
}

/// Reads exactly one frame from `sock` into `cell`: the fixed header
/// first, then continuation reads until the declared length is assembled.
fn read_client_frame(sock: &Arc<TcpStream>, cell: usize, pool: &Arc<BufferPool>) -> ReadOutcome {
    // SAFETY: exclusive holder of a freshly acquired cell.
    let buf = unsafe { pool.cell_mut(cell) };

    let mut have = 0usize;
    while have < HDR_LEN {
        match read_some(sock, &mut buf[have..HDR_LEN]) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => have += n,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }

    let info = match parser::read_info(&buf[..HDR_LEN]) {
        Ok(info) => info,
        Err(_) => return ReadOutcome::Malformed,
    };
    if info.kind != FrameKind::Data {
        return ReadOutcome::NotData(info.kind);
    }

    let total = info.len as usize;
    while have < total {
        match read_some(sock, &mut buf[have..total]) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => have += n,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }

    ReadOutcome::Complete(info)
}

fn read_some(sock: &Arc<TcpStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match (&**sock).read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn spawn_worker(
    i: usize,
    jobs: Receiver<QueueJob>,
    pool: Arc<BufferPool>,
    table: Arc<ConnectionTable>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("writer-{i}"))
        .spawn(move || {
            while let Ok(job) = jobs.recv() {
                deliver(&job, &pool, &table);
            }
        })
}

/// Sends one queued frame to its destination and gives the cell's count
/// back. The outbound sequence is taken under the slot lock; the blocking
/// write happens outside it, so a reset (which shuts the socket down) can
/// always unblock a stuck worker.
pub(crate) fn deliver(job: &QueueJob, pool: &BufferPool, table: &ConnectionTable) {
    let Some((sock, seq)) = table.next_send(job.conn) else {
        pool.release(job.cell);
        return;
    };

    let total = pool.len(job.cell);
    // SAFETY: this job holds one refcount; the producer finished filling
    // the cell before publishing it.
    let bytes = unsafe { pool.cell(job.cell) };

    // The cell is shared across all fan-out targets, so the stamped header
    // lives on the stack and goes out with the shared payload in a single
    // vectored write.
    let mut hdr = [0u8; HDR_LEN];
    hdr.copy_from_slice(&bytes[..HDR_LEN]);
    parser::patch_seq(&mut hdr, seq);

    let iov = [IoSlice::new(&hdr), IoSlice::new(&bytes[HDR_LEN..total])];
    match (&*sock).write_vectored(&iov) {
        Ok(0) => {
            tracing::info!("slot {}: peer closed", job.conn);
            table.reset(job.conn);
        }
        Ok(n) => tracing::trace!("slot {}: sent {n} bytes (seq {seq})", job.conn),
        Err(e) => {
            tracing::error!("slot {}: write: {e}", job.conn);
            table.note_error(job.conn);
        }
    }

    pool.release(job.cell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::HANDSHAKE_LAST_SEQ;

    fn loopback_pair() -> (Arc<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (Arc::new(server_side), client)
    }

    fn stage_data_frame(pool: &BufferPool, payload: &[u8]) -> usize {
        let cell = pool.try_acquire().unwrap();
        let total = HDR_LEN + payload.len();
        {
            // exclusive holder until retained below
            let buf = unsafe { pool.cell_mut(cell) };
            buf[HDR_LEN..total].copy_from_slice(payload);
            parser::write_info(
                buf,
                &FrameInfo {
                    kind: FrameKind::Data,
                    len: total as u16,
                    seq: 0,
                },
            );
        }
        pool.set_len(cell, total);
        cell
    }

    #[test]
    fn fan_out_stamps_per_connection_sequences() {
        let pool = BufferPool::new(POOL_SIZE);
        let table = ConnectionTable::new(2);

        let (sock_a, mut peer_a) = loopback_pair();
        let (sock_b, mut peer_b) = loopback_pair();
        let addr_a = sock_a.peer_addr().unwrap();
        let addr_b = sock_b.peer_addr().unwrap();
        table.install(0, sock_a, addr_a, Ipv4Addr::new(10, 9, 0, 5));
        table.install(1, sock_b, addr_b, Ipv4Addr::new(10, 9, 0, 6));

        let payload = vec![0x45u8; 100];
        let cell = stage_data_frame(&pool, &payload);
        pool.retain(cell, 2);
        pool.release(cell);
        assert_eq!(pool.refs(cell), 2);

        deliver(&QueueJob { conn: 0, cell }, &pool, &table);
        deliver(&QueueJob { conn: 1, cell }, &pool, &table);
        assert_eq!(pool.refs(cell), 0);

        for peer in [&mut peer_a, &mut peer_b] {
            let mut wire = vec![0u8; HDR_LEN + payload.len()];
            peer.read_exact(&mut wire).unwrap();
            let (info, frame) = parser::decode(&wire).unwrap();
            assert_eq!(info.seq, HANDSHAKE_LAST_SEQ + 1);
            assert_eq!(frame, crate::codec::frame::Frame::Data(payload.clone()));
        }
    }

    #[test]
    fn consecutive_sends_advance_the_outbound_counter() {
        let pool = BufferPool::new(POOL_SIZE);
        let table = ConnectionTable::new(1);
        let (sock, mut peer) = loopback_pair();
        let addr = sock.peer_addr().unwrap();
        table.install(0, sock, addr, Ipv4Addr::new(10, 9, 0, 5));

        for k in 1..=3u64 {
            let cell = stage_data_frame(&pool, &[k as u8; 32]);
            deliver(&QueueJob { conn: 0, cell }, &pool, &table);

            let mut wire = vec![0u8; HDR_LEN + 32];
            peer.read_exact(&mut wire).unwrap();
            let (info, _) = parser::decode(&wire).unwrap();
            assert_eq!(info.seq, HANDSHAKE_LAST_SEQ + k);
        }
    }

    #[test]
    fn delivery_to_a_freed_slot_only_drops_the_cell() {
        let pool = BufferPool::new(POOL_SIZE);
        let table = ConnectionTable::new(1);

        let cell = stage_data_frame(&pool, &[0u8; 16]);
        deliver(&QueueJob { conn: 0, cell }, &pool, &table);
        assert_eq!(pool.refs(cell), 0);
    }
}
