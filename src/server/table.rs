//! Connection table
//!
//! A bounded slot array holding per-client state. The acceptor claims a
//! free slot and installs the socket on handshake success; the event loop
//! and the writer workers release it on peer close or error-counter
//! overflow. Each slot sits behind its own lock covering the connected
//! flag, the socket, both sequence counters and the error counter, so
//! reset stays serialized against concurrent reads and writes and closes
//! the socket exactly once.

use crate::codec::frame::HANDSHAKE_LAST_SEQ;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum simultaneous clients.
pub const TABLE_SIZE: usize = 24;

/// Consecutive-error budget; one more increment resets the slot.
pub const MAX_ERRORS: u32 = 15;

#[derive(Default)]
pub struct SlotState {
    pub connected: bool,
    pub sock: Option<Arc<TcpStream>>,
    pub peer: Option<SocketAddr>,
    pub priv_ip: Option<Ipv4Addr>,
    /// Last client sequence accepted on this connection.
    pub recv_seq: u64,
    /// Last sequence emitted to this client.
    pub send_seq: u64,
    pub errors: u32,
}

impl SlotState {
    fn reset(&mut self) {
        if let Some(sock) = self.sock.take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        *self = SlotState::default();
    }
}

pub struct ConnectionTable {
    slots: Box<[Mutex<SlotState>]>,
}

impl ConnectionTable {
    pub fn new(size: usize) -> Arc<Self> {
        let slots = (0..size)
            .map(|_| Mutex::new(SlotState::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, idx: usize) -> MutexGuard<'_, SlotState> {
        self.slots[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// First free slot, or None when the table is full. Only the acceptor
    /// claims; a slot stays invisible to the relay until installed.
    pub fn claim(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&i| !self.slot(i).connected)
    }

    /// Marks a slot established after a successful handshake. Both
    /// per-direction counters start from the last handshake sequence.
    pub fn install(
        &self,
        idx: usize,
        sock: Arc<TcpStream>,
        peer: SocketAddr,
        priv_ip: Ipv4Addr,
    ) {
        let mut state = self.slot(idx);
        state.sock = Some(sock);
        state.peer = Some(peer);
        state.priv_ip = Some(priv_ip);
        state.recv_seq = HANDSHAKE_LAST_SEQ;
        state.send_seq = HANDSHAKE_LAST_SEQ;
        state.errors = 0;
        state.connected = true;
    }

    /// Returns the slot to FREE. Idempotent; the socket is shut down at
    /// most once, which also unblocks any worker mid-write on it.
    pub fn reset(&self, idx: usize) {
        self.slot(idx).reset();
    }

    /// Bumps the consecutive-error counter; past [`MAX_ERRORS`] the slot
    /// is reset. Returns true when the reset fired.
    pub fn note_error(&self, idx: usize) -> bool {
        let mut state = self.slot(idx);
        if !state.connected {
            return false;
        }
        state.errors += 1;
        if state.errors > MAX_ERRORS {
            tracing::warn!("slot {idx}: error budget exhausted, dropping client");
            state.reset();
            return true;
        }
        false
    }

    pub fn is_connected(&self, idx: usize) -> bool {
        self.slot(idx).connected
    }

    /// True while `sock` is still the slot's current occupant. Guards the
    /// event loop against acting on a slot that was reset and re-claimed
    /// between its readiness snapshot and the handling of that socket.
    pub fn holds(&self, idx: usize, sock: &Arc<TcpStream>) -> bool {
        match &self.slot(idx).sock {
            Some(current) => Arc::ptr_eq(current, sock),
            None => false,
        }
    }

    /// Snapshot of every established client for the poll set and fan-out.
    pub fn connected_sockets(&self) -> Vec<(usize, Arc<TcpStream>)> {
        let mut out = Vec::new();
        for i in 0..self.slots.len() {
            let state = self.slot(i);
            if state.connected
                && let Some(sock) = &state.sock
            {
                out.push((i, sock.clone()));
            }
        }
        out
    }

    /// Advances the expected client counter and returns the value this
    /// frame was required to carry. The counter moves regardless of
    /// whether the frame matched.
    pub fn advance_recv_seq(&self, idx: usize) -> u64 {
        let mut state = self.slot(idx);
        state.recv_seq += 1;
        state.recv_seq
    }

    /// Advances the outbound counter under the slot lock and hands back
    /// the sequence to stamp, plus the current socket. None when the slot
    /// is no longer established.
    pub fn next_send(&self, idx: usize) -> Option<(Arc<TcpStream>, u64)> {
        let mut state = self.slot(idx);
        if !state.connected {
            return None;
        }
        let sock = state.sock.as_ref()?.clone();
        state.send_seq += 1;
        Some((sock, state.send_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (Arc<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (Arc::new(server_side), client)
    }

    fn install_one(table: &ConnectionTable) -> (usize, Arc<TcpStream>, TcpStream) {
        let (sock, peer_side) = loopback_pair();
        let idx = table.claim().unwrap();
        let peer = sock.peer_addr().unwrap();
        table.install(idx, sock.clone(), peer, Ipv4Addr::new(10, 9, 0, 5));
        (idx, sock, peer_side)
    }

    #[test]
    fn claim_to_capacity_then_none() {
        let table = ConnectionTable::new(3);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(install_one(&table));
        }
        assert_eq!(table.claim(), None);

        table.reset(held[1].0);
        assert_eq!(table.claim(), Some(1));
    }

    #[test]
    fn install_initializes_counters() {
        let table = ConnectionTable::new(1);
        let (idx, sock, _peer) = install_one(&table);
        assert!(table.is_connected(idx));
        assert!(table.holds(idx, &sock));
        assert_eq!(table.advance_recv_seq(idx), HANDSHAKE_LAST_SEQ + 1);
        let (_, seq) = table.next_send(idx).unwrap();
        assert_eq!(seq, HANDSHAKE_LAST_SEQ + 1);
    }

    #[test]
    fn error_budget_resets_after_max_plus_one() {
        let table = ConnectionTable::new(1);
        let (idx, sock, _peer) = install_one(&table);

        for _ in 0..MAX_ERRORS {
            assert!(!table.note_error(idx));
            assert!(table.is_connected(idx));
        }
        assert!(table.note_error(idx));
        assert!(!table.is_connected(idx));
        assert!(!table.holds(idx, &sock));

        // further errors on the freed slot are ignored
        assert!(!table.note_error(idx));
    }

    #[test]
    fn reset_is_idempotent() {
        let table = ConnectionTable::new(1);
        let (idx, _sock, _peer) = install_one(&table);
        table.reset(idx);
        table.reset(idx);
        assert!(!table.is_connected(idx));
        assert_eq!(table.connected_sockets().len(), 0);
    }

    #[test]
    fn next_send_on_free_slot_is_none() {
        let table = ConnectionTable::new(1);
        assert!(table.next_send(0).is_none());
    }
}
