//! Acceptor and handshake engine
//!
//! One dedicated thread that waits for the event loop's "listener
//! readable" nudge, accepts the pending socket, and runs the four-step
//! stop-and-wait authentication exchange on it:
//!
//! | step | dir   | frame                      | seq |
//! |------|-------|----------------------------|-----|
//! | 1    | C → S | AUTH                       | 1   |
//! | 2    | S → C | SIG AUTH_OK / AUTH_REJECT  | 2   |
//! | 3    | C → S | SIG ACK                    | 3   |
//! | 4    | S → C | CONF                       | 4   |
//!
//! Any read failure, sequence mismatch, framing error or credential
//! failure closes the socket and leaves the slot free; there are no
//! retries inside the handshake. On full success the slot is installed
//! with both counters at 4 and one byte goes down the wake pipe so the
//! event loop rebuilds its readiness set.

use crate::codec::frame::{
    Frame, HANDSHAKE_ACK_SEQ, HANDSHAKE_AUTH_SEQ, HANDSHAKE_CONF_SEQ, HANDSHAKE_SIG_SEQ, SigKind,
};
use crate::network::{FramedStream, HANDSHAKE_TIMEOUT};
use crate::server::auth::{Lease, UserStore};
use crate::server::table::ConnectionTable;
use crossbeam_channel::Receiver;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct Acceptor {
    listener: TcpListener,
    table: Arc<ConnectionTable>,
    store: UserStore,
    nudge: Receiver<()>,
    wake: UnixStream,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        table: Arc<ConnectionTable>,
        store: UserStore,
        nudge: Receiver<()>,
        wake: UnixStream,
    ) -> Self {
        Self {
            listener,
            table,
            store,
            nudge,
            wake,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::debug!("accepting connections");
        while self.nudge.recv().is_ok() {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("accept: {e}");
                    continue;
                }
            };
            tracing::debug!("new connection from {peer}");
            self.admit(stream, peer);
        }
    }

    /// Runs one handshake to completion; on any failure the socket is
    /// dropped and the claimed slot (never installed) stays free.
    pub fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.try_admit(stream, peer) {
            tracing::info!("handshake with {peer} failed: {e}");
        }
    }

    fn try_admit(&mut self, stream: TcpStream, peer: SocketAddr) -> crate::Result<()> {
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let Some(idx) = self.table.claim() else {
            tracing::warn!("connection table full, dropping {peer}");
            return Ok(());
        };

        let mut framed = FramedStream::new(stream);
        let (username, lease) = self.handshake(&mut framed)?;

        let stream = framed.into_inner();
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        self.table
            .install(idx, Arc::new(stream), peer, lease.priv_ip);
        tracing::info!("{username} connected from {peer} [{}] (slot {idx})", lease.conf.inet4);

        // One byte down the wake pipe; the event loop picks the new
        // socket up on its next readiness rebuild.
        if let Err(e) = self.wake.write(&[1]) {
            tracing::error!("wake pipe: {e}");
        }
        Ok(())
    }

    fn handshake(&self, framed: &mut FramedStream) -> crate::Result<(String, Lease)> {
        // step 1: AUTH, seq must be exactly 1
        let (info, frame) = framed.read_frame()?;
        let Frame::Auth(creds) = frame else {
            return Err("expected auth frame".into());
        };
        if info.seq != HANDSHAKE_AUTH_SEQ {
            return Err(format!("auth sequence {} out of order", info.seq).into());
        }

        // step 2: AUTH_OK / AUTH_REJECT
        let Some(lease) = self.store.authenticate(&creds.username, &creds.password) else {
            framed.write_frame(&Frame::Sig(SigKind::AuthReject), HANDSHAKE_SIG_SEQ)?;
            return Err(format!("auth rejected for {}", creds.username).into());
        };
        framed.write_frame(&Frame::Sig(SigKind::AuthOk), HANDSHAKE_SIG_SEQ)?;

        // step 3: ACK, seq must be exactly 3
        let (info, frame) = framed.read_frame()?;
        match frame {
            Frame::Sig(SigKind::Ack) if info.seq == HANDSHAKE_ACK_SEQ => {}
            _ => return Err("expected ack signal".into()),
        }

        // step 4: CONF
        framed.write_frame(&Frame::Conf(lease.conf.clone()), HANDSHAKE_CONF_SEQ)?;

        Ok((creds.username, lease))
    }
}
