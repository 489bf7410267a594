//! Client session
//!
//! Connect, authenticate, configure the local TUN from the server's CONF
//! frame, then relay packets between the TUN and the server socket from
//! a single-threaded poll loop. The four handshake frames share one
//! interleaved counter (1 through 4); steady state continues with an
//! independent counter per direction, both starting past 4.

use crate::client::config::ClientConfig;
use crate::codec::frame::{
    Credentials, FRAME_CAPACITY, Frame, FrameInfo, FrameKind, HANDSHAKE_LAST_SEQ, HDR_LEN,
    IfaceConf, SigKind, TUN_READ_SIZE,
};
use crate::codec::parser;
use crate::network::{FramedStream, HANDSHAKE_TIMEOUT};
use crate::utils::poll::{pollfd, readable};
use crate::utils::{device, sys_route};
use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{PollTimeout, poll};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

pub fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from((config.server_ip, config.server_port));
    tracing::info!("connecting to {addr}");
    let stream = TcpStream::connect(addr).with_context(|| format!("cannot connect to {addr}"))?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut framed = FramedStream::new(stream);
    let conf = handshake(&mut framed, &config.username, &config.password)
        .map_err(|e| anyhow::anyhow!("handshake failed: {e}"))?;
    tracing::info!(
        "assigned {} broadcast {} route {}",
        conf.inet4,
        conf.inet4_broadcast,
        conf.inet4_route
    );

    let mut tun = device::create_tun(&config.dev)?;
    tracing::info!("created interface \"{}\"", config.dev);
    device::bring_up(&config.dev, config.mtu)?;
    device::assign_addr(&config.dev, &conf.inet4, &conf.inet4_broadcast)?;
    sys_route::install_vpn_routes(&config.server_ip.to_string(), &conf.inet4_route)?;

    let stream = framed.into_inner();
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;

    relay(&mut tun, &stream).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Client half of the four-step handshake. Returns the interface
/// configuration the server leased.
pub fn handshake(
    framed: &mut FramedStream,
    username: &str,
    password: &str,
) -> crate::Result<IfaceConf> {
    let mut seq = 0u64;

    seq += 1;
    framed.write_frame(
        &Frame::Auth(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }),
        seq,
    )?;
    tracing::debug!("[{seq}] sent auth");

    seq += 1;
    let (info, frame) = framed.read_frame()?;
    if info.seq != seq {
        return Err(format!(
            "invalid packet sequence (client_seq: {seq}, server_seq: {})",
            info.seq
        )
        .into());
    }
    match frame {
        Frame::Sig(SigKind::AuthOk) => tracing::info!("auth ok"),
        Frame::Sig(sig) => return Err(sig_error(sig).into()),
        _ => return Err("invalid server response".into()),
    }

    seq += 1;
    framed.write_frame(&Frame::Sig(SigKind::Ack), seq)?;
    tracing::debug!("[{seq}] sent ack");

    seq += 1;
    let (info, frame) = framed.read_frame()?;
    if info.seq != seq {
        return Err(format!(
            "invalid packet sequence (client_seq: {seq}, server_seq: {})",
            info.seq
        )
        .into());
    }
    let Frame::Conf(conf) = frame else {
        return Err("invalid packet".into());
    };

    Ok(conf)
}

fn sig_error(sig: SigKind) -> String {
    match sig {
        SigKind::AuthReject => "invalid username or password".to_string(),
        SigKind::Drop => "connection dropped".to_string(),
        SigKind::Unknown => "server reported an unknown failure".to_string(),
        other => format!("unexpected signal {other:?}"),
    }
}

/// Steady-state loop: TUN packets go out as DATA frames, DATA frames
/// from the server go onto the TUN. Peer close ends the session.
fn relay(tun: &mut tun::Device, stream: &TcpStream) -> crate::Result<()> {
    let mut buf = Box::new([0u8; FRAME_CAPACITY]);
    let mut send_seq = HANDSHAKE_LAST_SEQ;
    let mut recv_seq = HANDSHAKE_LAST_SEQ;

    loop {
        let mut fds = [pollfd(tun.as_raw_fd()), pollfd(stream.as_raw_fd())];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                tracing::debug!("poll got interrupt signal");
                continue;
            }
            Err(e) => {
                tracing::error!("poll: {e}");
                continue;
            }
        }
        let tun_ready = readable(&fds[0]);
        let net_ready = readable(&fds[1]);

        if tun_ready {
            match tun.read(&mut buf[HDR_LEN..HDR_LEN + TUN_READ_SIZE]) {
                Ok(0) => {}
                Ok(nread) => {
                    let total = HDR_LEN + nread;
                    send_seq += 1;
                    parser::write_info(
                        &mut buf[..],
                        &FrameInfo {
                            kind: FrameKind::Data,
                            len: total as u16,
                            seq: send_seq,
                        },
                    );
                    match (&*stream).write(&buf[..total]) {
                        Ok(0) => return Err("connection reset by peer".into()),
                        Ok(n) => tracing::trace!("[{send_seq}] sent {n} bytes"),
                        Err(e) => tracing::error!("server write: {e}"),
                    }
                }
                Err(e) => tracing::error!("tun read: {e}"),
            }
        }

        if net_ready {
            let info = read_server_frame(stream, &mut *buf)?;
            recv_seq += 1;
            if info.kind != FrameKind::Data {
                tracing::debug!("ignoring {:?} frame in steady state", info.kind);
                continue;
            }
            if info.seq != recv_seq {
                tracing::warn!(
                    "sequence mismatch (expected {recv_seq}, got {})",
                    info.seq
                );
            }
            match tun.write(&buf[HDR_LEN..info.len as usize]) {
                Ok(n) => tracing::trace!("[{recv_seq}] wrote {n} bytes to tun"),
                Err(e) => tracing::error!("tun write: {e}"),
            }
        }
    }
}

/// Reads one frame from the server into `buf`, header first, then
/// continuation reads until the declared length is assembled.
fn read_server_frame(stream: &TcpStream, buf: &mut [u8]) -> crate::Result<FrameInfo> {
    let mut have = 0usize;
    while have < HDR_LEN {
        have += read_some(stream, &mut buf[have..HDR_LEN])?;
    }

    let info = parser::read_info(&buf[..HDR_LEN])?;
    let total = info.len as usize;
    while have < total {
        have += read_some(stream, &mut buf[have..total])?;
    }

    Ok(info)
}

fn read_some(stream: &TcpStream, buf: &mut [u8]) -> crate::Result<usize> {
    loop {
        match (&*stream).read(buf) {
            Ok(0) => return Err("connection reset by peer".into()),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
