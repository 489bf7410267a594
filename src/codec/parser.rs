//! Frame serializer and parser
//!
//! Turns [`Frame`] values into wire bytes and back, and exposes the raw
//! header helpers the relay uses on its hot path (where DATA frames are
//! stamped and forwarded without ever materializing a `Frame`).
//!
//! Encoding always zero-fills the fixed string regions before copying the
//! live bytes in, so no stale data leaks between frames. Decoding trusts
//! the declared length only after validating it against the header-size
//! and capacity bounds.

use crate::codec::errors::FrameError;
use crate::codec::frame::*;
use bytes::{Buf, BufMut};

/// Parses and validates a frame header from the front of `buf`.
pub fn read_info(buf: &[u8]) -> Result<FrameInfo, FrameError> {
    if buf.len() < HDR_LEN {
        return Err(FrameError::TooShort);
    }

    let mut b = &buf[..HDR_LEN];
    let kind = FrameKind::try_from(b.get_u8())?;
    let len = b.get_u16_le();
    let seq = b.get_u64_le();

    if (len as usize) < HDR_LEN || (len as usize) > FRAME_CAPACITY {
        return Err(FrameError::Malformed);
    }

    Ok(FrameInfo { kind, len, seq })
}

/// Writes a frame header into the front of `buf`.
pub fn write_info(buf: &mut [u8], info: &FrameInfo) {
    let mut b = &mut buf[..HDR_LEN];
    b.put_u8(info.kind as u8);
    b.put_u16_le(info.len);
    b.put_u64_le(info.seq);
}

/// Overwrites only the sequence field of an already-encoded frame.
///
/// Writer workers stamp the per-connection outbound counter immediately
/// before the send, after the fan-out producer has filled everything else.
pub fn patch_seq(buf: &mut [u8], seq: u64) {
    buf[3..HDR_LEN].copy_from_slice(&seq.to_le_bytes());
}

/// Encodes `frame` with sequence `seq` into `out`.
///
/// Returns the total on-wire length. `out` must be able to hold a maximum
/// frame; callers pass a [`FRAME_CAPACITY`] buffer.
pub fn encode_into(frame: &Frame, seq: u64, out: &mut [u8]) -> Result<usize, FrameError> {
    if out.len() < FRAME_CAPACITY {
        return Err(FrameError::Oversize);
    }

    let total = match frame {
        Frame::Auth(creds) => {
            let payload = &mut out[HDR_LEN..HDR_LEN + AUTH_WIRE_LEN];
            payload.fill(0);
            payload[0] = cred_len(&creds.username)?;
            payload[1] = cred_len(&creds.password)?;
            payload[2..2 + creds.username.len()].copy_from_slice(creds.username.as_bytes());
            let pw = &mut payload[2 + CRED_CAPACITY..];
            pw[..creds.password.len()].copy_from_slice(creds.password.as_bytes());
            HDR_LEN + AUTH_WIRE_LEN
        }

        Frame::Sig(sig) => {
            out[HDR_LEN] = *sig as u8;
            HDR_LEN + 1
        }

        Frame::Conf(conf) => {
            let payload = &mut out[HDR_LEN..HDR_LEN + CONF_WIRE_LEN];
            payload.fill(0);
            put_region(&mut payload[..INET4_CAPACITY], &conf.inet4)?;
            put_region(
                &mut payload[INET4_CAPACITY..INET4_CAPACITY + INET4_PLAIN_CAPACITY],
                &conf.inet4_broadcast,
            )?;
            put_region(
                &mut payload[INET4_CAPACITY + INET4_PLAIN_CAPACITY..],
                &conf.inet4_route,
            )?;
            HDR_LEN + CONF_WIRE_LEN
        }

        Frame::Data(payload) => {
            if payload.len() > DATA_CAPACITY {
                return Err(FrameError::Oversize);
            }
            out[HDR_LEN..HDR_LEN + payload.len()].copy_from_slice(payload);
            HDR_LEN + payload.len()
        }
    };

    write_info(
        out,
        &FrameInfo {
            kind: frame.kind(),
            len: total as u16,
            seq,
        },
    );

    Ok(total)
}

/// Decodes one frame from the front of `buf`.
///
/// `buf` must contain at least the declared length; the framed-stream
/// layer is responsible for reassembling that many bytes first.
pub fn decode(buf: &[u8]) -> Result<(FrameInfo, Frame), FrameError> {
    let info = read_info(buf)?;
    let total = info.len as usize;
    if buf.len() < total {
        return Err(FrameError::TooShort);
    }

    let payload = &buf[HDR_LEN..total];
    let frame = match info.kind {
        FrameKind::Auth => {
            if payload.len() != AUTH_WIRE_LEN {
                return Err(FrameError::Malformed);
            }
            let ulen = payload[0] as usize;
            let plen = payload[1] as usize;
            let username = take_str(&payload[2..2 + CRED_CAPACITY], ulen)?;
            let password = take_str(&payload[2 + CRED_CAPACITY..], plen)?;
            Frame::Auth(Credentials { username, password })
        }

        FrameKind::Sig => {
            if payload.is_empty() {
                return Err(FrameError::Malformed);
            }
            Frame::Sig(SigKind::try_from(payload[0])?)
        }

        FrameKind::Conf => {
            if payload.len() != CONF_WIRE_LEN {
                return Err(FrameError::Malformed);
            }
            Frame::Conf(IfaceConf {
                inet4: take_cstr(&payload[..INET4_CAPACITY])?,
                inet4_broadcast: take_cstr(
                    &payload[INET4_CAPACITY..INET4_CAPACITY + INET4_PLAIN_CAPACITY],
                )?,
                inet4_route: take_cstr(&payload[INET4_CAPACITY + INET4_PLAIN_CAPACITY..])?,
            })
        }

        FrameKind::Data => {
            if payload.len() > DATA_CAPACITY {
                return Err(FrameError::Malformed);
            }
            Frame::Data(payload.to_vec())
        }
    };

    Ok((info, frame))
}

fn cred_len(s: &str) -> Result<u8, FrameError> {
    if s.len() >= CRED_CAPACITY || s.as_bytes().contains(&0) {
        return Err(FrameError::Oversize);
    }
    Ok(s.len() as u8)
}

fn put_region(region: &mut [u8], s: &str) -> Result<(), FrameError> {
    if s.len() >= region.len() || s.as_bytes().contains(&0) {
        return Err(FrameError::Oversize);
    }
    region[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}

/// Extracts a string of declared length from a fixed region, requiring the
/// NUL terminator right behind it.
fn take_str(region: &[u8], len: usize) -> Result<String, FrameError> {
    if len >= CRED_CAPACITY || region[len] != 0 {
        return Err(FrameError::Malformed);
    }
    let bytes = &region[..len];
    if bytes.contains(&0) {
        return Err(FrameError::Malformed);
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::Malformed)
}

/// Extracts a NUL-terminated string from a fixed region.
fn take_cstr(region: &[u8]) -> Result<String, FrameError> {
    let end = region
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::Malformed)?;
    String::from_utf8(region[..end].to_vec()).map_err(|_| FrameError::Malformed)
}
