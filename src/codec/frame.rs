//! Frame definitions for the VPN protocol
//!
//! Every byte that crosses a TeaVPN TCP connection belongs to exactly one
//! frame. A frame is a fixed header followed by one of four payload
//! variants selected by the kind tag.
//!
//! # Frame Header Format (11 bytes, little-endian)
//! ```text
//! +--------+-----------------+-----------------------------------------+
//! |  Kind  |  Length (2B LE) |          Sequence (8B LE)               |
//! +--------+-----------------+-----------------------------------------+
//! ```
//!
//! - Kind: frame kind tag (1 byte)
//! - Length: total on-wire byte count of the frame, header included
//! - Sequence: per-direction, per-connection monotone counter
//!
//! The sequence counter starts at 1 for the first frame each side sends
//! and advances by exactly 1 per frame per direction. During the
//! handshake the two directions interleave into the schedule
//! AUTH(1) / SIG(2) / SIG-ACK(3) / CONF(4); afterwards both counters
//! continue independently from [`HANDSHAKE_LAST_SEQ`].

use crate::codec::errors::FrameError;
use std::fmt::Display;

/// Frame header length in bytes: kind (1) + length (2) + sequence (8).
pub const HDR_LEN: usize = 11;

/// Size of the payload region shared by all frame kinds.
pub const PAYLOAD_CAPACITY: usize = 4096;

/// Largest frame that can ever appear on the wire.
pub const FRAME_CAPACITY: usize = HDR_LEN + PAYLOAD_CAPACITY;

/// Cap on the raw IP packet bytes carried by a DATA frame.
pub const DATA_CAPACITY: usize = 4000;

/// Cap on a single read from the TUN descriptor.
pub const TUN_READ_SIZE: usize = 3000;

/// Fixed capacity of each credential region, NUL terminator included.
pub const CRED_CAPACITY: usize = 256;

/// On-wire size of an AUTH payload: two length bytes plus both regions.
pub const AUTH_WIRE_LEN: usize = 2 + 2 * CRED_CAPACITY;

/// Capacity of the `inet4` CONF region: "xxx.xxx.xxx.xxx/xx" plus NUL.
pub const INET4_CAPACITY: usize = 19;

/// Capacity of a plain dotted-quad CONF region: "xxx.xxx.xxx.xxx" plus NUL.
pub const INET4_PLAIN_CAPACITY: usize = 16;

/// On-wire size of a CONF payload.
pub const CONF_WIRE_LEN: usize = INET4_CAPACITY + 2 * INET4_PLAIN_CAPACITY;

/// Sequence number carried by the client's AUTH frame.
pub const HANDSHAKE_AUTH_SEQ: u64 = 1;
/// Sequence number of the server's AUTH_OK / AUTH_REJECT signal.
pub const HANDSHAKE_SIG_SEQ: u64 = 2;
/// Sequence number of the client's ACK signal.
pub const HANDSHAKE_ACK_SEQ: u64 = 3;
/// Sequence number of the server's CONF frame.
pub const HANDSHAKE_CONF_SEQ: u64 = 4;
/// Value both per-direction counters hold once the handshake completes.
pub const HANDSHAKE_LAST_SEQ: u64 = 4;

/// Frame kind tags
///
/// - Auth: client credentials, first frame of every connection
/// - Data: one raw IP packet lifted off a TUN device
/// - Sig: control signal (see [`SigKind`])
/// - Conf: interface configuration pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Auth = 1,
    Data = 2,
    Sig = 3,
    Conf = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(FrameKind::Auth),
            0x02 => Ok(FrameKind::Data),
            0x03 => Ok(FrameKind::Sig),
            0x04 => Ok(FrameKind::Conf),
            _ => Err(FrameError::Malformed),
        }
    }
}

/// Signal tags carried by SIG frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SigKind {
    /// Credentials rejected, connection will be closed
    AuthReject = 1,
    /// Credentials accepted, CONF follows after the client's ACK
    AuthOk = 2,
    /// Unspecified server-side failure
    Unknown = 3,
    /// Connection dropped by the server
    Drop = 4,
    /// Client acknowledgment inside the handshake
    Ack = 5,
}

impl TryFrom<u8> for SigKind {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(SigKind::AuthReject),
            0x02 => Ok(SigKind::AuthOk),
            0x03 => Ok(SigKind::Unknown),
            0x04 => Ok(SigKind::Drop),
            0x05 => Ok(SigKind::Ack),
            _ => Err(FrameError::BadSignal),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub kind: FrameKind,
    /// Total on-wire length of the frame, header included. Authoritative:
    /// payload regions are never cleared between frames, so bytes past
    /// `len` are stale and must be ignored.
    pub len: u16,
    pub seq: u64,
}

/// Client credentials carried by an AUTH frame.
///
/// Both strings live in fixed 256-byte NUL-terminated regions on the
/// wire, so each is limited to 255 bytes and must not contain NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Interface configuration pushed by the server as the final handshake
/// frame. All three strings are ASCII dotted-quad forms, the first with a
/// "/prefix" suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceConf {
    pub inet4: String,
    pub inet4_broadcast: String,
    pub inet4_route: String,
}

/// Protocol frame enum
///
/// Owned view of a decoded frame. The relay hot path never builds these
/// for DATA traffic (it stays on raw pool cells); the handshake and the
/// client use them throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client credentials
    Auth(Credentials),
    /// Control signal
    Sig(SigKind),
    /// Interface configuration
    Conf(IfaceConf),
    /// One raw IP packet
    Data(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Auth(_) => FrameKind::Auth,
            Frame::Sig(_) => FrameKind::Sig,
            Frame::Conf(_) => FrameKind::Conf,
            Frame::Data(_) => FrameKind::Data,
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Auth(creds) => write!(f, "auth for user {}", creds.username),
            Frame::Sig(sig) => write!(f, "signal {:?}", sig),
            Frame::Conf(conf) => write!(f, "conf {} broadcast {}", conf.inet4, conf.inet4_broadcast),
            Frame::Data(payload) => write!(f, "data with payload size {}", payload.len()),
        }
    }
}
