//! Framed I/O over a TCP stream
//!
//! [`FramedStream`] speaks the wire contract directly: every frame goes
//! out as a single `write` call, and reads respect frame boundaries by
//! first assembling the fixed header, then issuing continuation reads
//! until the declared length is complete. Used by the handshake engine on
//! both sides and by the client's relay loop; the server relay reads raw
//! bytes into pool cells through the same boundary discipline instead.

use crate::codec::frame::{FRAME_CAPACITY, Frame, FrameInfo, HDR_LEN};
use crate::codec::parser;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Read and write timeout both sides apply to a socket for the duration
/// of the handshake, relaxed once the connection is established.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FramedStream {
    stream: TcpStream,
    buf: Box<[u8; FRAME_CAPACITY]>,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Box::new([0u8; FRAME_CAPACITY]),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Encodes and sends one frame as a single write call.
    pub fn write_frame(&mut self, frame: &Frame, seq: u64) -> crate::Result<()> {
        let n = parser::encode_into(frame, seq, &mut *self.buf)?;
        let written = self.stream.write(&self.buf[..n])?;
        if written == 0 {
            return Err("connection reset by peer".into());
        }
        if written != n {
            return Err("short frame write".into());
        }
        Ok(())
    }

    /// Reads exactly one frame, reassembling across short reads.
    ///
    /// Never consumes bytes past the declared length, so back-to-back
    /// frames in the kernel buffer keep their boundaries.
    pub fn read_frame(&mut self) -> crate::Result<(FrameInfo, Frame)> {
        let mut have = 0usize;
        while have < HDR_LEN {
            have += self.read_some(have, HDR_LEN)?;
        }

        let info = parser::read_info(&self.buf[..have])?;
        let total = info.len as usize;
        while have < total {
            have += self.read_some(have, total)?;
        }

        let (info, frame) = parser::decode(&self.buf[..total])?;
        Ok((info, frame))
    }

    fn read_some(&mut self, have: usize, upto: usize) -> crate::Result<usize> {
        let n = self.stream.read(&mut self.buf[have..upto])?;
        if n == 0 {
            return Err("connection reset by peer".into());
        }
        Ok(n)
    }
}
