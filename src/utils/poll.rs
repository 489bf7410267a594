//! Helpers around the level-triggered readiness call shared by the
//! server relay and the client loop.

use nix::poll::{PollFd, PollFlags};
use std::os::fd::{BorrowedFd, RawFd};

/// Read-interest entry for one descriptor.
///
/// Every fd handed here is owned by the calling loop or by the snapshot
/// taken for the current iteration and stays open until the poll call
/// returns.
pub fn pollfd(fd: RawFd) -> PollFd<'static> {
    PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)
}

/// Readable, or in a state (error, hangup) the next read will surface.
pub fn readable(fd: &PollFd) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP))
}
