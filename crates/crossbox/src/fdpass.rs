//! File descriptor transfer and translation.
//!
//! Host fds are sent to the guest with `SCM_RIGHTS`; the kernel allocates a
//! fresh fd number on the guest side, so the runtime keeps a host-fd to
//! guest-fd translation table. Re-sending an already-sent fd returns the
//! cached guest fd, which lets callers mix pointers and fds freely.
//!
//! The table is a dense direct-indexed array for low fd numbers plus a
//! sparse overflow list, matching how fd numbers are actually distributed.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crossbox_shm::{Channel, ChannelState, RequestKind, TypeTag};
use crossbox_sys::scm;

use crate::call::{Arg, Value};
use crate::channels;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxInner};

const FD_DIRECT_MAX: usize = 128;

/// Host-fd -> guest-fd mapping.
pub(crate) struct FdTable {
    direct: [RawFd; FD_DIRECT_MAX],
    overflow: Vec<(RawFd, RawFd)>,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            direct: [-1; FD_DIRECT_MAX],
            overflow: Vec::new(),
        }
    }

    pub(crate) fn lookup(&self, host_fd: RawFd) -> Option<RawFd> {
        if let Ok(i) = usize::try_from(host_fd) {
            if i < FD_DIRECT_MAX {
                return (self.direct[i] >= 0).then_some(self.direct[i]);
            }
        }
        self.overflow
            .iter()
            .find(|(host, _)| *host == host_fd)
            .map(|(_, guest)| *guest)
    }

    pub(crate) fn insert(&mut self, host_fd: RawFd, guest_fd: RawFd) {
        if let Ok(i) = usize::try_from(host_fd) {
            if i < FD_DIRECT_MAX {
                self.direct[i] = guest_fd;
                return;
            }
        }
        self.overflow.push((host_fd, guest_fd));
    }

    /// Invalidate whichever entry maps to `guest_fd`.
    pub(crate) fn remove_guest(&mut self, guest_fd: RawFd) {
        for slot in self.direct.iter_mut() {
            if *slot == guest_fd {
                *slot = -1;
                return;
            }
        }
        self.overflow.retain(|(_, guest)| *guest != guest_fd);
    }
}

/// Send one fd over the socket and coordinate the guest-side receive on the
/// given channel. Uncached; callers that want idempotence go through
/// [`Sandbox::send_fd`].
pub(crate) fn transfer_fd(inner: &SandboxInner, ch: &Channel, fd: RawFd) -> Result<RawFd> {
    // Hold the socket for the whole exchange so concurrent transfers cannot
    // cross-pair messages with receives.
    let sock = inner.sock.lock().unwrap();
    scm::send_fd(sock.as_raw_fd(), fd).map_err(Error::FdPass)?;

    {
        // SAFETY: channel is Idle, this side owns the payload.
        let p = unsafe { &mut *ch.payload_ptr() };
        p.request = RequestKind::RecvFd as u32;
        p.received_fd = -1;
    }
    crate::call::begin_request(ch)?;
    ch.wait_for(ChannelState::Response)
        .map_err(|_| Error::SandboxDead)?;
    let guest_fd = unsafe { (*ch.payload_ptr()).received_fd };
    crate::call::finish_response(ch);

    if guest_fd < 0 {
        return Err(Error::FdPass(io::Error::other(
            "guest failed to receive the fd",
        )));
    }
    Ok(guest_fd)
}

impl Sandbox {
    /// Send a host fd to the guest, returning the guest's fd number.
    ///
    /// Idempotent: sending the same host fd again returns the same guest fd.
    pub fn send_fd(&self, fd: RawFd) -> Result<RawFd> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }
        // The table lock is held across the transfer so two threads sending
        // the same fd cannot both miss the cache.
        let mut table = self.inner.fds.lock().unwrap();
        if let Some(guest_fd) = table.lookup(fd) {
            return Ok(guest_fd);
        }
        let tch = channels::thread_channel(&self.inner)?;
        let guest_fd = transfer_fd(&self.inner, tch.channel(), fd)?;
        table.insert(fd, guest_fd);
        Ok(guest_fd)
    }

    /// Close a guest fd (as returned by [`Sandbox::send_fd`]) and drop its
    /// translation entry.
    pub fn close_fd(&self, guest_fd: RawFd) -> Result<()> {
        if guest_fd < 0 {
            return Err(Error::InvalidFd(guest_fd));
        }
        let close = self.require_sym(self.syms().close, "close")?;
        match self.call(close, TypeTag::I32, &[Arg::I32(guest_fd)])? {
            Value::I32(0) => {
                self.inner.fds.lock().unwrap().remove_guest(guest_fd);
                Ok(())
            }
            _ => Err(Error::GuestClose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_overflow_lookup() {
        let mut table = FdTable::new();
        assert_eq!(table.lookup(5), None);

        table.insert(5, 11);
        table.insert(4000, 12);
        assert_eq!(table.lookup(5), Some(11));
        assert_eq!(table.lookup(4000), Some(12));
        assert_eq!(table.lookup(6), None);
        assert_eq!(table.lookup(4001), None);
    }

    #[test]
    fn remove_by_guest_fd() {
        let mut table = FdTable::new();
        table.insert(5, 11);
        table.insert(4000, 12);

        table.remove_guest(11);
        assert_eq!(table.lookup(5), None);
        assert_eq!(table.lookup(4000), Some(12));

        table.remove_guest(12);
        assert_eq!(table.lookup(4000), None);
    }

    #[test]
    fn reinsert_after_remove() {
        let mut table = FdTable::new();
        table.insert(7, 20);
        table.remove_guest(20);
        table.insert(7, 21);
        assert_eq!(table.lookup(7), Some(21));
    }
}
