//! Unix socket fd passing via `SCM_RIGHTS`.
//!
//! The host sends file descriptors to the guest over an `AF_UNIX` datagram
//! socketpair created before fork. Each transfer is a one-byte message with
//! the fd attached as ancillary data; the kernel allocates a fresh fd number
//! on the receiving side. The receive is always coordinated by a channel
//! request so the guest never blocks in `recvmsg` unexpectedly.
//!
//! Exactly one fd travels per message, so the ancillary buffer is a
//! fixed-size, header-aligned [`FdCmsg`] rather than a dynamically sized one.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Room for one `cmsghdr` plus one fd slot, padded to header alignment.
/// Matches `CMSG_SPACE(sizeof(int))`.
const SCM_SPACE: usize = size_of::<libc::cmsghdr>() + size_of::<u64>();

/// Ancillary buffer for a single-fd control message. The union overlays the
/// byte buffer with a `cmsghdr` so the kernel sees correctly aligned storage.
#[repr(C)]
union FdCmsg {
    _align: libc::cmsghdr,
    buf: [u8; SCM_SPACE],
}

impl FdCmsg {
    fn zeroed() -> Self {
        FdCmsg {
            buf: [0u8; SCM_SPACE],
        }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        // SAFETY: both union views cover the same bytes.
        unsafe { self.buf.as_mut_ptr().cast() }
    }
}

/// Create an `AF_UNIX SOCK_DGRAM` socketpair.
///
/// Returns `(host_sock, guest_sock)`. After fork, the host closes the guest
/// end and vice versa.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, both fds are fresh and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Send a file descriptor over a unix socket using `SCM_RIGHTS`.
///
/// The fd rides as ancillary data on a one-byte datagram.
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    if fd < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad fd"));
    }

    let payload = [0u8; 1];
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = FdCmsg::zeroed();

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr();
    msg.msg_controllen = SCM_SPACE;

    // SAFETY: msg_control points at header-aligned storage with room for
    // exactly one fd, so the first header is always present.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
        libc::CMSG_DATA(cmsg).cast::<RawFd>().write_unaligned(fd);
    }

    // A datagram carries the whole message or nothing; anything other than
    // the single payload byte means the fd did not travel with it.
    match unsafe { libc::sendmsg(socket, &msg, 0) } {
        1 => Ok(()),
        n if n < 0 => Err(io::Error::last_os_error()),
        _ => Err(io::Error::other("short SCM_RIGHTS datagram")),
    }
}

/// Receive a file descriptor from a unix socket using `SCM_RIGHTS`.
pub fn recv_fd(socket: RawFd) -> io::Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: 1,
    };
    let mut cmsg_buf = FdCmsg::zeroed();

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr();
    msg.msg_controllen = SCM_SPACE;

    if unsafe { libc::recvmsg(socket, &mut msg, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated control message",
        ));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no control message received",
        ));
    }

    // SAFETY: cmsg points into our buffer; level/type are checked before the
    // data is interpreted as an fd.
    unsafe {
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected control message type",
            ));
        }
        let fd = libc::CMSG_DATA(cmsg).cast::<RawFd>().read_unaligned();
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad fd in message"));
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};

    use super::*;

    #[test]
    fn cmsg_buffer_matches_kernel_sizing() {
        let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
        assert_eq!(SCM_SPACE, space);
        assert_eq!(std::mem::align_of::<FdCmsg>(), std::mem::align_of::<libc::cmsghdr>());
    }

    #[test]
    fn socketpair_creation() {
        let (a, b) = socketpair().unwrap();
        assert!(a.as_raw_fd() >= 0);
        assert!(b.as_raw_fd() >= 0);
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn send_rejects_bad_fd() {
        let (host, _guest) = socketpair().unwrap();
        let err = send_fd(host.as_raw_fd(), -1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn send_recv_round_trip() {
        let (host, guest) = socketpair().unwrap();

        let mut pipe_fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        let (pipe_read, pipe_write) = (pipe_fds[0], pipe_fds[1]);

        send_fd(host.as_raw_fd(), pipe_read).unwrap();
        let received = recv_fd(guest.as_raw_fd()).unwrap();

        // The received fd must alias the pipe: bytes written on the original
        // write end come out of it.
        let mut w = unsafe { std::fs::File::from_raw_fd(pipe_write) };
        w.write_all(b"ping").unwrap();
        drop(w);

        let mut r = unsafe { std::fs::File::from_raw_fd(received.into_raw_fd()) };
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");

        unsafe { libc::close(pipe_read) };
    }
}
