//! crossbox-guest: the sandbox side of the crossbox runtime.
//!
//! The host execs this crate's binary as `crossbox-guest <control_shm_fd>
//! <socket_fd>`. The process maps the control channel, installs the base
//! seccomp filter, and serves requests until it is killed: symbol lookup,
//! dynamic calls into whatever library is linked into the binary, fd
//! receives, worker spawning, and callback closure creation.
//!
//! To sandbox a specific library, link it into your own binary alongside
//! this crate and call [`run`] from `main` - symbols are resolved with
//! `dlsym(RTLD_DEFAULT, ..)`, so anything exported by the executable (or a
//! preloaded library) is callable from the host.
//!
//! Diagnostics go to stderr with best effort: once the filter is installed,
//! `write` is not in the allow-list and failures are deliberately ignored.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use rustix::io::Errno;
use thiserror::Error;

use crossbox_shm::{Channel, CHANNEL_SIZE};
use crossbox_sys::{last_errno, seccomp};

mod dispatch;

pub use dispatch::serve;

/// Setup failure before the dispatch loop; the process exits non-zero.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("mmap control channel: {0}")]
    Mmap(Errno),

    #[error("install seccomp filter: {0}")]
    Seccomp(Errno),
}

/// Fd-passing socket, shared by every worker's RecvFd handling.
static SOCK_FD: AtomicI32 = AtomicI32::new(-1);

/// Install the socket fd used for `SCM_RIGHTS` receives. [`run`] does this;
/// embedders driving [`serve`] directly may call it themselves.
pub fn install_socket(fd: RawFd) {
    SOCK_FD.store(fd, Ordering::Relaxed);
}

pub(crate) fn socket_fd() -> RawFd {
    SOCK_FD.load(Ordering::Relaxed)
}

/// Map the control channel, lock the process down, and serve until killed.
pub fn run(shm_fd: RawFd, sock_fd: RawFd) -> Result<(), SetupError> {
    install_socket(sock_fd);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            CHANNEL_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            shm_fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SetupError::Mmap(last_errno()));
    }
    unsafe { libc::close(shm_fd) };

    // The whole process runs under the base filter from here on; workers
    // stack their own filter on top.
    unsafe { seccomp::install(&seccomp::base_filter(), true) }.map_err(SetupError::Seccomp)?;

    // SAFETY: the region is CHANNEL_SIZE bytes of shared memory initialized
    // to zero by the host (state Idle).
    let channel: &Channel = unsafe { &*ptr.cast::<Channel>() };
    channel.publish_guest_addr(ptr as u64);

    // SAFETY: this is the guest side of the host's control channel.
    unsafe { serve(channel, true) };

    unsafe { libc::munmap(ptr, CHANNEL_SIZE) };
    Ok(())
}
