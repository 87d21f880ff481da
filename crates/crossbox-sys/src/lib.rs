//! Low-level Linux plumbing for the crossbox runtime.
//!
//! Thin wrappers around the security and IPC syscalls the rest of the
//! workspace needs but no safe wrapper covers:
//!
//! - **seccomp** - the two-stage seccomp-BPF policy of the guest process
//! - **scm** - fd passing over a unix socket with `SCM_RIGHTS`
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types are
//! unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod scm;
pub mod seccomp;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}

/// Mark every fd at or above `first` close-on-exec. Used by the host between
/// fork and exec so the guest inherits nothing but the fds it is handed.
pub fn mark_fds_cloexec(first: u32) {
    const CLOSE_RANGE_CLOEXEC: u32 = 1 << 2;
    // SAFETY: close_range touches no memory.
    unsafe {
        libc::syscall(libc::SYS_close_range, first, u32::MAX, CLOSE_RANGE_CLOEXEC);
    }
}
