//! Per-thread channel management.
//!
//! Each host thread that calls into a sandbox owns a dedicated channel paired
//! with one guest worker thread. Channels are created lazily on first use:
//! the host allocates a fresh memfd-backed region, hands the fd to the guest
//! over the control channel, and asks the control thread to spawn a worker
//! for it. The worker publishes its own view of the channel address when its
//! dispatch loop is ready.
//!
//! Teardown is driven by thread exit: dropping the thread-local entry tells
//! the worker to exit (freeing its closures) and releases the host-side
//! mapping. The sandbox keeps only weak registry references, used by the
//! death watcher to poison every live channel when the guest dies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crossbox_shm::{Channel, ChannelState, RequestKind, CHANNEL_SIZE};
use crossbox_sys::last_errno;

use crate::error::{Error, Result};
use crate::fdpass::transfer_fd;
use crate::sandbox::SandboxInner;

/// Size of the lazily created per-thread identity arena.
pub(crate) const ARENA_SIZE: usize = 1 << 20;

/// A memfd-backed channel region mapped into the host.
pub(crate) struct ChannelMapping {
    ptr: NonNull<Channel>,
    memfd: OwnedFd,
}

// The mapping is plain shared memory; all cross-thread access goes through
// the channel's atomic state word.
unsafe impl Send for ChannelMapping {}
unsafe impl Sync for ChannelMapping {}

impl ChannelMapping {
    /// Allocate and map a fresh zeroed channel region (state `Idle`).
    pub(crate) fn create(name: &CStr) -> Result<Self> {
        let memfd = create_memfd(name, CHANNEL_SIZE)?;
        let ptr = map_shared(&memfd, CHANNEL_SIZE)?;
        Ok(Self {
            ptr: ptr.cast(),
            memfd,
        })
    }

    pub(crate) fn channel(&self) -> &Channel {
        // SAFETY: the mapping is valid for the lifetime of self.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn memfd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }
}

impl Drop for ChannelMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping what Self::create mapped.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), CHANNEL_SIZE) };
    }
}

pub(crate) fn create_memfd(name: &CStr, len: usize) -> Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Memfd(last_errno()));
    }
    // SAFETY: fresh fd owned by us.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
        return Err(Error::Memfd(last_errno()));
    }
    Ok(fd)
}

fn map_shared(fd: &OwnedFd, len: usize) -> Result<NonNull<libc::c_void>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Mmap(last_errno()));
    }
    NonNull::new(ptr).ok_or(Error::Mmap(last_errno()))
}

/// Per-thread bump arena over identity-mapped memory.
pub(crate) struct Arena {
    pub(crate) base: NonNull<u8>,
    pub(crate) size: usize,
    pub(crate) offset: usize,
}

impl Arena {
    const ALIGN: usize = 16;

    pub(crate) fn bump(&mut self, size: usize) -> Result<*mut u8> {
        let size = (size + Self::ALIGN - 1) & !(Self::ALIGN - 1);
        if self.offset + size > self.size {
            return Err(Error::ArenaExhausted);
        }
        // SAFETY: offset + size is within the mapped region.
        let ptr = unsafe { self.base.as_ptr().add(self.offset) };
        self.offset += size;
        Ok(ptr)
    }
}

/// A channel owned by one host thread. Not `Send`: it lives in thread-local
/// storage and dies with its thread.
pub(crate) struct ThreadChannel {
    mapping: Arc<ChannelMapping>,
    sandbox: Weak<SandboxInner>,
    pub(crate) arena: RefCell<Option<Arena>>,
}

impl ThreadChannel {
    pub(crate) fn channel(&self) -> &Channel {
        self.mapping.channel()
    }
}

impl Drop for ThreadChannel {
    fn drop(&mut self) {
        // The worker's dispatch loop exits, freeing its closures. On a
        // poisoned channel there is no worker left to tell.
        let ch = self.mapping.channel();
        let _ = ch.transition(ChannelState::Idle, ChannelState::Exit);

        // Host side of the identity arena only. The worker was just told to
        // exit, so no further requests can go out on this channel; the
        // guest's mappings go away with the guest process.
        if let Some(arena) = self.arena.borrow_mut().take() {
            unsafe { libc::munmap(arena.base.as_ptr().cast(), arena.size) };
        }

        if let Some(inner) = self.sandbox.upgrade() {
            let me = Arc::downgrade(&self.mapping);
            inner.registry.lock().unwrap().retain(|w| !w.ptr_eq(&me));
        }
    }
}

thread_local! {
    /// Sandbox instance id -> this thread's channel for it.
    static CHANNELS: RefCell<HashMap<u64, Rc<ThreadChannel>>> = RefCell::new(HashMap::new());
}

/// Get or create the calling thread's channel for this sandbox.
pub(crate) fn thread_channel(inner: &Arc<SandboxInner>) -> Result<Rc<ThreadChannel>> {
    let cached = CHANNELS.with(|m| m.borrow().get(&inner.id).cloned());
    if let Some(tch) = cached {
        return Ok(tch);
    }
    let tch = Rc::new(create_thread_channel(inner)?);
    CHANNELS.with(|m| m.borrow_mut().insert(inner.id, Rc::clone(&tch)));
    Ok(tch)
}

/// The calling thread's channel, if one already exists. Never creates.
pub(crate) fn peek_thread_channel(inner: &SandboxInner) -> Option<Rc<ThreadChannel>> {
    CHANNELS.with(|m| m.borrow().get(&inner.id).cloned())
}

fn create_thread_channel(inner: &Arc<SandboxInner>) -> Result<ThreadChannel> {
    let mapping = Arc::new(ChannelMapping::create(c"crossbox-worker")?);

    // Register before the handshake so the death watcher can poison the
    // channel if the guest dies mid-bootstrap.
    inner.registry.lock().unwrap().push(Arc::downgrade(&mapping));

    if let Err(e) = bootstrap_worker(inner, &mapping) {
        let me = Arc::downgrade(&mapping);
        inner.registry.lock().unwrap().retain(|w| !w.ptr_eq(&me));
        return Err(e);
    }

    tracing::debug!(pid = inner.pid, "worker channel ready");
    Ok(ThreadChannel {
        mapping,
        sandbox: Arc::downgrade(inner),
        arena: RefCell::new(None),
    })
}

fn bootstrap_worker(inner: &SandboxInner, mapping: &ChannelMapping) -> Result<()> {
    // The control channel serializes worker spawning.
    let _control = inner.control_lock.lock().unwrap();
    let ctrl = inner.control.channel();

    // Not cached in the fd table: the worker owns this fd and closes it
    // after mapping.
    let guest_fd = transfer_fd(inner, ctrl, mapping.memfd().as_raw_fd())?;

    {
        // SAFETY: control channel is Idle and we hold the control lock.
        let p = unsafe { &mut *ctrl.payload_ptr() };
        p.request = RequestKind::SpawnWorker as u32;
        p.worker_shm_fd = guest_fd;
    }
    crate::call::begin_request(ctrl)?;
    ctrl.wait_for(ChannelState::Response)
        .map_err(|_| Error::SandboxDead)?;
    crate::call::finish_response(ctrl);

    // The worker publishes its channel address once its dispatch loop is
    // ready (after mapping the region and installing its seccomp filter).
    let ch = mapping.channel();
    while ch.guest_addr() == 0 {
        if ch.load_state() == ChannelState::Dead as u32
            || ctrl.load_state() == ChannelState::Dead as u32
        {
            return Err(Error::SandboxDead);
        }
        std::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_mapping_is_idle() {
        let m = ChannelMapping::create(c"crossbox-test").unwrap();
        assert_eq!(m.channel().load_state(), ChannelState::Idle as u32);
        assert_eq!(m.channel().guest_addr(), 0);
    }

    #[test]
    fn mapping_is_shared_with_the_fd() {
        // A second mapping of the same memfd must observe state transitions,
        // the way the guest's mapping does.
        let m = ChannelMapping::create(c"crossbox-test").unwrap();
        let dup = unsafe { OwnedFd::from_raw_fd(libc::dup(m.memfd.as_raw_fd())) };
        let other = map_shared(&dup, CHANNEL_SIZE).unwrap();
        let other_ch: &Channel = unsafe { other.cast().as_ref() };

        m.channel().set_state(ChannelState::Request);
        assert_eq!(other_ch.load_state(), ChannelState::Request as u32);

        unsafe { libc::munmap(other.as_ptr(), CHANNEL_SIZE) };
    }

    #[test]
    fn arena_bump_aligns_and_exhausts() {
        let mut backing = vec![0u8; 4096];
        let backing_ptr = backing.as_mut_ptr();
        let mut arena = Arena {
            base: NonNull::new(backing_ptr).unwrap(),
            size: 4096,
            offset: 0,
        };
        let a = arena.bump(3).unwrap();
        let b = arena.bump(17).unwrap();
        // Sizes round up to the arena granule, so slots never overlap.
        assert_eq!(a, backing_ptr);
        assert_eq!(b as usize - a as usize, 16);
        assert_eq!(arena.offset, 16 + 32);

        assert!(matches!(arena.bump(4096), Err(Error::ArenaExhausted)));
        arena.offset = 0;
        assert!(arena.bump(4096).is_ok());
    }
}
