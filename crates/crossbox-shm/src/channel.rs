//! Shared-memory channel layout and the futex-backed wait-state protocol.
//!
//! ## Ownership protocol
//!
//! Exactly one party at a time has the right to mutate the payload: the party
//! that last transitioned the state word owns the channel until it transitions
//! it again. All payload accesses are ordered by acquire loads and release
//! stores on the state word, so no other field needs to be atomic (the guest
//! channel address is atomic only because the host spin-reads it during worker
//! bootstrap, before the first state transition on that channel).
//!
//! ## Waiting
//!
//! Waiting is a brief spin with the architecture's pause hint, then
//! `futex(FUTEX_WAIT)` on the observed value. Every state write issues a
//! `futex(FUTEX_WAKE)`. There are no timeouts: a stuck peer is detected by
//! the host's death watcher, which poisons the state word to
//! [`ChannelState::Dead`]. Every wait loop must treat `Dead` as terminal.

use std::cell::UnsafeCell;
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum argument count for a dynamic call or callback.
pub const MAX_ARGS: usize = 8;

/// Maximum symbol name length for dlsym requests, including the NUL.
pub const MAX_SYMBOL_NAME: usize = 256;

/// Inline argument buffer capacity.
pub const ARG_STORAGE: usize = 1024;

/// Inline result buffer capacity.
pub const RESULT_STORAGE: usize = 32;

/// Bulk-transfer staging buffer capacity (one page).
pub const XFER_STORAGE: usize = 4096;

/// Size of the mapped channel region. Page multiple; the [`Channel`] struct
/// must fit inside it.
pub const CHANNEL_SIZE: usize = 8192;

/// Spin iterations before falling back to the kernel wait.
const SPIN_ITERATIONS: usize = 64;

/// Channel state word values. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelState {
    /// Host owns the channel; no request outstanding.
    Idle = 0,
    /// Host has published a request; guest owns the channel.
    Request = 1,
    /// Guest has published a response; host owns the channel.
    Response = 2,
    /// Host tells the guest worker to tear down.
    Exit = 3,
    /// Poison value set by the death watcher. Terminal.
    Dead = 4,
    /// Guest has published a callback upcall; host owns the channel.
    Callback = 5,
}

impl ChannelState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Idle,
            1 => Self::Request,
            2 => Self::Response,
            3 => Self::Exit,
            4 => Self::Dead,
            5 => Self::Callback,
            _ => return None,
        })
    }
}

/// Request kind tag. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// Resolve a symbol name to a guest address.
    Dlsym = 1,
    /// Invoke a guest function with marshalled arguments.
    Call = 2,
    /// Receive one fd from the fd-passing socket.
    RecvFd = 3,
    /// Spawn a worker thread for a new channel (control channel only).
    SpawnWorker = 4,
    /// Allocate an executable callback closure in the guest.
    CreateClosure = 5,
    /// Host handing the channel back to a waiting closure: the callback
    /// result is in the result buffer. Distinguishes "callback finished"
    /// from a nested call issued by the callback itself.
    CallbackReturn = 6,
}

impl RequestKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Dlsym,
            2 => Self::Call,
            3 => Self::RecvFd,
            4 => Self::SpawnWorker,
            5 => Self::CreateClosure,
            6 => Self::CallbackReturn,
            _ => return None,
        })
    }
}

/// Byte storage that keeps libffi-compatible alignment inside `repr(C)`
/// structs regardless of the fields preceding it.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct Storage<const N: usize>(pub [u8; N]);

impl<const N: usize> Storage<N> {
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

/// Protocol-ordered payload. Only the owner of the channel (per the state
/// word) may touch any of this.
#[derive(Debug)]
#[repr(C)]
pub struct Payload {
    /// Request kind ([`RequestKind`] as u32).
    pub request: u32,

    // Call request.
    pub func_addr: u64,
    pub nargs: u32,
    pub ret_type: u32,
    pub arg_types: [u32; MAX_ARGS],
    /// Offsets into `arg_storage`, one per argument. Bounds-checked by both
    /// sides; a violation is protocol corruption.
    pub arg_offsets: [u64; MAX_ARGS],

    // Dlsym request.
    pub symbol_name: [u8; MAX_SYMBOL_NAME],
    pub symbol_addr: u64,

    // RecvFd request: fd number as allocated in the guest, -1 on failure.
    pub received_fd: i32,

    // SpawnWorker request: guest fd of the new channel region.
    pub worker_shm_fd: i32,

    // CreateClosure request.
    pub closure_callback_id: u32,
    pub closure_nargs: u32,
    pub closure_ret_type: u32,
    pub closure_arg_types: [u32; MAX_ARGS],
    /// Result: guest address of the executable closure, 0 on failure.
    pub closure_addr: u64,

    // Callback upcall.
    pub callback_id: u32,

    pub arg_storage: Storage<ARG_STORAGE>,
    pub result_storage: Storage<RESULT_STORAGE>,
    pub xfer_storage: Storage<XFER_STORAGE>,
}

/// One shared-memory channel. Mapped at `CHANNEL_SIZE` bytes in both
/// processes, at potentially different virtual addresses.
#[repr(C)]
pub struct Channel {
    state: AtomicU32,
    /// Guest's view of this channel's address. Written once by the guest
    /// when its dispatch loop is ready; the host spins on it during worker
    /// bootstrap and uses it to address `xfer_storage` in the guest.
    guest_addr: AtomicU64,
    payload: UnsafeCell<Payload>,
}

// Payload access is ordered by the state word; see the module docs.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

const _: () = assert!(std::mem::size_of::<Channel>() <= CHANNEL_SIZE);
const _: () = assert!(CHANNEL_SIZE % 4096 == 0);

/// Offset of the bulk staging buffer within the channel region. Added to the
/// guest channel address to form the guest-domain staging pointer.
pub const XFER_OFFSET: usize =
    offset_of!(Channel, payload) + offset_of!(Payload, xfer_storage);

/// Observed a [`ChannelState::Dead`] poison while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDead;

impl Channel {
    /// A zeroed channel on the heap (state `Idle`). Freshly mapped memfd
    /// pages are zero, so a mapped channel starts in the same state.
    pub fn new_boxed() -> Box<Channel> {
        // SAFETY: every field is valid all-zeroes.
        unsafe { Box::<Channel>::new_zeroed().assume_init() }
    }

    pub fn state_word(&self) -> &AtomicU32 {
        &self.state
    }

    pub fn load_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Publish a state transition: release-store plus wake.
    ///
    /// Used by the guest (which cannot race the watcher while alive) and by
    /// the watcher's own poison write. Host threads use [`Channel::transition`]
    /// so a concurrent poison is never overwritten.
    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u32, Ordering::Release);
        futex_wake(&self.state);
    }

    /// Attempt one edge of the state machine, failing if the word holds
    /// anything but `from` - either the watcher poisoned it or the peer wrote
    /// garbage. Wakes the peer on success.
    pub fn transition(&self, from: ChannelState, to: ChannelState) -> Result<(), ChannelDead> {
        match self.state.compare_exchange(
            from as u32,
            to as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                futex_wake(&self.state);
                Ok(())
            }
            Err(_) => Err(ChannelDead),
        }
    }

    /// Spin briefly, then futex-wait until the state word equals `expected`.
    /// Returns `Err(ChannelDead)` if the poison value is observed instead.
    pub fn wait_for(&self, expected: ChannelState) -> Result<(), ChannelDead> {
        let want = expected as u32;
        for _ in 0..SPIN_ITERATIONS {
            match self.state.load(Ordering::Acquire) {
                cur if cur == want => return Ok(()),
                cur if cur == ChannelState::Dead as u32 => return Err(ChannelDead),
                _ => std::hint::spin_loop(),
            }
        }
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == want {
                return Ok(());
            }
            if cur == ChannelState::Dead as u32 {
                return Err(ChannelDead);
            }
            futex_wait(&self.state, cur);
        }
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr.load(Ordering::Acquire)
    }

    /// Guest-side bootstrap: publish this channel's address in the guest's
    /// address space. Signals worker readiness to the host.
    pub fn publish_guest_addr(&self, addr: u64) {
        self.guest_addr.store(addr, Ordering::Release);
    }

    /// Raw pointer to the payload.
    ///
    /// Dereferencing is sound only for the current owner of the channel, and
    /// references derived from it must not be held across a state transition
    /// or a wait.
    pub fn payload_ptr(&self) -> *mut Payload {
        self.payload.get()
    }
}

pub fn futex_wake(word: &AtomicU32) {
    // SAFETY: the word lives in (shared) memory valid for the futex syscall.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            1u32,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wait-if-equal: block until the word changes away from `expected`.
/// Spurious returns are fine; callers always re-check.
pub fn futex_wait(word: &AtomicU32, expected: u32) {
    // SAFETY: as above. EAGAIN and EINTR are expected outcomes.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn channel_fits_region() {
        assert!(std::mem::size_of::<Channel>() <= CHANNEL_SIZE);
    }

    #[test]
    fn storages_are_aligned() {
        // libffi writes return values and reads argument slots out of these
        // buffers; they must be at least 8-byte aligned.
        let base = offset_of!(Channel, payload);
        assert_eq!((base + offset_of!(Payload, arg_storage)) % 8, 0);
        assert_eq!((base + offset_of!(Payload, result_storage)) % 8, 0);
        assert_eq!(XFER_OFFSET % 8, 0);
    }

    #[test]
    fn state_wire_values() {
        assert_eq!(ChannelState::Idle as u32, 0);
        assert_eq!(ChannelState::Request as u32, 1);
        assert_eq!(ChannelState::Response as u32, 2);
        assert_eq!(ChannelState::Exit as u32, 3);
        assert_eq!(ChannelState::Dead as u32, 4);
        assert_eq!(ChannelState::Callback as u32, 5);
        for raw in 0..6 {
            assert_eq!(ChannelState::from_raw(raw).unwrap() as u32, raw);
        }
        assert_eq!(ChannelState::from_raw(6), None);
    }

    #[test]
    fn fresh_channel_is_idle() {
        let ch = Channel::new_boxed();
        assert_eq!(ch.load_state(), ChannelState::Idle as u32);
        assert_eq!(ch.guest_addr(), 0);
    }

    #[test]
    fn wait_returns_on_transition() {
        let ch: Arc<Channel> = Channel::new_boxed().into();
        let peer = Arc::clone(&ch);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            peer.set_state(ChannelState::Request);
        });
        ch.wait_for(ChannelState::Request).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn wait_terminates_on_dead() {
        let ch: Arc<Channel> = Channel::new_boxed().into();
        let peer = Arc::clone(&ch);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            peer.set_state(ChannelState::Dead);
        });
        assert_eq!(ch.wait_for(ChannelState::Response), Err(ChannelDead));
        t.join().unwrap();
    }

    #[test]
    fn transition_is_poison_safe() {
        let ch = Channel::new_boxed();
        ch.transition(ChannelState::Idle, ChannelState::Request)
            .unwrap();
        assert_eq!(ch.load_state(), ChannelState::Request as u32);

        // A poisoned word refuses further transitions instead of being
        // silently overwritten.
        ch.set_state(ChannelState::Dead);
        assert_eq!(
            ch.transition(ChannelState::Idle, ChannelState::Request),
            Err(ChannelDead)
        );
        assert_eq!(ch.load_state(), ChannelState::Dead as u32);
    }

    #[test]
    fn handoff_round_trip() {
        let ch: Arc<Channel> = Channel::new_boxed().into();
        let peer = Arc::clone(&ch);
        let t = thread::spawn(move || {
            peer.wait_for(ChannelState::Request).unwrap();
            // SAFETY: we own the channel after observing Request.
            let value = unsafe { (*peer.payload_ptr()).func_addr };
            unsafe { (*peer.payload_ptr()).symbol_addr = value + 1 };
            peer.set_state(ChannelState::Response);
        });

        // SAFETY: channel is Idle, host owns it.
        unsafe { (*ch.payload_ptr()).func_addr = 41 };
        ch.set_state(ChannelState::Request);
        ch.wait_for(ChannelState::Response).unwrap();
        let echoed = unsafe { (*ch.payload_ptr()).symbol_addr };
        assert_eq!(echoed, 42);
        ch.set_state(ChannelState::Idle);
        t.join().unwrap();
    }
}
