//! Callback registry and re-entrant upcall dispatch.
//!
//! Callbacks invert the call direction: guest code invokes a function
//! pointer that must reach a host function. Registration asks the guest to
//! allocate an executable closure whose user-data is a small integer id;
//! when invoked, the closure packs its native arguments onto the calling
//! worker's channel and transitions it to `Callback`. The host thread
//! blocked in its wait loop dispatches the host function through a libffi
//! call interface cached at registration, then hands the channel back with a
//! `CallbackReturn` request.
//!
//! The registry is append-only. Descriptors are published with a release
//! store on the count so the lock-free dispatch path never observes a
//! half-initialized descriptor; individual callbacks live until the sandbox
//! is destroyed.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use libffi::raw;

use crossbox_shm::{Channel, ChannelState, RequestKind, TypeTag, ARG_STORAGE, MAX_ARGS};

use crate::channels;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxInner};

pub(crate) const MAX_CALLBACKS: usize = 64;

/// One registered host callback.
pub(crate) struct CallbackDesc {
    func: *const c_void,
    nargs: usize,
    arg_types: [TypeTag; MAX_ARGS],
    /// Call interface prepared once at registration.
    cif: Box<raw::ffi_cif>,
    /// Keeps the cif's argument type array alive.
    _ffi_args: Box<[*mut raw::ffi_type; MAX_ARGS]>,
    /// Guest-domain closure address, recorded after creation. Kept for
    /// debugging; the guest dispatches by id, not by address.
    #[allow(dead_code)]
    guest_closure: AtomicU64,
}

impl CallbackDesc {
    fn new(func: *const c_void, ret: TypeTag, args: &[TypeTag]) -> Result<Self> {
        let mut ffi_args = Box::new([ptr::null_mut(); MAX_ARGS]);
        let mut arg_types = [TypeTag::Void; MAX_ARGS];
        for (i, &tag) in args.iter().enumerate() {
            arg_types[i] = tag;
            ffi_args[i] = tag.ffi_type();
        }

        // SAFETY: zeroed ffi_cif is a valid target for ffi_prep_cif, which
        // initializes it; the type arrays outlive the cif in this struct.
        let mut cif = Box::new(unsafe { std::mem::zeroed::<raw::ffi_cif>() });
        let status = unsafe {
            raw::ffi_prep_cif(
                cif.as_mut(),
                raw::ffi_abi_FFI_DEFAULT_ABI,
                args.len() as u32,
                ret.ffi_type(),
                ffi_args.as_mut_ptr(),
            )
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(Error::CifPrep);
        }

        Ok(Self {
            func,
            nargs: args.len(),
            arg_types,
            cif,
            _ffi_args: ffi_args,
            guest_closure: AtomicU64::new(0),
        })
    }

    fn cif_ptr(&self) -> *mut raw::ffi_cif {
        let cif: &raw::ffi_cif = &self.cif;
        cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }
}

/// Append-only callback descriptor table with a lock-free read path.
pub(crate) struct CallbackRegistry {
    slots: Box<[UnsafeCell<MaybeUninit<CallbackDesc>>]>,
    count: AtomicU32,
    write_lock: Mutex<()>,
}

// SAFETY: slots below `count` are immutable once published (release store on
// `count`, acquire load in `get`); writes above `count` are serialized by
// `write_lock`. The function pointers inside descriptors are extern "C"
// functions, safe to share.
unsafe impl Send for CallbackRegistry {}
unsafe impl Sync for CallbackRegistry {}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..MAX_CALLBACKS)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            count: AtomicU32::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Lock-free lookup used by the dispatch path. Out-of-range ids are the
    /// caller's protocol-corruption case.
    pub(crate) fn get(&self, id: u32) -> Option<&CallbackDesc> {
        if id >= self.count.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: id < count implies the slot was fully written before the
        // release store that published it.
        Some(unsafe { (*self.slots[id as usize].get()).assume_init_ref() })
    }
}

impl Drop for CallbackRegistry {
    fn drop(&mut self) {
        let count = self.count.load(Ordering::Acquire) as usize;
        for slot in &mut self.slots[..count] {
            // SAFETY: slots below count are initialized.
            unsafe { slot.get_mut().assume_init_drop() };
        }
    }
}

impl Sandbox {
    /// Register a host function as a guest-callable callback.
    ///
    /// Returns a guest-domain function pointer that the untrusted library
    /// can store and invoke like a normal function. The callback runs on
    /// whichever host thread issued the call the guest is currently
    /// servicing; it may itself call back into the sandbox (nesting reuses
    /// the same channel). Callbacks are never unregistered.
    ///
    /// # Safety
    ///
    /// `func` must be an `extern "C"` function whose actual signature
    /// matches `ret` and `args`; the runtime will invoke it through that
    /// ABI with argument values supplied by the untrusted guest, so the
    /// function must also tolerate arbitrary argument values.
    pub unsafe fn register_callback(
        &self,
        func: *const c_void,
        ret: TypeTag,
        args: &[TypeTag],
    ) -> Result<u64> {
        if args.len() > MAX_ARGS {
            return Err(Error::TooManyArgs(args.len()));
        }
        let registry = &self.inner.callbacks;
        let _write = registry.write_lock.lock().unwrap();

        let id = registry.count.load(Ordering::Relaxed);
        if id as usize >= MAX_CALLBACKS {
            return Err(Error::CallbackLimit);
        }

        let desc = CallbackDesc::new(func, ret, args)?;
        // Fully initialize the slot, then publish: the dispatch path reads
        // `count` without the write lock.
        unsafe { (*registry.slots[id as usize].get()).write(desc) };
        registry.count.store(id + 1, Ordering::Release);

        // Ask the guest for an executable closure dispatching to this id.
        let tch = channels::thread_channel(&self.inner)?;
        let ch = tch.channel();
        {
            // SAFETY: channel is Idle, we own the payload.
            let p = unsafe { &mut *ch.payload_ptr() };
            p.request = RequestKind::CreateClosure as u32;
            p.closure_callback_id = id;
            p.closure_ret_type = ret as u32;
            p.closure_nargs = args.len() as u32;
            for (i, &tag) in args.iter().enumerate() {
                p.closure_arg_types[i] = tag as u32;
            }
        }
        crate::call::begin_request(ch)?;
        ch.wait_for(ChannelState::Response)
            .map_err(|_| Error::SandboxDead)?;
        let addr = unsafe { (*ch.payload_ptr()).closure_addr };
        crate::call::finish_response(ch);

        if addr == 0 {
            // The descriptor slot stays published (ids are never reused),
            // but registration is retryable.
            return Err(Error::ClosureAlloc);
        }
        if let Some(desc) = registry.get(id) {
            desc.guest_closure.store(addr, Ordering::Relaxed);
        }
        tracing::debug!(id, addr, "callback registered");
        Ok(addr)
    }
}

/// Service one `Callback` transition: invoke the host function the guest
/// asked for and hand the channel back.
///
/// Protocol corruption (out-of-range id, out-of-range argument offset) kills
/// the guest; the caller's wait loop then observes `Dead` via the watcher.
pub(crate) fn dispatch_callback(inner: &SandboxInner, ch: &Channel) {
    // SAFETY: Callback observed, the host owns the channel.
    let id = unsafe { (*ch.payload_ptr()).callback_id };
    let Some(desc) = inner.callbacks.get(id) else {
        protocol_violation(inner, "callback id out of range");
        return;
    };

    let mut argv: [*mut c_void; MAX_ARGS] = [ptr::null_mut(); MAX_ARGS];
    {
        let p = unsafe { &mut *ch.payload_ptr() };
        for i in 0..desc.nargs {
            // Read the offset once so the guest cannot race the bounds
            // check against the use.
            let offset = p.arg_offsets[i] as usize;
            let size = desc.arg_types[i].size();
            if offset + size > ARG_STORAGE {
                protocol_violation(inner, "callback argument offset out of range");
                return;
            }
            argv[i] = unsafe { p.arg_storage.0.as_mut_ptr().add(offset).cast() };
        }
    }

    let result = unsafe { (*ch.payload_ptr()).result_storage.0.as_mut_ptr() };
    // SAFETY: the cif matches the registered signature, argument pointers
    // are bounds-checked above, and the result buffer holds any primitive.
    // The host function may re-enter the sandbox; it does so through fresh
    // payload borrows, which is why no reference is held across this call.
    unsafe {
        let func: unsafe extern "C" fn() = std::mem::transmute(desc.func);
        raw::ffi_call(desc.cif_ptr(), Some(func), result.cast(), argv.as_mut_ptr());
    }

    // Hand the channel back to the waiting closure. The request kind tells
    // the closure this is its result, not a nested call. The word holds
    // `Callback` still, or `Idle` if the callback made nested calls; a
    // poisoned word is left for the caller's wait loop.
    unsafe { (*ch.payload_ptr()).request = RequestKind::CallbackReturn as u32 };
    let _ = crate::call::begin_request(ch);
}

fn protocol_violation(inner: &SandboxInner, what: &str) {
    tracing::error!(pid = inner.pid, what, "sandbox violated the callback protocol");
    unsafe { libc::kill(inner.pid, libc::SIGKILL) };
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    #[test]
    fn registry_publishes_in_order() {
        let registry = CallbackRegistry::new();
        assert!(registry.get(0).is_none());

        let desc = CallbackDesc::new(
            add as *const c_void,
            TypeTag::I32,
            &[TypeTag::I32, TypeTag::I32],
        )
        .unwrap();
        unsafe { (*registry.slots[0].get()).write(desc) };
        registry.count.store(1, Ordering::Release);

        let got = registry.get(0).unwrap();
        assert_eq!(got.nargs, 2);
        assert_eq!(got.arg_types[0], TypeTag::I32);
        assert!(registry.get(1).is_none());
        assert!(registry.get(u32::MAX).is_none());
    }

    #[test]
    fn cached_cif_invokes_the_function() {
        // The exact path dispatch_callback takes: argument pointers into a
        // byte buffer, result written through the cached cif.
        let desc = CallbackDesc::new(
            add as *const c_void,
            TypeTag::I32,
            &[TypeTag::I32, TypeTag::I32],
        )
        .unwrap();

        let mut a = 10i32;
        let mut b = 32i32;
        let mut argv: [*mut c_void; 2] =
            [(&mut a as *mut i32).cast(), (&mut b as *mut i32).cast()];
        let mut result = 0i64;
        unsafe {
            let func: unsafe extern "C" fn() = std::mem::transmute(desc.func);
            raw::ffi_call(
                desc.cif_ptr(),
                Some(func),
                (&mut result as *mut i64).cast(),
                argv.as_mut_ptr(),
            );
        }
        assert_eq!(result as i32, 42);
    }

    #[test]
    fn zero_arg_void_signature_preps() {
        extern "C" fn nop() {}
        assert!(CallbackDesc::new(nop as *const c_void, TypeTag::Void, &[]).is_ok());
    }
}
