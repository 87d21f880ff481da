//! The guest dispatch loop, worker threads, and callback closures.
//!
//! Every channel is served by one thread: the process's main thread serves
//! the control channel, and each SpawnWorker request starts a worker thread
//! for a freshly mapped region. A worker installs the clone-blocking filter,
//! publishes its channel address, and loops until the host transitions its
//! channel to `Exit`.
//!
//! Callback closures allocated here run on whichever worker is executing the
//! call that invoked them: the handler packs the native arguments into that
//! worker's channel, raises `Callback`, and waits for the host to hand the
//! channel back. A `CallbackReturn` request carries the result; any other
//! request is a nested call issued from inside the host callback and is
//! served in place, which is what makes arbitrary-depth re-entrancy work.
//!
//! Adversarial inputs (bad tags, out-of-range offsets or ids) are protocol
//! corruption: the process prints a diagnostic and exits, taking every
//! worker with it.

use std::cell::{Cell, RefCell};
use std::ffi::{c_void, CStr};
use std::io::{self, Write};
use std::os::fd::IntoRawFd;
use std::ptr;
use std::thread;

use libffi::raw;

use crossbox_shm::{
    futex_wait, Channel, ChannelState, RequestKind, TypeTag, ARG_STORAGE, CHANNEL_SIZE, MAX_ARGS,
    MAX_SYMBOL_NAME,
};
use crossbox_sys::seccomp;

use crate::socket_fd;

thread_local! {
    /// The channel served by this thread; closures invoked during a call
    /// upcall through it.
    static CURRENT_CHANNEL: Cell<*const Channel> = const { Cell::new(ptr::null()) };

    /// Closures created on this channel, freed when it exits.
    static CLOSURES: RefCell<Vec<ClosureInfo>> = const { RefCell::new(Vec::new()) };
}

/// Closure user-data; boxed so its address survives the dispatch loop.
struct ClosureData {
    callback_id: u32,
    ret: TypeTag,
}

struct ClosureInfo {
    closure: *mut raw::ffi_closure,
    _cif: Box<raw::ffi_cif>,
    _atypes: Box<[*mut raw::ffi_type; MAX_ARGS]>,
    _data: Box<ClosureData>,
}

fn log_stderr(msg: &str) {
    // Best effort: write is not in the seccomp allow-list.
    writeln!(io::stderr(), "crossbox-guest: {msg}").ok();
}

/// Protocol corruption: diagnostic, then kill the whole guest.
fn die(msg: &str) -> ! {
    log_stderr(msg);
    std::process::exit(1);
}

/// Serve one channel until the host transitions it to `Exit`.
///
/// # Safety
///
/// `channel` must be the guest side of a crossbox channel whose host honors
/// the ownership protocol. Call requests execute arbitrary function pointers
/// in this process; this is the sandboxed side, so that is the point, but it
/// must never be driven from an unsandboxed process.
pub unsafe fn serve(channel: &Channel, is_control: bool) {
    CURRENT_CHANNEL.with(|c| c.set(channel as *const Channel));

    loop {
        loop {
            let state = channel.load_state();
            if state == ChannelState::Request as u32 {
                break;
            }
            if state == ChannelState::Exit as u32 {
                free_closures();
                CURRENT_CHANNEL.with(|c| c.set(ptr::null()));
                return;
            }
            futex_wait(channel.state_word(), state);
        }

        handle_request(channel, is_control);
        channel.set_state(ChannelState::Response);
    }
}

/// Serve one request already observed in `Request` state. Shared between the
/// main loop and nested dispatch inside a waiting closure.
unsafe fn handle_request(channel: &Channel, is_control: bool) {
    let kind = unsafe { (*channel.payload_ptr()).request };
    match RequestKind::from_raw(kind) {
        Some(RequestKind::Dlsym) => unsafe { handle_dlsym(channel) },
        Some(RequestKind::Call) => unsafe { handle_call(channel) },
        Some(RequestKind::RecvFd) => unsafe { handle_recv_fd(channel) },
        Some(RequestKind::SpawnWorker) => {
            // Only the control thread may spawn workers.
            if is_control {
                let fd = unsafe { (*channel.payload_ptr()).worker_shm_fd };
                spawn_worker(fd);
            }
        }
        Some(RequestKind::CreateClosure) => unsafe { handle_create_closure(channel) },
        Some(RequestKind::CallbackReturn) | None => die("unexpected request kind"),
    }
}

unsafe fn handle_dlsym(channel: &Channel) {
    let p = unsafe { &mut *channel.payload_ptr() };
    p.symbol_name[MAX_SYMBOL_NAME - 1] = 0;
    let name = CStr::from_bytes_until_nul(&p.symbol_name).unwrap_or(c"");
    let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    p.symbol_addr = sym as u64;
}

/// Invoke the requested function through libffi.
///
/// Tags and offsets are re-validated against this side's own buffer bounds:
/// relative to the guest they are adversary-controlled inputs, and an
/// out-of-range value is treated as protocol corruption even though the
/// host is normally trusted.
unsafe fn handle_call(channel: &Channel) {
    let mut atypes: [*mut raw::ffi_type; MAX_ARGS] = [ptr::null_mut(); MAX_ARGS];
    let mut argv: [*mut c_void; MAX_ARGS] = [ptr::null_mut(); MAX_ARGS];

    let (func_addr, nargs, ret) = {
        let p = unsafe { &mut *channel.payload_ptr() };
        let nargs = p.nargs as usize;
        if nargs > MAX_ARGS {
            die("argument count out of range");
        }
        let Some(ret) = TypeTag::from_raw(p.ret_type) else {
            die("bad return type tag");
        };
        for i in 0..nargs {
            let Some(tag) = TypeTag::from_raw(p.arg_types[i]) else {
                die("bad argument type tag");
            };
            let offset = p.arg_offsets[i] as usize;
            if offset + tag.size() > ARG_STORAGE {
                die("argument offset out of range");
            }
            atypes[i] = tag.ffi_type();
            argv[i] = unsafe { p.arg_storage.0.as_mut_ptr().add(offset).cast() };
        }
        (p.func_addr, nargs, ret)
    };
    // No payload reference is live past this point: the call below may
    // re-enter the channel through a callback closure.

    let mut cif = unsafe { std::mem::zeroed::<raw::ffi_cif>() };
    let status = unsafe {
        raw::ffi_prep_cif(
            &mut cif,
            raw::ffi_abi_FFI_DEFAULT_ABI,
            nargs as u32,
            ret.ffi_type(),
            atypes.as_mut_ptr(),
        )
    };
    if status != raw::ffi_status_FFI_OK {
        log_stderr("call interface rejected");
        unsafe { (*channel.payload_ptr()).result_storage.0.fill(0) };
        return;
    }

    let result = unsafe { (*channel.payload_ptr()).result_storage.0.as_mut_ptr() };
    unsafe {
        let func: unsafe extern "C" fn() = std::mem::transmute(func_addr as usize);
        raw::ffi_call(&mut cif, Some(func), result.cast(), argv.as_mut_ptr());
    }
}

unsafe fn handle_recv_fd(channel: &Channel) {
    let fd = crossbox_sys::scm::recv_fd(socket_fd())
        .map(IntoRawFd::into_raw_fd)
        .unwrap_or(-1);
    unsafe { (*channel.payload_ptr()).received_fd = fd };
}

fn spawn_worker(shm_fd: i32) {
    let spawned = thread::Builder::new()
        .name("crossbox-worker".into())
        .spawn(move || worker_main(shm_fd));
    if spawned.is_err() {
        log_stderr("failed to spawn worker thread");
    }
    // The worker runs detached; its channel's Exit transition tears it down.
}

fn worker_main(shm_fd: i32) {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            CHANNEL_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            shm_fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        log_stderr("worker failed to map its channel");
        return;
    }
    unsafe { libc::close(shm_fd) };

    // Workers may not create further threads.
    if unsafe { seccomp::install(&seccomp::worker_filter(), false) }.is_err() {
        log_stderr("worker failed to install its filter");
        unsafe { libc::munmap(ptr, CHANNEL_SIZE) };
        return;
    }

    // SAFETY: the host initialized the region as a zeroed channel.
    let channel: &Channel = unsafe { &*ptr.cast::<Channel>() };
    // Publishing the address tells the host this worker is ready.
    channel.publish_guest_addr(ptr as u64);

    unsafe { serve(channel, false) };
    unsafe { libc::munmap(ptr, CHANNEL_SIZE) };
}

unsafe fn handle_create_closure(channel: &Channel) {
    let p = unsafe { &mut *channel.payload_ptr() };
    let nargs = p.closure_nargs as usize;
    if nargs > MAX_ARGS {
        die("closure argument count out of range");
    }
    let Some(ret) = TypeTag::from_raw(p.closure_ret_type) else {
        die("bad closure return type tag");
    };

    let mut atypes = Box::new([ptr::null_mut::<raw::ffi_type>(); MAX_ARGS]);
    for i in 0..nargs {
        let Some(tag) = TypeTag::from_raw(p.closure_arg_types[i]) else {
            die("bad closure argument type tag");
        };
        atypes[i] = tag.ffi_type();
    }

    // The cif and type array must outlive the closure; both stay boxed in
    // the per-thread closure list.
    let mut cif = Box::new(unsafe { std::mem::zeroed::<raw::ffi_cif>() });
    let status = unsafe {
        raw::ffi_prep_cif(
            cif.as_mut(),
            raw::ffi_abi_FFI_DEFAULT_ABI,
            nargs as u32,
            ret.ffi_type(),
            atypes.as_mut_ptr(),
        )
    };
    if status != raw::ffi_status_FFI_OK {
        p.closure_addr = 0;
        return;
    }

    let mut code: *mut c_void = ptr::null_mut();
    let closure =
        unsafe { raw::ffi_closure_alloc(size_of::<raw::ffi_closure>(), &mut code) }.cast::<raw::ffi_closure>();
    if closure.is_null() {
        p.closure_addr = 0;
        return;
    }

    let data = Box::new(ClosureData {
        callback_id: p.closure_callback_id,
        ret,
    });
    let status = unsafe {
        raw::ffi_prep_closure_loc(
            closure,
            cif.as_mut(),
            Some(closure_handler),
            (&*data as *const ClosureData as *mut ClosureData).cast(),
            code,
        )
    };
    if status != raw::ffi_status_FFI_OK {
        unsafe { raw::ffi_closure_free(closure.cast()) };
        p.closure_addr = 0;
        return;
    }

    CLOSURES.with(|c| {
        c.borrow_mut().push(ClosureInfo {
            closure,
            _cif: cif,
            _atypes: atypes,
            _data: data,
        })
    });
    p.closure_addr = code as u64;
}

fn free_closures() {
    CLOSURES.with(|c| {
        for info in c.borrow_mut().drain(..) {
            // SAFETY: allocated by ffi_closure_alloc, never freed twice.
            unsafe { raw::ffi_closure_free(info.closure.cast()) };
        }
    });
}

/// Trampoline target for every callback closure: upcall to the host on the
/// current thread's channel and wait for the result.
unsafe extern "C" fn closure_handler(
    cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let data = unsafe { &*userdata.cast::<ClosureData>() };
    let channel_ptr = CURRENT_CHANNEL.with(|c| c.get());
    if channel_ptr.is_null() {
        // Invoked outside any dispatch context; nothing to upcall through.
        return;
    }
    let channel = unsafe { &*channel_ptr };

    {
        let p = unsafe { &mut *channel.payload_ptr() };
        let nargs = unsafe { (*cif).nargs } as usize;
        p.callback_id = data.callback_id;
        p.nargs = nargs as u32;

        let mut offset = 0usize;
        for i in 0..nargs {
            let size = unsafe { (*(*(*cif).arg_types.add(i))).size };
            if offset + size > ARG_STORAGE {
                die("callback arguments overflow the inline buffer");
            }
            p.arg_offsets[i] = offset as u64;
            unsafe {
                ptr::copy_nonoverlapping(
                    (*args.add(i)).cast::<u8>(),
                    p.arg_storage.0.as_mut_ptr().add(offset),
                    size,
                );
            }
            offset += size;
        }
    }

    channel.set_state(ChannelState::Callback);

    // The host dispatches the callback and hands the channel back with a
    // CallbackReturn request. Any other request kind is a nested call made
    // from inside the host callback: serve it and keep waiting.
    loop {
        loop {
            let state = channel.load_state();
            if state == ChannelState::Request as u32 {
                break;
            }
            futex_wait(channel.state_word(), state);
        }

        let kind = unsafe { (*channel.payload_ptr()).request };
        if kind == RequestKind::CallbackReturn as u32 {
            if data.ret != TypeTag::Void && !ret.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(
                        (*channel.payload_ptr()).result_storage.0.as_ptr(),
                        ret.cast::<u8>(),
                        data.ret.size(),
                    );
                }
            }
            return;
        }

        unsafe { handle_request(channel, false) };
        channel.set_state(ChannelState::Response);
    }
}
