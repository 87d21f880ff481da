//! Sandbox lifecycle: bootstrap, death watching, symbol lookup, teardown.
//!
//! ## Bootstrap
//!
//! 1. Create and map the control channel region (state `Idle`).
//! 2. Create the fd-passing socketpair.
//! 3. Fork. The child marks every inherited fd close-on-exec, clears the
//!    flag on the two fds the guest needs, and execs the guest binary as
//!    `<guest> <control_shm_fd> <socket_fd>`.
//! 4. Spawn the watcher thread: it blocks in `waitpid` and, when the child
//!    dies, logs the cause (unless we are tearing down on purpose) and
//!    poisons every channel to `Dead`, waking any blocked caller.
//! 5. Resolve and cache the common guest symbols (`malloc`, `calloc`,
//!    `realloc`, `free`, `mmap`, `munmap`, `memcpy`, `close`) over the
//!    control channel; the pointer-aware API uses them.
//!
//! ## Teardown
//!
//! Dropping the [`Sandbox`] sets the destroying flag (suppressing the death
//! log), SIGKILLs the child, and joins the watcher. Per-thread channels
//! release their resources when their owning threads exit; the control
//! mapping and socket go with the handle.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbox_shm::{Channel, ChannelState, RequestKind, MAX_SYMBOL_NAME};
use crossbox_sys::{last_errno, mark_fds_cloexec, scm};

use crate::callback::CallbackRegistry;
use crate::channels::{self, ChannelMapping};
use crate::error::{Error, Result};
use crate::fdpass::FdTable;

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

/// Guest addresses of the symbols the pointer-aware API needs. An address of
/// zero means the guest doesn't export the symbol; the operations that need
/// it fail with [`Error::SymbolNotFound`].
pub(crate) struct Symbols {
    pub(crate) malloc: u64,
    pub(crate) calloc: u64,
    pub(crate) realloc: u64,
    pub(crate) free: u64,
    pub(crate) mmap: u64,
    pub(crate) munmap: u64,
    pub(crate) memcpy: u64,
    pub(crate) close: u64,
}

impl Symbols {
    fn resolve(ch: &Channel) -> Result<Self> {
        Ok(Self {
            malloc: dlsym_on(ch, "malloc")?,
            calloc: dlsym_on(ch, "calloc")?,
            realloc: dlsym_on(ch, "realloc")?,
            free: dlsym_on(ch, "free")?,
            mmap: dlsym_on(ch, "mmap")?,
            munmap: dlsym_on(ch, "munmap")?,
            memcpy: dlsym_on(ch, "memcpy")?,
            close: dlsym_on(ch, "close")?,
        })
    }
}

pub(crate) struct SandboxInner {
    pub(crate) id: u64,
    pub(crate) pid: libc::pid_t,
    pub(crate) control: Arc<ChannelMapping>,
    /// Serializes control-channel requests and worker spawning.
    pub(crate) control_lock: Mutex<()>,
    /// Host end of the fd-passing socket. The lock pairs each send with its
    /// guest-side receive.
    pub(crate) sock: Mutex<OwnedFd>,
    /// Weak handles to every live worker channel, for death poisoning.
    pub(crate) registry: Arc<Mutex<Vec<Weak<ChannelMapping>>>>,
    pub(crate) destroying: Arc<AtomicBool>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) fds: Mutex<FdTable>,
    pub(crate) syms: Symbols,
    sym_cache: Mutex<HashMap<String, u64>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to one sandboxed guest process.
///
/// Cheap to share by reference across threads; every calling thread gets its
/// own channel into the guest. Dropping the handle kills the guest.
pub struct Sandbox {
    pub(crate) inner: Arc<SandboxInner>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .finish()
    }
}

impl Sandbox {
    /// Spawn a guest process from the given executable.
    ///
    /// On failure nothing is retained: whatever was spawned is killed and
    /// reaped before the error is returned.
    pub fn create<P: AsRef<Path>>(guest_executable: P) -> Result<Sandbox> {
        let control = Arc::new(ChannelMapping::create(c"crossbox-control")?);
        let (host_sock, guest_sock) = scm::socketpair().map_err(Error::FdPass)?;

        let pid = spawn_guest(
            guest_executable.as_ref(),
            control.memfd(),
            guest_sock.as_fd(),
        )?;
        drop(guest_sock);

        let destroying = Arc::new(AtomicBool::new(false));
        let registry: Arc<Mutex<Vec<Weak<ChannelMapping>>>> = Arc::default();

        let watcher = match spawn_watcher(
            pid,
            Arc::clone(&control),
            Arc::clone(&registry),
            Arc::clone(&destroying),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                // SAFETY: pid is our own forked child.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, std::ptr::null_mut(), 0);
                }
                return Err(Error::Watcher(e));
            }
        };

        // The guest installs its seccomp filter and enters the dispatch
        // loop; the first requests resolve the symbols the memory API uses.
        let syms = match Symbols::resolve(control.channel()) {
            Ok(syms) => syms,
            Err(e) => {
                destroying.store(true, Ordering::Release);
                unsafe { libc::kill(pid, libc::SIGKILL) };
                let _ = watcher.join();
                return Err(e);
            }
        };

        tracing::debug!(pid, "sandbox spawned");
        Ok(Sandbox {
            inner: Arc::new(SandboxInner {
                id: NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed),
                pid,
                control,
                control_lock: Mutex::new(()),
                sock: Mutex::new(host_sock),
                registry,
                destroying,
                callbacks: CallbackRegistry::new(),
                fds: Mutex::new(FdTable::new()),
                syms,
                sym_cache: Mutex::new(HashMap::new()),
                watcher: Mutex::new(Some(watcher)),
            }),
        })
    }

    /// The guest's process id.
    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    /// Whether the guest process is still running.
    pub fn alive(&self) -> bool {
        self.inner.control.channel().load_state() != ChannelState::Dead as u32
    }

    /// Resolve a symbol in the guest. Results are cached per name.
    pub fn dlsym(&self, name: &str) -> Result<u64> {
        let cached = self.inner.sym_cache.lock().unwrap().get(name).copied();
        let addr = match cached {
            Some(addr) => addr,
            None => {
                let tch = channels::thread_channel(&self.inner)?;
                let addr = dlsym_on(tch.channel(), name)?;
                self.inner
                    .sym_cache
                    .lock()
                    .unwrap()
                    .insert(name.to_owned(), addr);
                addr
            }
        };
        if addr == 0 {
            return Err(Error::SymbolNotFound(name.to_owned()));
        }
        Ok(addr)
    }

    pub(crate) fn syms(&self) -> &Symbols {
        &self.inner.syms
    }

    pub(crate) fn require_sym(&self, addr: u64, name: &'static str) -> Result<u64> {
        if addr == 0 {
            return Err(Error::SymbolNotFound(name.to_owned()));
        }
        Ok(addr)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.inner.destroying.store(true, Ordering::Release);
        // SAFETY: pid is our forked child; the watcher reaps it.
        unsafe { libc::kill(self.inner.pid, libc::SIGKILL) };
        if let Some(handle) = self.inner.watcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        tracing::debug!(pid = self.inner.pid, "sandbox destroyed");
    }
}

/// One dlsym request/response on the given channel. The channel must be
/// owned by the caller (control channel during bootstrap, or the calling
/// thread's own channel).
pub(crate) fn dlsym_on(ch: &Channel, name: &str) -> Result<u64> {
    let bytes = name.as_bytes();
    if bytes.len() >= MAX_SYMBOL_NAME || bytes.contains(&0) {
        return Err(Error::BadSymbolName);
    }
    {
        // SAFETY: caller owns the channel.
        let p = unsafe { &mut *ch.payload_ptr() };
        p.request = RequestKind::Dlsym as u32;
        p.symbol_name[..bytes.len()].copy_from_slice(bytes);
        p.symbol_name[bytes.len()] = 0;
    }
    crate::call::begin_request(ch)?;
    ch.wait_for(ChannelState::Response)
        .map_err(|_| Error::SandboxDead)?;
    let addr = unsafe { (*ch.payload_ptr()).symbol_addr };
    crate::call::finish_response(ch);
    Ok(addr)
}

fn spawn_guest(
    executable: &Path,
    control_fd: BorrowedFd<'_>,
    guest_sock: BorrowedFd<'_>,
) -> Result<libc::pid_t> {
    let path = CString::new(executable.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath)?;
    let shm_arg =
        CString::new(control_fd.as_raw_fd().to_string()).map_err(|_| Error::InvalidPath)?;
    let sock_arg =
        CString::new(guest_sock.as_raw_fd().to_string()).map_err(|_| Error::InvalidPath)?;

    // SAFETY: between fork and exec the child only makes async-signal-safe
    // calls (close_range, fcntl, execv, _exit).
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Fork(last_errno()));
    }
    if pid == 0 {
        // Child: leak nothing but the two fds the guest is told about.
        mark_fds_cloexec(3);
        unsafe {
            libc::fcntl(control_fd.as_raw_fd(), libc::F_SETFD, 0);
            libc::fcntl(guest_sock.as_raw_fd(), libc::F_SETFD, 0);

            let argv = [
                path.as_ptr(),
                shm_arg.as_ptr(),
                sock_arg.as_ptr(),
                std::ptr::null(),
            ];
            libc::execv(path.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }
    }
    Ok(pid)
}

fn spawn_watcher(
    pid: libc::pid_t,
    control: Arc<ChannelMapping>,
    registry: Arc<Mutex<Vec<Weak<ChannelMapping>>>>,
    destroying: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("crossbox-watcher".into())
        .spawn(move || {
            let mut status = 0;
            // SAFETY: waiting on our own child.
            unsafe { libc::waitpid(pid, &mut status, 0) };

            if !destroying.load(Ordering::Acquire) {
                if libc::WIFSIGNALED(status) {
                    let signal = libc::WTERMSIG(status);
                    if signal == libc::SIGSYS {
                        tracing::error!(pid, signal, "sandbox killed by seccomp violation");
                    } else {
                        tracing::error!(pid, signal, "sandbox killed by signal");
                    }
                } else if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
                    tracing::error!(
                        pid,
                        status = libc::WEXITSTATUS(status),
                        "sandbox exited with nonzero status"
                    );
                }
            }

            // Poison every channel so blocked callers observe Dead instead
            // of hanging.
            control.channel().set_state(ChannelState::Dead);
            for weak in registry.lock().unwrap().iter() {
                if let Some(mapping) = weak.upgrade() {
                    mapping.channel().set_state(ChannelState::Dead);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbox_shm::ChannelState;

    #[test]
    fn dlsym_rejects_bad_names() {
        let mapping = ChannelMapping::create(c"crossbox-test").unwrap();
        let long = "x".repeat(MAX_SYMBOL_NAME);
        assert!(matches!(
            dlsym_on(mapping.channel(), &long),
            Err(Error::BadSymbolName)
        ));
        assert!(matches!(
            dlsym_on(mapping.channel(), "bad\0name"),
            Err(Error::BadSymbolName)
        ));
    }

    #[test]
    fn dlsym_observes_death() {
        let mapping = ChannelMapping::create(c"crossbox-test").unwrap();
        mapping.channel().set_state(ChannelState::Dead);
        assert!(matches!(
            dlsym_on(mapping.channel(), "malloc"),
            Err(Error::SandboxDead)
        ));
    }

    #[test]
    fn create_fails_cleanly_for_missing_executable() {
        // exec fails in the child (exit 127); the watcher poisons the
        // control channel and bootstrap surfaces the death.
        let err = Sandbox::create("/nonexistent/crossbox-guest").unwrap_err();
        assert!(matches!(err, Error::SandboxDead));
    }
}
