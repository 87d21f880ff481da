//! Host-side error taxonomy.
//!
//! Setup failures carry the OS error; protocol-level failures are variants of
//! their own. The runtime never propagates errors across the isolation
//! boundary: a guest-side failure is observed either as a value in the
//! response (null pointer, negative return) or as the `Dead` channel state.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

use crossbox_shm::MAX_ARGS;

#[derive(Debug, Error)]
pub enum Error {
    #[error("memfd: {0}")]
    Memfd(Errno),

    #[error("mmap: {0}")]
    Mmap(Errno),

    #[error("fork: {0}")]
    Fork(Errno),

    #[error("invalid sandbox executable path")]
    InvalidPath,

    #[error("watcher thread: {0}")]
    Watcher(io::Error),

    #[error("fd passing: {0}")]
    FdPass(io::Error),

    #[error("invalid fd: {0}")]
    InvalidFd(i32),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("symbol name too long or not C-compatible")]
    BadSymbolName,

    #[error("sandbox died")]
    SandboxDead,

    #[error("too many arguments: {0} (max {MAX_ARGS})")]
    TooManyArgs(usize),

    #[error("arguments overflow the inline buffer")]
    ArgOverflow,

    #[error("callback limit reached")]
    CallbackLimit,

    #[error("callback signature rejected by libffi")]
    CifPrep,

    #[error("closure allocation failed in sandbox")]
    ClosureAlloc,

    #[error("sandbox allocation failed")]
    GuestAlloc,

    #[error("sandbox mmap failed")]
    GuestMmap,

    #[error("sandbox munmap failed")]
    GuestMunmap,

    #[error("sandbox close failed")]
    GuestClose,

    #[error("no address free in both address spaces")]
    NoIdentityAddress,

    #[error("identity arena exhausted")]
    ArenaExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
