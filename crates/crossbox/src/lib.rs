//! crossbox: call into untrusted native libraries from an isolated process.
//!
//! A [`Sandbox`] forks and execs a guest executable (built on
//! `crossbox-guest`) that loads the untrusted library under a restrictive
//! seccomp policy. Host threads then issue function calls into the guest as
//! if the library were loaded in-process; the runtime marshals arguments and
//! return values over per-thread shared-memory channels and translates
//! pointers, file descriptors and callback identities between the two
//! address spaces.
//!
//! ## Quick start
//!
//! ```ignore
//! use crossbox::{Arg, Sandbox, TypeTag};
//!
//! let sandbox = Sandbox::create("./my-guest")?;
//! let add = sandbox.dlsym("add")?;
//! let sum = sandbox.call(add, TypeTag::I32, &[Arg::I32(2), Arg::I32(3)])?;
//! assert_eq!(sum.as_i32(), Some(5));
//! ```
//!
//! ## Concurrency
//!
//! Every host thread that calls into the sandbox gets its own channel paired
//! with a dedicated guest worker thread, so calls from different threads run
//! truly in parallel inside the guest. Calls from one thread are ordered;
//! calls from different threads are not. The only blocking operation is the
//! futex wait for the peer's state transition; there are no timeouts, and a
//! hung guest is detected by the death watcher when the process dies.
//!
//! ## Pointers
//!
//! Pointer arguments must reference memory visible to the guest: either
//! guest allocations ([`Sandbox::malloc`] and friends, with
//! [`Sandbox::copy_to`]/[`Sandbox::copy_from`] for the bytes) or
//! identity-mapped memory ([`Sandbox::map_identity`],
//! [`Sandbox::arena_alloc`]) which is valid at the same address in both
//! processes.

mod call;
mod callback;
mod channels;
mod error;
mod fdpass;
mod memory;
mod procmaps;
mod sandbox;

pub use call::{Arg, Value};
pub use error::{Error, Result};
pub use sandbox::Sandbox;

pub use crossbox_shm::TypeTag;
