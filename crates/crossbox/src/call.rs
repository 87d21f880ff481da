//! Host half of the dynamic call engine.
//!
//! Calls carry signatures known only at runtime: each argument is a tagged
//! value memcpy'd into the channel's inline buffer at a running offset, and
//! the guest rebuilds argument pointers from the recorded offsets before
//! invoking the target through libffi. Nothing is cached between calls;
//! registered callbacks are the exception and cache their call interface at
//! registration.
//!
//! While a call is in flight the host's wait loop also services `Callback`
//! transitions, which is what makes re-entrant upcalls work: the guest
//! worker that executes the call may invoke a host closure, and the closure
//! runs on the calling host thread, on the same channel, before the call's
//! response arrives.

use crossbox_shm::{
    futex_wait, Channel, ChannelState, RequestKind, TypeTag, ARG_STORAGE, MAX_ARGS,
};

use crate::callback::dispatch_callback;
use crate::channels;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxInner};

/// A tagged argument value for a dynamic call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    /// A guest-domain or identity-mapped address.
    Ptr(u64),
}

impl Arg {
    pub fn tag(&self) -> TypeTag {
        match self {
            Arg::U8(_) => TypeTag::U8,
            Arg::I8(_) => TypeTag::I8,
            Arg::U16(_) => TypeTag::U16,
            Arg::I16(_) => TypeTag::I16,
            Arg::U32(_) => TypeTag::U32,
            Arg::I32(_) => TypeTag::I32,
            Arg::U64(_) => TypeTag::U64,
            Arg::I64(_) => TypeTag::I64,
            Arg::F32(_) => TypeTag::F32,
            Arg::F64(_) => TypeTag::F64,
            Arg::Ptr(_) => TypeTag::Pointer,
        }
    }

    fn write(&self, out: &mut [u8]) {
        match *self {
            Arg::U8(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::I8(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::U16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::I16(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::U32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::I32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::U64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::I64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::F32(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::F64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Arg::Ptr(v) => out.copy_from_slice(&v.to_ne_bytes()),
        }
    }
}

/// A tagged return value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Void,
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(u64),
}

fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl Value {
    pub(crate) fn read(tag: TypeTag, bytes: &[u8]) -> Value {
        match tag {
            TypeTag::Void => Value::Void,
            TypeTag::U8 => Value::U8(u8::from_ne_bytes(take(bytes))),
            TypeTag::I8 => Value::I8(i8::from_ne_bytes(take(bytes))),
            TypeTag::U16 => Value::U16(u16::from_ne_bytes(take(bytes))),
            TypeTag::I16 => Value::I16(i16::from_ne_bytes(take(bytes))),
            TypeTag::U32 => Value::U32(u32::from_ne_bytes(take(bytes))),
            TypeTag::I32 => Value::I32(i32::from_ne_bytes(take(bytes))),
            TypeTag::U64 => Value::U64(u64::from_ne_bytes(take(bytes))),
            TypeTag::I64 => Value::I64(i64::from_ne_bytes(take(bytes))),
            TypeTag::F32 => Value::F32(f32::from_ne_bytes(take(bytes))),
            TypeTag::F64 => Value::F64(f64::from_ne_bytes(take(bytes))),
            TypeTag::Pointer => Value::Ptr(u64::from_ne_bytes(take(bytes))),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// The address for `Pointer`-tagged results.
    pub fn as_ptr(&self) -> Option<u64> {
        match *self {
            Value::Ptr(v) => Some(v),
            _ => None,
        }
    }
}

impl Sandbox {
    /// Call a guest function with a runtime-described signature.
    ///
    /// `func` is a guest-domain address, usually from [`Sandbox::dlsym`].
    /// The call blocks until the guest responds; host callbacks invoked by
    /// the guest during the call are dispatched on this thread before the
    /// call returns. A guest that dies mid-call yields
    /// [`Error::SandboxDead`] rather than a hang.
    pub fn call(&self, func: u64, ret: TypeTag, args: &[Arg]) -> Result<Value> {
        let tch = channels::thread_channel(&self.inner)?;
        call_on(&self.inner, tch.channel(), func, ret, args)
    }
}

pub(crate) fn call_on(
    inner: &SandboxInner,
    ch: &Channel,
    func: u64,
    ret: TypeTag,
    args: &[Arg],
) -> Result<Value> {
    if args.len() > MAX_ARGS {
        return Err(Error::TooManyArgs(args.len()));
    }

    {
        // SAFETY: the channel is Idle (or handed back to us inside a
        // callback), so this side owns the payload.
        let p = unsafe { &mut *ch.payload_ptr() };
        p.request = RequestKind::Call as u32;
        p.func_addr = func;
        p.nargs = args.len() as u32;
        p.ret_type = ret as u32;

        let mut offset = 0usize;
        for (i, arg) in args.iter().enumerate() {
            let size = arg.tag().size();
            if offset + size > ARG_STORAGE {
                return Err(Error::ArgOverflow);
            }
            p.arg_types[i] = arg.tag() as u32;
            p.arg_offsets[i] = offset as u64;
            arg.write(&mut p.arg_storage.0[offset..offset + size]);
            offset += size;
        }
    }

    begin_request(ch)?;
    wait_for_response(inner, ch)?;

    let value = {
        // SAFETY: Response observed, we own the channel again.
        let p = unsafe { &*ch.payload_ptr() };
        Value::read(ret, &p.result_storage.0)
    };
    finish_response(ch);
    Ok(value)
}

/// Publish a request: `Idle -> Request` at top level, `Callback -> Request`
/// when issued from inside a callback (nested calls, and the host handing a
/// callback result back). A compare-and-swap so the watcher's `Dead` poison
/// is never overwritten.
pub(crate) fn begin_request(ch: &Channel) -> Result<()> {
    if ch
        .transition(ChannelState::Idle, ChannelState::Request)
        .is_ok()
    {
        return Ok(());
    }
    ch.transition(ChannelState::Callback, ChannelState::Request)
        .map_err(|_| Error::SandboxDead)
}

/// Reclaim a responded channel. If the watcher poisoned it in the meantime,
/// the poison stays.
pub(crate) fn finish_response(ch: &Channel) {
    let _ = ch.transition(ChannelState::Response, ChannelState::Idle);
}

/// Wait for the guest's response, servicing callback upcalls in between.
fn wait_for_response(inner: &SandboxInner, ch: &Channel) -> Result<()> {
    loop {
        let state = ch.load_state();
        if state == ChannelState::Response as u32 {
            return Ok(());
        }
        if state == ChannelState::Callback as u32 {
            dispatch_callback(inner, ch);
            continue;
        }
        if state == ChannelState::Dead as u32 {
            return Err(Error::SandboxDead);
        }
        futex_wait(ch.state_word(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbox_shm::Channel;

    #[test]
    fn arg_tags() {
        assert_eq!(Arg::U8(1).tag(), TypeTag::U8);
        assert_eq!(Arg::F64(1.0).tag(), TypeTag::F64);
        assert_eq!(Arg::Ptr(0xdead).tag(), TypeTag::Pointer);
    }

    #[test]
    fn value_round_trips_every_tag() {
        let args = [
            Arg::U8(0xab),
            Arg::I8(-5),
            Arg::U16(0xbeef),
            Arg::I16(-12345),
            Arg::U32(0xdead_beef),
            Arg::I32(-100_000),
            Arg::U64(u64::MAX - 1),
            Arg::I64(i64::MIN + 1),
            Arg::F32(1.5),
            Arg::F64(-2.25e300),
            Arg::Ptr(0x7000_0000_0000),
        ];
        let expected = [
            Value::U8(0xab),
            Value::I8(-5),
            Value::U16(0xbeef),
            Value::I16(-12345),
            Value::U32(0xdead_beef),
            Value::I32(-100_000),
            Value::U64(u64::MAX - 1),
            Value::I64(i64::MIN + 1),
            Value::F32(1.5),
            Value::F64(-2.25e300),
            Value::Ptr(0x7000_0000_0000),
        ];
        let mut buf = [0u8; 8];
        for (arg, want) in args.iter().zip(expected) {
            let size = arg.tag().size();
            arg.write(&mut buf[..size]);
            assert_eq!(Value::read(arg.tag(), &buf), want);
        }
    }

    #[test]
    fn marshalling_packs_at_running_offsets() {
        // Pack into a real channel payload and verify what the guest would
        // see: tags, offsets, and the bytes at those offsets.
        let ch = Channel::new_boxed();
        let args = [Arg::I32(7), Arg::F64(0.5), Arg::U8(9)];

        let p = unsafe { &mut *ch.payload_ptr() };
        let mut offset = 0usize;
        for (i, arg) in args.iter().enumerate() {
            let size = arg.tag().size();
            p.arg_types[i] = arg.tag() as u32;
            p.arg_offsets[i] = offset as u64;
            arg.write(&mut p.arg_storage.0[offset..offset + size]);
            offset += size;
        }

        assert_eq!(&p.arg_offsets[..3], &[0, 4, 12]);
        assert_eq!(&p.arg_storage.0[0..4], &7i32.to_ne_bytes());
        assert_eq!(&p.arg_storage.0[4..12], &0.5f64.to_ne_bytes());
        assert_eq!(p.arg_storage.0[12], 9);

        // Argument independence: rewriting one slot leaves the others.
        Arg::I32(8).write(&mut p.arg_storage.0[0..4]);
        assert_eq!(&p.arg_storage.0[4..12], &0.5f64.to_ne_bytes());
        assert_eq!(p.arg_storage.0[12], 9);
    }
}
