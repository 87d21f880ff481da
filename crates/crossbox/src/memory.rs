//! Guest memory operations: heap calls, mmap, identity mapping, the
//! per-thread arena, and bulk transfer.
//!
//! Heap and mmap operations are ordinary dynamic calls through the guest
//! symbols cached at bootstrap. Identity mapping backs the pointer-passing
//! story: a memfd is mapped in the host, sent to the guest, and mapped there
//! at the *same* virtual address, so a pointer into the region is valid on
//! both sides. When the first-choice address is taken in the guest, both
//! address spaces' `/proc/<pid>/maps` are intersected to find a free range.

use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;

use crossbox_shm::{TypeTag, XFER_OFFSET, XFER_STORAGE};
use crossbox_sys::last_errno;

use crate::call::{call_on, Arg, Value};
use crate::channels::{self, create_memfd, Arena, ARENA_SIZE};
use crate::error::{Error, Result};
use crate::fdpass::transfer_fd;
use crate::procmaps;
use crate::sandbox::Sandbox;

/// What the guest's `mmap` returns on failure.
const GUEST_MAP_FAILED: u64 = u64::MAX;

fn page_align(len: usize) -> usize {
    (len + 4095) & !4095
}

impl Sandbox {
    /// Allocate `size` bytes in the guest heap.
    pub fn malloc(&self, size: usize) -> Result<u64> {
        let sym = self.require_sym(self.syms().malloc, "malloc")?;
        match self.call(sym, TypeTag::Pointer, &[Arg::U64(size as u64)])? {
            Value::Ptr(0) => Err(Error::GuestAlloc),
            Value::Ptr(p) => Ok(p),
            _ => Err(Error::GuestAlloc),
        }
    }

    /// `calloc(nmemb, size)` in the guest heap.
    pub fn calloc(&self, nmemb: usize, size: usize) -> Result<u64> {
        let sym = self.require_sym(self.syms().calloc, "calloc")?;
        match self.call(
            sym,
            TypeTag::Pointer,
            &[Arg::U64(nmemb as u64), Arg::U64(size as u64)],
        )? {
            Value::Ptr(0) => Err(Error::GuestAlloc),
            Value::Ptr(p) => Ok(p),
            _ => Err(Error::GuestAlloc),
        }
    }

    /// `realloc(ptr, size)` in the guest heap.
    pub fn realloc(&self, ptr: u64, size: usize) -> Result<u64> {
        let sym = self.require_sym(self.syms().realloc, "realloc")?;
        match self.call(
            sym,
            TypeTag::Pointer,
            &[Arg::Ptr(ptr), Arg::U64(size as u64)],
        )? {
            Value::Ptr(0) if size > 0 => Err(Error::GuestAlloc),
            Value::Ptr(p) => Ok(p),
            _ => Err(Error::GuestAlloc),
        }
    }

    /// Free a guest heap allocation.
    pub fn free(&self, ptr: u64) -> Result<()> {
        let sym = self.require_sym(self.syms().free, "free")?;
        self.call(sym, TypeTag::Void, &[Arg::Ptr(ptr)])?;
        Ok(())
    }

    /// `mmap` in the guest, translating a host fd (fds < 0 pass through for
    /// anonymous mappings).
    pub fn mmap(
        &self,
        addr: u64,
        len: usize,
        prot: i32,
        flags: i32,
        fd: RawFd,
        offset: i64,
    ) -> Result<u64> {
        let guest_fd = if fd >= 0 { self.send_fd(fd)? } else { fd };
        self.mmap_guest_fd(addr, len, prot, flags, guest_fd, offset)
    }

    /// `mmap` in the guest with an already-translated guest fd.
    pub fn mmap_guest_fd(
        &self,
        addr: u64,
        len: usize,
        prot: i32,
        flags: i32,
        guest_fd: RawFd,
        offset: i64,
    ) -> Result<u64> {
        match self.guest_mmap_raw(addr, len, prot, flags, guest_fd, offset)? {
            GUEST_MAP_FAILED => Err(Error::GuestMmap),
            p => Ok(p),
        }
    }

    /// `munmap` in the guest.
    pub fn munmap(&self, addr: u64, len: usize) -> Result<()> {
        let sym = self.require_sym(self.syms().munmap, "munmap")?;
        match self.call(
            sym,
            TypeTag::I32,
            &[Arg::Ptr(addr), Arg::U64(len as u64)],
        )? {
            Value::I32(0) => Ok(()),
            _ => Err(Error::GuestMunmap),
        }
    }

    /// Raw guest mmap: returns the guest's value, including `MAP_FAILED`.
    fn guest_mmap_raw(
        &self,
        addr: u64,
        len: usize,
        prot: i32,
        flags: i32,
        guest_fd: RawFd,
        offset: i64,
    ) -> Result<u64> {
        let sym = self.require_sym(self.syms().mmap, "mmap")?;
        let value = self.call(
            sym,
            TypeTag::Pointer,
            &[
                Arg::Ptr(addr),
                Arg::U64(len as u64),
                Arg::I32(prot),
                Arg::I32(flags),
                Arg::I32(guest_fd),
                Arg::I64(offset),
            ],
        )?;
        value.as_ptr().ok_or(Error::GuestMmap)
    }

    /// Best-effort close of a guest fd that was never cached.
    fn guest_close_quiet(&self, guest_fd: RawFd) {
        if self.syms().close != 0 {
            let _ = self.call(self.syms().close, TypeTag::I32, &[Arg::I32(guest_fd)]);
        }
    }

    /// Map `len` bytes of fresh shared memory at the same virtual address in
    /// both processes. The returned pointer is valid on both sides.
    pub fn map_identity(&self, len: usize, prot: i32) -> Result<*mut u8> {
        let len = page_align(len);
        self.require_sym(self.syms().mmap, "mmap")?;

        let memfd = create_memfd(c"crossbox-idmem", len)?;

        // Map in the host first, letting the kernel pick the address.
        let host_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if host_addr == libc::MAP_FAILED {
            return Err(Error::Mmap(last_errno()));
        }

        // The memfd is temporary; don't cache the translation.
        let tch = channels::thread_channel(&self.inner)?;
        let guest_fd = match transfer_fd(&self.inner, tch.channel(), memfd.as_raw_fd()) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::munmap(host_addr, len) };
                return Err(e);
            }
        };

        let fixed = libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE;
        let attempt = match self.guest_mmap_raw(host_addr as u64, len, prot, fixed, guest_fd, 0) {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { libc::munmap(host_addr, len) };
                return Err(e);
            }
        };
        if attempt == host_addr as u64 {
            self.guest_close_quiet(guest_fd);
            return Ok(host_addr.cast());
        }

        // The host's address is taken in the guest. Drop both attempts and
        // search the two address spaces for a common gap.
        if attempt != GUEST_MAP_FAILED {
            let _ = self.munmap(attempt, len);
        }
        unsafe { libc::munmap(host_addr, len) };

        let common = procmaps::find_common_free_address(
            std::process::id() as i32,
            self.inner.pid,
            len,
        );
        let Some(common) = common else {
            self.guest_close_quiet(guest_fd);
            return Err(Error::NoIdentityAddress);
        };

        let host_addr = unsafe {
            libc::mmap(
                common as *mut libc::c_void,
                len,
                prot,
                fixed,
                memfd.as_raw_fd(),
                0,
            )
        };
        if host_addr as u64 != common {
            if host_addr != libc::MAP_FAILED {
                unsafe { libc::munmap(host_addr, len) };
            }
            self.guest_close_quiet(guest_fd);
            return Err(Error::NoIdentityAddress);
        }

        let attempt = match self.guest_mmap_raw(common, len, prot, fixed, guest_fd, 0) {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { libc::munmap(host_addr, len) };
                return Err(e);
            }
        };
        if attempt != common {
            if attempt != GUEST_MAP_FAILED {
                let _ = self.munmap(attempt, len);
            }
            unsafe { libc::munmap(host_addr, len) };
            self.guest_close_quiet(guest_fd);
            return Err(Error::NoIdentityAddress);
        }

        self.guest_close_quiet(guest_fd);
        Ok(common as *mut u8)
    }

    /// Unmap identity-mapped memory on both sides.
    pub fn unmap_identity(&self, addr: *mut u8, len: usize) -> Result<()> {
        let len = page_align(len);
        let guest = self.munmap(addr as u64, len);
        let host_ok = unsafe { libc::munmap(addr.cast(), len) } == 0;
        guest?;
        if !host_ok {
            return Err(Error::Mmap(last_errno()));
        }
        Ok(())
    }

    /// Bump-allocate from the calling thread's identity arena. The region is
    /// identity-mapped lazily on first use; allocations are 16-byte aligned
    /// and freed together by [`Sandbox::arena_reset`] at the end of a call
    /// scope, making in/out parameter marshalling allocation-free once warm.
    pub fn arena_alloc(&self, size: usize) -> Result<*mut u8> {
        let tch = channels::thread_channel(&self.inner)?;
        if tch.arena.borrow().is_none() {
            let base = self.map_identity(ARENA_SIZE, libc::PROT_READ | libc::PROT_WRITE)?;
            let base = NonNull::new(base).ok_or(Error::NoIdentityAddress)?;
            *tch.arena.borrow_mut() = Some(Arena {
                base,
                size: ARENA_SIZE,
                offset: 0,
            });
        }
        let mut slot = tch.arena.borrow_mut();
        match slot.as_mut() {
            Some(arena) => arena.bump(size),
            None => Err(Error::ArenaExhausted),
        }
    }

    /// Reset the calling thread's identity arena, releasing every
    /// [`Sandbox::arena_alloc`] at once. No-op if the thread has no arena.
    pub fn arena_reset(&self) {
        if let Some(tch) = channels::peek_thread_channel(&self.inner) {
            if let Some(arena) = tch.arena.borrow_mut().as_mut() {
                arena.offset = 0;
            }
        }
    }

    /// Copy bytes into guest memory at `dest` through the channel's staging
    /// buffer and the guest's `memcpy`.
    pub fn copy_to(&self, dest: u64, src: &[u8]) -> Result<()> {
        let memcpy = self.require_sym(self.syms().memcpy, "memcpy")?;
        let tch = channels::thread_channel(&self.inner)?;
        let ch = tch.channel();
        let guest_staging = ch.guest_addr() + XFER_OFFSET as u64;

        let mut dest = dest;
        for chunk in src.chunks(XFER_STORAGE) {
            {
                // SAFETY: channel is Idle between calls; we own the payload.
                let p = unsafe { &mut *ch.payload_ptr() };
                p.xfer_storage.0[..chunk.len()].copy_from_slice(chunk);
            }
            call_on(
                &self.inner,
                ch,
                memcpy,
                TypeTag::Pointer,
                &[
                    Arg::Ptr(dest),
                    Arg::Ptr(guest_staging),
                    Arg::U64(chunk.len() as u64),
                ],
            )?;
            dest += chunk.len() as u64;
        }
        Ok(())
    }

    /// Copy bytes out of guest memory at `src`.
    pub fn copy_from(&self, dest: &mut [u8], src: u64) -> Result<()> {
        let memcpy = self.require_sym(self.syms().memcpy, "memcpy")?;
        let tch = channels::thread_channel(&self.inner)?;
        let ch = tch.channel();
        let guest_staging = ch.guest_addr() + XFER_OFFSET as u64;

        let mut src = src;
        for chunk in dest.chunks_mut(XFER_STORAGE) {
            call_on(
                &self.inner,
                ch,
                memcpy,
                TypeTag::Pointer,
                &[
                    Arg::Ptr(guest_staging),
                    Arg::Ptr(src),
                    Arg::U64(chunk.len() as u64),
                ],
            )?;
            {
                // SAFETY: the call above returned the channel to Idle.
                let p = unsafe { &*ch.payload_ptr() };
                chunk.copy_from_slice(&p.xfer_storage.0[..chunk.len()]);
            }
            src += chunk.len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 4096);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(4097), 8192);
    }

    #[test]
    fn guest_map_failed_is_all_ones() {
        // The guest returns mmap's MAP_FAILED ((void *)-1) verbatim.
        assert_eq!(GUEST_MAP_FAILED, (-1i64) as u64);
    }
}
