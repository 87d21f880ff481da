//! Seccomp-BPF syscall policy for the guest process.
//!
//! Two filters are stacked:
//!
//! 1. [`base_filter`] is installed once by the guest's control thread before
//!    it enters its dispatch loop. It verifies the architecture (kill on
//!    mismatch), then allows the small set of syscalls the dispatch protocol
//!    and the threading runtime need. Everything else returns `ENOSYS` so
//!    library code can fail gracefully instead of dying.
//! 2. [`worker_filter`] is installed by each worker thread on top of the base
//!    filter. It returns `ENOSYS` for `clone`/`clone3` and allows everything
//!    else, deferring to the base filter. Workers therefore cannot spawn
//!    further threads; only the control thread can.
//!
//! The kernel evaluates all stacked filters and applies the strictest
//! verdict. `PR_SET_NO_NEW_PRIVS` is set once, with the base filter.

use rustix::io::Errno;

use crate::last_errno;

const SECCOMP_SET_MODE_FILTER: u32 = 1;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// BPF instruction classes and fields.
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

// seccomp_data offsets.
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e; // AUDIT_ARCH_X86_64
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7; // AUDIT_ARCH_AARCH64

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

fn errno_ret(errno: u32) -> u32 {
    SECCOMP_RET_ERRNO | (errno & 0xffff)
}

/// Emit an arch check that kills the process on mismatch.
fn push_arch_check(filter: &mut Vec<SockFilter>) {
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        AUDIT_ARCH_CURRENT,
        1,
        0,
    ));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
}

/// Emit a two-instruction allow for one syscall number.
fn push_allow(filter: &mut Vec<SockFilter>, nr: i64) {
    filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
}

/// Emit a two-instruction `ENOSYS` for one syscall number.
fn push_enosys(filter: &mut Vec<SockFilter>, nr: i64) {
    filter.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
    filter.push(SockFilter::stmt(
        BPF_RET | BPF_K,
        errno_ret(libc::ENOSYS as u32),
    ));
}

/// Syscalls the guest control thread allows for the whole process.
///
/// Memory management for the allocator and `mmap` requests; `close` and
/// `recvmsg` for fd passing; futex for the channel protocol; thread setup,
/// signals and `clone` for worker spawning; a short list of safe information
/// queries; exit.
fn base_allow_list() -> Vec<i64> {
    let mut list = vec![
        // === Memory management ===
        libc::SYS_brk,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mprotect,
        libc::SYS_mremap,
        libc::SYS_madvise,
        // === Fd passing ===
        libc::SYS_close,
        libc::SYS_recvmsg,
        // === Channel protocol and thread runtime ===
        libc::SYS_futex,
        // glibc >= 2.34 may pick futex_waitv for some condvar paths; older
        // kernels answer ENOSYS themselves.
        libc::SYS_futex_waitv,
        libc::SYS_set_tid_address,
        libc::SYS_set_robust_list,
        libc::SYS_get_robust_list,
        libc::SYS_rseq,
        // === Signals ===
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigreturn,
        libc::SYS_sigaltstack,
        // === Exit ===
        libc::SYS_exit,
        libc::SYS_exit_group,
        // === TLS / arch control ===
        libc::SYS_prctl,
        // === Safe information queries ===
        libc::SYS_getpid,
        libc::SYS_gettid,
        libc::SYS_getuid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getegid,
        libc::SYS_getrandom,
        libc::SYS_clock_gettime,
        libc::SYS_clock_getres,
        libc::SYS_clock_nanosleep,
        libc::SYS_gettimeofday,
        libc::SYS_nanosleep,
        // === Scheduler ===
        libc::SYS_sched_yield,
        libc::SYS_sched_getaffinity,
        // === Thread creation (control thread only; workers re-block it) ===
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_tgkill,
        libc::SYS_membarrier,
    ];
    #[cfg(target_arch = "x86_64")]
    list.push(libc::SYS_arch_prctl);
    list
}

/// The process-wide base filter: arch check, allow-list, default `ENOSYS`.
pub fn base_filter() -> Vec<SockFilter> {
    let allowed = base_allow_list();
    let mut filter = Vec::with_capacity(allowed.len() * 2 + 5);

    push_arch_check(&mut filter);
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
    for nr in allowed {
        push_allow(&mut filter, nr);
    }
    filter.push(SockFilter::stmt(
        BPF_RET | BPF_K,
        errno_ret(libc::ENOSYS as u32),
    ));
    filter
}

/// The per-worker filter: block `clone`/`clone3`, allow everything else.
/// The base filter (already installed) still applies underneath.
pub fn worker_filter() -> Vec<SockFilter> {
    let mut filter = Vec::with_capacity(6);
    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
    push_enosys(&mut filter, libc::SYS_clone);
    push_enosys(&mut filter, libc::SYS_clone3);
    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter
}

/// Install a seccomp filter on the current thread.
///
/// `set_no_new_privs` must be true for the first filter installed in the
/// process; stacked filters rely on the bit already being set.
///
/// # Safety
///
/// Permanently restricts syscalls for this thread (and, for the base filter,
/// shapes what the whole process may do). The filter must be a valid BPF
/// program.
pub unsafe fn install(filter: &[SockFilter], set_no_new_privs: bool) -> Result<(), Errno> {
    if set_no_new_privs {
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(last_errno());
        }
    }

    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0u32,
            &prog as *const SockFprog,
        )
    };
    if ret != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_filter_checks_arch_first() {
        let filter = base_filter();
        assert_eq!(filter[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(filter[0].k, OFFSET_ARCH);
        assert_eq!(filter[1].k, AUDIT_ARCH_CURRENT);
        assert_eq!(filter[2].k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn base_filter_defaults_to_enosys() {
        let filter = base_filter();
        let last = filter.last().unwrap();
        assert_eq!(last.code, BPF_RET | BPF_K);
        assert_eq!(last.k, errno_ret(libc::ENOSYS as u32));
    }

    fn allows(filter: &[SockFilter], nr: i64) -> bool {
        filter
            .windows(2)
            .any(|w| w[0].k == nr as u32 && w[1].k == SECCOMP_RET_ALLOW)
    }

    #[test]
    fn base_filter_allows_the_protocol() {
        let filter = base_filter();
        for nr in [
            libc::SYS_futex,
            libc::SYS_futex_waitv,
            libc::SYS_mmap,
            libc::SYS_munmap,
            libc::SYS_recvmsg,
            libc::SYS_close,
            libc::SYS_clone,
            libc::SYS_clone3,
            libc::SYS_exit_group,
        ] {
            assert!(allows(&filter, nr), "syscall {nr} missing from base filter");
        }
    }

    #[test]
    fn base_filter_omits_io_and_exec() {
        let filter = base_filter();
        for nr in [
            libc::SYS_openat,
            libc::SYS_read,
            libc::SYS_write,
            libc::SYS_execve,
            libc::SYS_socket,
            libc::SYS_sendmsg,
            libc::SYS_ptrace,
        ] {
            assert!(!allows(&filter, nr), "syscall {nr} should not be allowed");
        }
    }

    #[test]
    fn worker_filter_blocks_thread_creation_only() {
        let filter = worker_filter();
        let enosys = errno_ret(libc::ENOSYS as u32);
        let blocked: Vec<u32> = filter
            .windows(2)
            .filter(|w| w[1].k == enosys && w[1].code == (BPF_RET | BPF_K))
            .map(|w| w[0].k)
            .collect();
        assert_eq!(blocked, vec![libc::SYS_clone as u32, libc::SYS_clone3 as u32]);
        assert_eq!(filter.last().unwrap().k, SECCOMP_RET_ALLOW);
    }
}
