//! Scoped machine-fault guard around artifact calls.
//!
//! Compiled-artifact code is native code; a bad module can raise a
//! synchronous fault (illegal instruction, arithmetic trap, wild access)
//! instead of returning. [`catch_faults`] converts such a fault into an
//! error: it installs handlers for the fault signals, arms a thread-local
//! `sigsetjmp` recovery point, runs the closure, and restores the previous
//! signal dispositions on every exit path.
//!
//! # Safety
//!
//! - The handler only touches thread-local data and calls `siglongjmp`,
//!   both permitted in a signal context.
//! - `siglongjmp` skips Rust destructors between the recovery point and
//!   the fault. Callers keep the guarded closure free of interesting
//!   owned state; the driver passes a bare function-pointer call.
//! - A fault while no recovery point is armed re-raises with the default
//!   disposition, so unrelated crashes are not swallowed.
//! - Only one guarded call runs at a time (the driver is single-threaded),
//!   so the save/restore of previous dispositions cannot interleave.

use std::cell::UnsafeCell;

/// A machine fault caught by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

/// Signals treated as synchronous faults from artifact code.
const FAULT_SIGNALS: [libc::c_int; 4] = [libc::SIGILL, libc::SIGFPE, libc::SIGSEGV, libc::SIGBUS];

/// Fixed-size buffer for a `sigjmp_buf`. 256 bytes covers the common
/// platforms with headroom.
const JMP_BUF_SIZE: usize = 256;

unsafe extern "C" {
    // glibc exposes sigsetjmp only through this entry point; musl exports
    // both names.
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(buf: *mut u8, save_signals: libc::c_int) -> libc::c_int;
    fn siglongjmp(buf: *mut u8, val: libc::c_int) -> !;
}

struct Recovery {
    jmp_buf: [u8; JMP_BUF_SIZE],
    armed: bool,
}

impl Recovery {
    const fn new() -> Self {
        Self {
            jmp_buf: [0u8; JMP_BUF_SIZE],
            armed: false,
        }
    }
}

// UnsafeCell rather than RefCell: the signal handler must not risk a
// borrow panic.
thread_local! {
    static RECOVERY: UnsafeCell<Recovery> = const { UnsafeCell::new(Recovery::new()) };
}

unsafe extern "C" fn fault_handler(sig: libc::c_int) {
    let armed_buf = RECOVERY.with(|cell| {
        let recovery = unsafe { &mut *cell.get() };
        if recovery.armed {
            recovery.armed = false;
            Some(recovery.jmp_buf.as_mut_ptr())
        } else {
            None
        }
    });

    match armed_buf {
        Some(buf) => unsafe { siglongjmp(buf, 1) },
        None => unsafe {
            // Not ours: fall back to the default disposition and re-raise.
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        },
    }
}

/// Install the fault handler for every fault signal, returning the
/// previous dispositions for [`restore_dispositions`].
fn install_handler() -> [libc::sigaction; 4] {
    let mut previous: [libc::sigaction; 4] = unsafe { std::mem::zeroed() };
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = fault_handler as *const () as usize;
    action.sa_flags = 0;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        for (i, &sig) in FAULT_SIGNALS.iter().enumerate() {
            libc::sigaction(sig, &action, &mut previous[i]);
        }
    }
    previous
}

fn restore_dispositions(previous: &[libc::sigaction; 4]) {
    unsafe {
        for (i, &sig) in FAULT_SIGNALS.iter().enumerate() {
            libc::sigaction(sig, &previous[i], std::ptr::null_mut());
        }
    }
}

/// Run `f` with fault recovery armed.
///
/// A synchronous fault inside `f` lands back here and yields
/// `Err(Fault)`; the previous signal dispositions are restored whether or
/// not a fault occurred.
pub fn catch_faults<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    let previous = install_handler();

    // The recovery buffer lives in thread-local storage, but the
    // sigsetjmp call must sit in this frame: siglongjmp may only return
    // to a frame that is still live.
    let buf = RECOVERY.with(|cell| unsafe { (*cell.get()).jmp_buf.as_mut_ptr() });
    if unsafe { sigsetjmp(buf, 1) } != 0 {
        // A fault brought us back; the handler already disarmed.
        restore_dispositions(&previous);
        return Err(Fault);
    }

    RECOVERY.with(|cell| unsafe { (*cell.get()).armed = true });
    let result = f();
    RECOVERY.with(|cell| unsafe { (*cell.get()).armed = false });

    restore_dispositions(&previous);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_calls_pass_through() {
        assert_eq!(catch_faults(|| 7), Ok(7));
        assert_eq!(catch_faults(|| "ok".len()), Ok(2));
    }

    #[test]
    fn guard_disarms_after_use() {
        let _ = catch_faults(|| ());
        RECOVERY.with(|cell| {
            let recovery = unsafe { &*cell.get() };
            assert!(!recovery.armed);
        });
    }

    #[test]
    fn faulting_call_is_caught() {
        // A genuine wild read, as a compiled artifact gone wrong would do.
        let result = catch_faults(|| unsafe {
            let p = 0x8 as *const i32;
            std::ptr::read_volatile(p)
        });
        assert_eq!(result, Err(Fault));
    }

    #[test]
    fn guard_is_reusable_after_a_fault() {
        let _ = catch_faults(|| unsafe { std::ptr::read_volatile(0x8 as *const u8) });
        assert_eq!(catch_faults(|| 1 + 1), Ok(2));
    }
}
