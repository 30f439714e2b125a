use std::ffi::c_void;

/// crc32("hyperfs") - identifies our hypercalls among everything else
/// sharing the trap mechanism. Part of the guest/host ABI.
pub const HYPERFS_MAGIC: u32 = 0x51ec_3692;

// Hypercall numbers, shared with the host-side dispatcher.
pub const HC_FILE_OP: u64 = 0;
pub const HC_GET_NUM_HYPERFILES: u64 = 1;
pub const HC_GET_HYPERFILE_PATHS: u64 = 2;

/// Host-side handler was not ready; the same request must be reissued
/// unchanged. Far outside the negated-errno range on every supported
/// target, so it can never collide with a real host error. This is a loop
/// condition, not an error.
pub const HC_STATUS_RETRY: i64 = i32::MIN as i64;

/// One synchronous trap into the host. `args` follows the host convention:
/// an array of raw pointers whose meaning depends on `num`. The caller owns
/// all referenced memory for the duration of the call; implementations must
/// not retain pointers past return.
pub trait HypercallPort: Send + Sync {
    fn call(&self, num: u64, args: &mut [*mut c_void]) -> i64;
}

/// The real trap primitive. Blocks the calling thread for the trap's
/// duration; there is no cancellation. The exit handler restores full
/// register state apart from the return value register.
pub struct GuestPort;

impl HypercallPort for GuestPort {
    fn call(&self, num: u64, args: &mut [*mut c_void]) -> i64 {
        unsafe { raw_hypercall(HYPERFS_MAGIC, num, args.as_mut_ptr(), args.len() as u64) }
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn raw_hypercall(magic: u32, num: u64, args: *mut *mut c_void, nargs: u64) -> i64 {
    let ret: i64;
    std::arch::asm!(
        "hvc #0",
        inlateout("x0") magic as u64 => ret,
        in("x1") num,
        in("x2") args,
        in("x3") nargs,
        options(nostack),
    );
    ret
}

#[cfg(target_arch = "x86_64")]
unsafe fn raw_hypercall(magic: u32, num: u64, args: *mut *mut c_void, nargs: u64) -> i64 {
    let ret: i64;
    std::arch::asm!(
        "vmcall",
        inlateout("rax") magic as u64 => ret,
        in("rdi") num,
        in("rsi") args,
        in("rdx") nargs,
        options(nostack),
    );
    ret
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
unsafe fn raw_hypercall(_magic: u32, _num: u64, _args: *mut *mut c_void, _nargs: u64) -> i64 {
    -(libc::ENOSYS as i64)
}
