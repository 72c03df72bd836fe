#![allow(clippy::missing_safety_doc)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::arch::x86_64 as arch_x86;
use core::hint::black_box;
use core::ptr;

use lazy_static::lazy_static;

pub mod cache_info;
pub mod calibration;
pub mod mmap;

lazy_static! {
    /// Size of a base page on the host, 4096 when sysconf cannot tell.
    pub static ref PAGE_SIZE: usize = {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            calibration::PAGE_LEN
        }
    };
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

// rdtsc no fence
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}
// rdtsc (has mfence before and after)
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe { arch_x86::_mm_mfence() };
    let tsc: u64 = unsafe { arch_x86::_rdtsc() };
    unsafe { arch_x86::_mm_mfence() };
    tsc
}

// rdtscp waits for earlier instructions, lfence keeps later ones from starting early
pub unsafe fn rdtscp_fence() -> u64 {
    let mut aux = 0u32;
    let tsc = unsafe { arch_x86::__rdtscp(&mut aux) };
    unsafe { arch_x86::_mm_lfence() };
    tsc
}

pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

// flush (cflush)
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}

/// Busy wait for `iterations` loop turns. Never yields.
pub fn spin(iterations: u64) {
    let mut i = 0u64;
    while black_box(i) < iterations {
        i += 1;
    }
}

/// Busy wait until `d` TSC cycles have elapsed. Never yields.
pub fn delay(d: u64) {
    wait_elapsed(d, || unsafe { rdtsc_nofence() });
}

// The counter may wrap between the two reads.
fn wait_elapsed(d: u64, mut clock: impl FnMut() -> u64) {
    let start = clock();
    while clock().wrapping_sub(start) < d {
        core::hint::spin_loop();
    }
}
