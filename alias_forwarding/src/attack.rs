use crate::alias::AliasedPair;
use cache_side_channel::table_side_channel::ProbeArray;
use cache_side_channel::HardwareTimingSource;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

/// Stores `secret` through the store address, immediately loads through the
/// aliased load address, and touches the probe entry of whatever byte the load
/// returned. If the load was forwarded the store's data, the secret's probe
/// line ends up cached.
pub fn attack<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    pair: &AliasedPair,
    probe: &ProbeArray,
    secret: u8,
) {
    unsafe {
        ptr::write_volatile(pair.store_addr(), secret);
        let loaded = ptr::read_volatile(pair.load_addr());
        source.touch(probe.entry(loaded));
    }
    compiler_fence(Ordering::SeqCst);
}
