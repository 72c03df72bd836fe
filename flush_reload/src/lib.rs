#![deny(unsafe_op_in_unsafe_fn)]

pub mod synthetic;

use cache_side_channel::{HardwareTimingSource, SideChannelError};
use cache_utils::{delay, flush, maccess, rdtscp_fence};
use cpuid::Features;

/// Flush+reload on the host: `clflush` to evict, `rdtscp` to time, volatile
/// loads to access.
#[derive(Debug)]
pub struct NativeTimingSource {
    features: Features,
}

impl NativeTimingSource {
    pub fn new() -> Result<NativeTimingSource, SideChannelError> {
        Self::with_features(Features::detect())
    }

    pub fn with_features(features: Features) -> Result<NativeTimingSource, SideChannelError> {
        let missing = features.missing_for_timing();
        if !missing.is_empty() {
            return Err(SideChannelError::CounterUnavailable(missing.join(", ")));
        }
        if !features.invariant_tsc {
            log::warn!("TSC is not invariant, cycle counts may drift with frequency changes");
        }
        Ok(NativeTimingSource { features })
    }

    pub fn features(&self) -> &Features {
        &self.features
    }
}

impl HardwareTimingSource for NativeTimingSource {
    unsafe fn flush_line(&mut self, p: *const u8) {
        unsafe { flush(p) }
    }

    fn read_cycles(&mut self) -> u64 {
        unsafe { rdtscp_fence() }
    }

    unsafe fn touch(&mut self, p: *const u8) {
        unsafe { maccess(p) }
    }

    fn wait_cycles(&mut self, cycles: u64) {
        delay(cycles)
    }
}
