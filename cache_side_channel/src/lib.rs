#![deny(unsafe_op_in_unsafe_fn)]

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::fmt::Debug;
use thiserror::Error;

pub mod table_side_channel;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Error)]
pub enum SideChannelError {
    #[error("no usable cycle counter: missing {0}")]
    CounterUnavailable(String),
    #[error("probe stride {stride} is not a multiple of the {line} byte cache line")]
    InvalidStride { stride: usize, line: usize },
    #[error("failed to map probe array: {0}")]
    Allocation(#[source] nix::Error),
    #[error("failed to change cpu affinity: {0}")]
    Affinity(#[source] nix::Error),
}

/// The hardware the channel runs on: a way to evict a line, a cycle counter,
/// and memory accesses.
///
/// The native backend maps these onto `clflush`, `rdtscp` and volatile loads.
/// Synthetic backends replace all of them with a deterministic clock so that
/// classification can be tested without hardware noise.
pub trait HardwareTimingSource: Debug {
    /// Evicts the cache line holding `p`.
    ///
    /// # Safety
    ///
    /// `p` must be a valid pointer to read.
    unsafe fn flush_line(&mut self, p: *const u8);

    /// Reads the cycle counter. Monotonic.
    fn read_cycles(&mut self) -> u64;

    /// Loads `p` without timing it.
    ///
    /// # Safety
    ///
    /// `p` must be a valid pointer to read.
    unsafe fn touch(&mut self, p: *const u8);

    /// Cycles taken by one load of `p`, bracketed by two counter reads.
    ///
    /// # Safety
    ///
    /// `p` must be a valid pointer to read.
    unsafe fn time_access(&mut self, p: *const u8) -> u64 {
        let t = self.read_cycles();
        unsafe { self.touch(p) };
        self.read_cycles().wrapping_sub(t)
    }

    /// Spins until at least `cycles` have elapsed on this source's counter.
    fn wait_cycles(&mut self, cycles: u64) {
        let start = self.read_cycles();
        while self.read_cycles().wrapping_sub(start) < cycles {
            std::hint::spin_loop();
        }
    }
}

impl<T: HardwareTimingSource + ?Sized> HardwareTimingSource for &mut T {
    unsafe fn flush_line(&mut self, p: *const u8) {
        unsafe { (**self).flush_line(p) }
    }

    fn read_cycles(&mut self) -> u64 {
        (**self).read_cycles()
    }

    unsafe fn touch(&mut self, p: *const u8) {
        unsafe { (**self).touch(p) }
    }

    unsafe fn time_access(&mut self, p: *const u8) -> u64 {
        unsafe { (**self).time_access(p) }
    }

    fn wait_cycles(&mut self, cycles: u64) {
        (**self).wait_cycles(cycles)
    }
}

pub fn restore_affinity(cpu_set: &CpuSet) -> Result<(), SideChannelError> {
    sched_setaffinity(Pid::from_raw(0), cpu_set).map_err(SideChannelError::Affinity)
}

#[must_use = "This result must be used to restore affinity"]
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, SideChannelError> {
    let old = sched_getaffinity(Pid::from_raw(0)).map_err(SideChannelError::Affinity)?;
    sched_setaffinity(Pid::from_raw(0), cpu_set).map_err(SideChannelError::Affinity)?;
    Ok(old)
}

/// Pins the calling thread to `core`, or to the first allowed core when `None`.
/// Returns the core used and the previous affinity mask.
#[must_use = "This result must be used to restore affinity"]
pub fn pin_to_core(core: Option<usize>) -> Result<(usize, CpuSet), SideChannelError> {
    let allowed = sched_getaffinity(Pid::from_raw(0)).map_err(SideChannelError::Affinity)?;
    let core = match core {
        Some(c) => c,
        None => (0..CpuSet::count())
            .find(|&i| allowed.is_set(i).unwrap_or(false))
            .ok_or(SideChannelError::Affinity(nix::Error::EINVAL))?,
    };
    let mut target = CpuSet::new();
    target.set(core).map_err(SideChannelError::Affinity)?;
    let old = set_affinity(&target)?;
    Ok((core, old))
}
