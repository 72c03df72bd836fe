//! Byte-wide table side channel: a probe array of 256 lines, one per byte value,
//! and the reload classifier that recovers which line was brought back into the
//! cache.

use crate::{CacheStatus, HardwareTimingSource, SideChannelError};

use cache_utils::calibration::Threshold;
use cache_utils::mmap::MMappedMemory;


/// One probe line per byte value.
pub const PROBE_ENTRIES: usize = 256;
pub const DEFAULT_STRIDE: usize = 512;
/// Every probe byte holds this value, so the lines are backed by real pages.
pub const PROBE_FILL: u8 = 0x01;

pub const DEFAULT_REPETITIONS: u32 = 100;
pub const DEFAULT_HIT_THRESHOLD: Threshold = Threshold::at_most(80);

/// Checks that a stride puts every probe entry on its own cache line.
pub fn validate_stride(stride: usize, line: usize) -> Result<(), SideChannelError> {
    if line == 0 || stride < line || stride % line != 0 {
        return Err(SideChannelError::InvalidStride { stride, line });
    }
    Ok(())
}

/// Visiting order of the probe indices, defeats the stride prefetcher.
/// 167 is odd, so this is a permutation of the byte values.
pub fn mix(i: u8) -> u8 {
    i.wrapping_mul(167).wrapping_add(13)
}

/// Address arithmetic of a probe array, detached from the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLayout {
    base: usize,
    stride: usize,
}

impl ProbeLayout {
    /// The probe index whose entry contains `p`.
    pub fn index_of(&self, p: *const u8) -> Option<u8> {
        let offset = (p as usize).checked_sub(self.base)?;
        let index = offset / self.stride;
        if index < PROBE_ENTRIES {
            Some(index as u8)
        } else {
            None
        }
    }

    pub fn entry(&self, index: u8) -> *const u8 {
        (self.base + index as usize * self.stride) as *const u8
    }
}

/// `256 * stride` bytes in one anonymous mapping.
#[derive(Debug)]
pub struct ProbeArray {
    memory: MMappedMemory,
    stride: usize,
}

impl ProbeArray {
    pub fn new(stride: usize, line: usize) -> Result<ProbeArray, SideChannelError> {
        validate_stride(stride, line)?;
        let memory = MMappedMemory::try_new(PROBE_ENTRIES * stride, |_| PROBE_FILL)
            .map_err(SideChannelError::Allocation)?;
        log::debug!(
            "probe array at {:p}, {} entries of {} bytes",
            memory.as_ptr(),
            PROBE_ENTRIES,
            stride
        );
        Ok(ProbeArray { memory, stride })
    }

    pub fn entry(&self, index: u8) -> *const u8 {
        self.layout().entry(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = *const u8> + '_ {
        (0..=u8::MAX).map(move |i| self.entry(i))
    }

    pub fn index_of(&self, p: *const u8) -> Option<u8> {
        self.layout().index_of(p)
    }

    pub fn layout(&self) -> ProbeLayout {
        ProbeLayout {
            base: self.memory.as_ptr() as usize,
            stride: self.stride,
        }
    }

    /// Restores every byte to `PROBE_FILL`.
    pub fn reset(&mut self) {
        self.memory.fill_with(|_| PROBE_FILL);
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.memory.slice()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSample {
    pub probe_index: u8,
    pub elapsed_cycles: u64,
}

impl TimingSample {
    pub fn status(&self, threshold: &Threshold) -> CacheStatus {
        if threshold.is_hit(self.elapsed_cycles) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeParams {
    pub repetitions: u32,
    pub threshold: Threshold,
}

impl Default for ProbeParams {
    fn default() -> Self {
        ProbeParams {
            repetitions: DEFAULT_REPETITIONS,
            threshold: DEFAULT_HIT_THRESHOLD,
        }
    }
}

/// Hit counts per probe index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitTally {
    hits: [u32; PROBE_ENTRIES],
}

impl Default for HitTally {
    fn default() -> Self {
        HitTally {
            hits: [0; PROBE_ENTRIES],
        }
    }
}

impl HitTally {
    pub fn record(&mut self, sample: TimingSample, threshold: &Threshold) {
        if sample.status(threshold) == CacheStatus::Hit {
            self.hits[sample.probe_index as usize] += 1;
        }
    }

    pub fn add(&mut self, index: u8, hits: u32) {
        self.hits[index as usize] += hits;
    }

    pub fn get(&self, index: u8) -> u32 {
        self.hits[index as usize]
    }

    pub fn total(&self) -> u64 {
        self.hits.iter().map(|&h| h as u64).sum()
    }

    /// Picks the index with the most hits. Scans in ascending order, an index
    /// only takes the lead with strictly more hits, and a tie with the leader
    /// becomes the runner-up.
    pub fn classify(&self) -> ClassificationResult {
        let mut recovered_byte = 0u8;
        let mut best_hits = 0u32;
        let mut runner_up_hits = 0u32;
        for (i, &hits) in self.hits.iter().enumerate() {
            if hits > best_hits {
                runner_up_hits = best_hits;
                best_hits = hits;
                recovered_byte = i as u8;
            } else if hits > runner_up_hits {
                runner_up_hits = hits;
            }
        }
        ClassificationResult {
            recovered_byte,
            confidence: best_hits as i32 - runner_up_hits as i32,
            best_hits,
            runner_up_hits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationResult {
    pub recovered_byte: u8,
    /// `best_hits - runner_up_hits`, never negative.
    pub confidence: i32,
    pub best_hits: u32,
    pub runner_up_hits: u32,
}

/// Times every probe entry `params.repetitions` times and classifies the
/// hits. Does not flush anything, the caller evicts beforehand.
pub fn probe_cache<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    probe: &ProbeArray,
    params: &ProbeParams,
) -> ClassificationResult {
    let mut tally = HitTally::default();
    for _ in 0..params.repetitions {
        for i in 0..=u8::MAX {
            let probe_index = mix(i);
            let elapsed_cycles = unsafe { source.time_access(probe.entry(probe_index)) };
            tally.record(
                TimingSample {
                    probe_index,
                    elapsed_cycles,
                },
                &params.threshold,
            );
        }
    }
    let result = tally.classify();
    log::debug!(
        "probe: {:#04x} with {} hits, runner-up {}, {} hits total",
        result.recovered_byte,
        result.best_hits,
        result.runner_up_hits,
        tally.total()
    );
    result
}
