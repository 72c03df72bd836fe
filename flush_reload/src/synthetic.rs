//! Deterministic timing sources. Nothing here touches real cache state, the
//! clock only advances when the channel reads it or times an access.

use cache_side_channel::HardwareTimingSource;
use std::collections::HashSet;
use std::fmt;

/// Every timed access asks `script` for its latency.
///
/// Untimed touches and flushes are only counted. The clock advances by `tick`
/// on every read and by the scripted latency on every timed access.
pub struct ScriptedTimingSource<F: FnMut(*const u8) -> u64> {
    script: F,
    tick: u64,
    now: u64,
    flushes: usize,
    touches: usize,
    timed: usize,
}

impl<F: FnMut(*const u8) -> u64> ScriptedTimingSource<F> {
    pub fn new(script: F) -> Self {
        ScriptedTimingSource {
            script,
            tick: 1,
            now: 0,
            flushes: 0,
            touches: 0,
            timed: 0,
        }
    }

    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = tick.max(1);
        self
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn touches(&self) -> usize {
        self.touches
    }

    pub fn timed(&self) -> usize {
        self.timed
    }

    pub fn now(&self) -> u64 {
        self.now
    }
}

impl<F: FnMut(*const u8) -> u64> fmt::Debug for ScriptedTimingSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTimingSource")
            .field("now", &self.now)
            .field("flushes", &self.flushes)
            .field("touches", &self.touches)
            .field("timed", &self.timed)
            .finish()
    }
}

impl<F: FnMut(*const u8) -> u64> HardwareTimingSource for ScriptedTimingSource<F> {
    unsafe fn flush_line(&mut self, _p: *const u8) {
        self.flushes += 1;
    }

    fn read_cycles(&mut self) -> u64 {
        self.now += self.tick;
        self.now
    }

    unsafe fn touch(&mut self, _p: *const u8) {
        self.touches += 1;
    }

    unsafe fn time_access(&mut self, p: *const u8) -> u64 {
        self.timed += 1;
        let latency = (self.script)(p);
        self.now += latency;
        latency
    }
}

pub const MODEL_LINE: usize = 64;
pub const MODEL_HIT_LATENCY: u64 = 40;
pub const MODEL_MISS_LATENCY: u64 = 200;

/// An ideal inclusive cache with no capacity limit: touching a line makes it
/// resident, flushing evicts it, and a timed access costs the hit or miss
/// latency and leaves the line resident.
#[derive(Debug)]
pub struct CacheModelTimingSource {
    line: usize,
    hit_latency: u64,
    miss_latency: u64,
    resident: HashSet<usize>,
    now: u64,
    flushes: usize,
    touches: usize,
    timed: usize,
}

impl Default for CacheModelTimingSource {
    fn default() -> Self {
        Self::new(MODEL_LINE, MODEL_HIT_LATENCY, MODEL_MISS_LATENCY)
    }
}

impl CacheModelTimingSource {
    pub fn new(line: usize, hit_latency: u64, miss_latency: u64) -> Self {
        CacheModelTimingSource {
            line: line.max(1),
            hit_latency,
            miss_latency,
            resident: HashSet::new(),
            now: 0,
            flushes: 0,
            touches: 0,
            timed: 0,
        }
    }

    fn line_of(&self, p: *const u8) -> usize {
        p as usize / self.line
    }

    pub fn is_resident(&self, p: *const u8) -> bool {
        self.resident.contains(&self.line_of(p))
    }

    pub fn resident_lines(&self) -> usize {
        self.resident.len()
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn touches(&self) -> usize {
        self.touches
    }

    pub fn timed(&self) -> usize {
        self.timed
    }
}

impl HardwareTimingSource for CacheModelTimingSource {
    unsafe fn flush_line(&mut self, p: *const u8) {
        self.flushes += 1;
        let line = self.line_of(p);
        self.resident.remove(&line);
    }

    fn read_cycles(&mut self) -> u64 {
        self.now += 1;
        self.now
    }

    unsafe fn touch(&mut self, p: *const u8) {
        self.touches += 1;
        let line = self.line_of(p);
        self.resident.insert(line);
    }

    unsafe fn time_access(&mut self, p: *const u8) -> u64 {
        self.timed += 1;
        let line = self.line_of(p);
        let latency = if self.resident.insert(line) {
            self.miss_latency
        } else {
            self.hit_latency
        };
        self.now += latency;
        latency
    }
}
