use cache_side_channel::table_side_channel::{ProbeParams, DEFAULT_STRIDE};
use cache_side_channel::HardwareTimingSource;
use cache_utils::cache_info::DEFAULT_CACHE_LINE_LEN;
use cache_utils::calibration::HistParams;
use cache_utils::spin;
use serde::Serialize;

pub const DEFAULT_SECRETS: [u8; 4] = [0x41, 0x58, 0x42, 0x7F];

pub const DEFAULT_OFFSET: usize = 256;
pub const DEFAULT_ATTACK_ITERATIONS: u32 = 1000;
pub const DEFAULT_CONFIDENCE_THRESHOLD: i32 = 10;
pub const DEFAULT_SPIN: u64 = 100;
pub const DEFAULT_CALIBRATION_WARNING_CONFIDENCE: i32 = 2;

/// Pause between eviction and the attack, giving the flushes time to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delay {
    /// Busy loop iterations.
    Spin(u64),
    /// Cycles on the timing source's counter.
    Cycles(u64),
}

impl Default for Delay {
    fn default() -> Self {
        Delay::Spin(DEFAULT_SPIN)
    }
}

impl Delay {
    pub fn wait<S: HardwareTimingSource + ?Sized>(&self, source: &mut S) {
        match *self {
            Delay::Spin(n) => spin(n),
            Delay::Cycles(n) => source.wait_cycles(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionOrder {
    /// Flush probe and aliased lines, then wait.
    #[default]
    FlushThenDelay,
    /// Wait, then flush right before the attack.
    DelayThenFlush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialConfig {
    /// Page offset of both aliased addresses.
    pub offset: usize,
    pub stride: usize,
    /// Cache line size the stride is checked against.
    pub line_size: usize,
    pub attack_iterations: u32,
    pub probe: ProbeParams,
    /// A trial succeeds only with a confidence strictly above this.
    pub confidence_threshold: i32,
    pub delay: Delay,
    pub eviction_order: EvictionOrder,
    /// Replace `probe.threshold` by one calibrated on the probe array.
    pub calibrate: Option<HistParams>,
    /// Warn when no completed trial got a confidence above this.
    pub calibration_warning_confidence: i32,
}

impl Default for TrialConfig {
    fn default() -> Self {
        TrialConfig {
            offset: DEFAULT_OFFSET,
            stride: DEFAULT_STRIDE,
            line_size: DEFAULT_CACHE_LINE_LEN,
            attack_iterations: DEFAULT_ATTACK_ITERATIONS,
            probe: ProbeParams::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            delay: Delay::default(),
            eviction_order: EvictionOrder::default(),
            calibrate: None,
            calibration_warning_confidence: DEFAULT_CALIBRATION_WARNING_CONFIDENCE,
        }
    }
}
