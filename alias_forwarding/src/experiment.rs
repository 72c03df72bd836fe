use crate::config::TrialConfig;
use crate::trial::{calibrate_threshold, run_trial, TrialOutcome};

use cache_side_channel::table_side_channel::ProbeArray;
use cache_side_channel::{HardwareTimingSource, SideChannelError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("cannot set up probe array: {0}")]
    ProbeAllocation(#[source] SideChannelError),
    #[error("cannot time cache accesses: {0}")]
    Counter(#[source] SideChannelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Vulnerable,
    NotVulnerable,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Vulnerable => write!(f, "vulnerable"),
            Verdict::NotVulnerable => write!(f, "not vulnerable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Even the best trial barely separated from noise, the hit threshold is
    /// probably wrong for this machine.
    Calibration { max_confidence: i32 },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Calibration { max_confidence } => write!(
                f,
                "best confidence was {}, the hit threshold may need calibration",
                max_confidence
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentSummary {
    /// Trials run, incomplete ones included.
    pub attempted: usize,
    pub succeeded: usize,
    pub incomplete: usize,
    /// Hit threshold the trials classified with, in cycles.
    pub threshold_cycles: u64,
    /// Hits were the accesses slower than `threshold_cycles`.
    pub miss_faster_than_hit: bool,
    pub outcomes: Vec<TrialOutcome>,
    pub warnings: Vec<Warning>,
    pub verdict: Verdict,
}

impl ExperimentSummary {
    pub fn from_outcomes(outcomes: Vec<TrialOutcome>, config: &TrialConfig) -> ExperimentSummary {
        let attempted = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.success()).count();
        let incomplete = outcomes.iter().filter(|o| o.is_incomplete()).count();

        let mut warnings = Vec::new();
        if let Some(max_confidence) = outcomes.iter().filter_map(|o| o.confidence()).max() {
            if max_confidence <= config.calibration_warning_confidence {
                let warning = Warning::Calibration { max_confidence };
                log::warn!("{}", warning);
                warnings.push(warning);
            }
        }

        let verdict = if succeeded > 0 {
            Verdict::Vulnerable
        } else {
            Verdict::NotVulnerable
        };

        ExperimentSummary {
            attempted,
            succeeded,
            incomplete,
            threshold_cycles: config.probe.threshold.cycles,
            miss_faster_than_hit: config.probe.threshold.miss_faster_than_hit,
            outcomes,
            warnings,
            verdict,
        }
    }
}

/// Runs one trial per secret byte, in order, sharing a single probe array.
pub fn run_experiment<S: HardwareTimingSource + ?Sized>(
    source: &mut S,
    config: &TrialConfig,
    secret_bytes: &[u8],
) -> Result<ExperimentSummary, ExperimentError> {
    let mut probe = ProbeArray::new(config.stride, config.line_size)
        .map_err(ExperimentError::ProbeAllocation)?;

    let mut config = config.clone();
    if let Some(hist_params) = config.calibrate {
        match calibrate_threshold(source, &probe, hist_params) {
            Some(calibration) => config.probe.threshold = calibration.threshold,
            None => log::warn!(
                "calibration failed, keeping threshold of {} cycles",
                config.probe.threshold.cycles
            ),
        }
    }

    let mut outcomes = Vec::with_capacity(secret_bytes.len());
    for &secret in secret_bytes {
        outcomes.push(run_trial(source, &mut probe, &config, secret));
    }
    let summary = ExperimentSummary::from_outcomes(outcomes, &config);
    log::info!(
        "{} / {} leaks succeeded, {} incomplete",
        summary.succeeded,
        summary.attempted,
        summary.incomplete
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SECRETS;
    use crate::trial::TrialStatus;
    use cache_side_channel::table_side_channel::{mix, PROBE_ENTRIES};
    use cache_utils::page_size;
    use flush_reload::synthetic::{CacheModelTimingSource, ScriptedTimingSource};

    fn completed(secret_byte: u8, leaked_byte: u8, confidence: i32, success: bool) -> TrialOutcome {
        TrialOutcome {
            secret_byte,
            status: TrialStatus::Completed {
                store_addr: 0x1100,
                load_addr: 0x2100,
                leaked_byte,
                confidence,
                success,
            },
        }
    }

    fn incomplete(secret_byte: u8) -> TrialOutcome {
        TrialOutcome {
            secret_byte,
            status: TrialStatus::Incomplete {
                reason: "no memory".to_string(),
            },
        }
    }

    #[test]
    fn counts_and_verdict() {
        let config = TrialConfig::default();
        let summary = ExperimentSummary::from_outcomes(
            vec![
                completed(0x41, 0x41, 50, true),
                completed(0x58, 0x00, 3, false),
                incomplete(0x42),
            ],
            &config,
        );
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.incomplete, 1);
        assert_eq!(summary.verdict, Verdict::Vulnerable);
        assert!(summary.warnings.is_empty());
        assert_eq!(summary.threshold_cycles, 80);
        assert!(!summary.miss_faster_than_hit);
    }

    #[test]
    fn low_confidence_everywhere_warns() {
        let config = TrialConfig::default();
        let summary = ExperimentSummary::from_outcomes(
            vec![completed(0x41, 0x00, 2, false), completed(0x58, 0x13, 1, false)],
            &config,
        );
        assert_eq!(summary.verdict, Verdict::NotVulnerable);
        assert_eq!(
            summary.warnings,
            vec![Warning::Calibration { max_confidence: 2 }]
        );

        let summary =
            ExperimentSummary::from_outcomes(vec![completed(0x41, 0x00, 3, false)], &config);
        assert!(summary.warnings.is_empty());
    }

    #[test]
    fn no_completed_trial_no_warning() {
        let config = TrialConfig::default();
        let summary =
            ExperimentSummary::from_outcomes(vec![incomplete(0x41), incomplete(0x58)], &config);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.incomplete, 2);
        assert_eq!(summary.succeeded, 0);
        assert!(summary.warnings.is_empty());
        assert_eq!(summary.verdict, Verdict::NotVulnerable);

        let empty = ExperimentSummary::from_outcomes(Vec::new(), &config);
        assert_eq!(empty.attempted, 0);
        assert!(empty.warnings.is_empty());
    }

    #[test]
    fn invalid_stride_is_fatal() {
        let config = TrialConfig {
            stride: 100,
            ..TrialConfig::default()
        };
        let mut source = ScriptedTimingSource::new(|_| 40);
        assert!(matches!(
            run_experiment(&mut source, &config, &[0x41]),
            Err(ExperimentError::ProbeAllocation(
                SideChannelError::InvalidStride { .. }
            ))
        ));
    }

    #[test]
    fn bad_offset_marks_every_trial_incomplete() {
        let config = TrialConfig {
            offset: page_size() + 1,
            attack_iterations: 1,
            ..TrialConfig::default()
        };
        let mut source = ScriptedTimingSource::new(|_| 40);
        let summary = run_experiment(&mut source, &config, &[0x41, 0x58]).unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.incomplete, 2);
        assert_eq!(summary.succeeded, 0);
        assert!(summary.warnings.is_empty());
    }

    #[test]
    fn forwarding_source_is_vulnerable() {
        let config = TrialConfig {
            attack_iterations: 5,
            ..TrialConfig::default()
        };
        let secrets = DEFAULT_SECRETS;
        let per_trial = config.probe.repetitions as usize * PROBE_ENTRIES;
        // The classifier visits entries in `mix` order, so the n-th timed
        // access of a round is entry `mix(n)`.
        let mut timed = 0usize;
        let mut source = ScriptedTimingSource::new(move |_| {
            let index = mix((timed % PROBE_ENTRIES) as u8);
            let secret = secrets[timed / per_trial];
            timed += 1;
            if index == secret {
                40
            } else {
                200
            }
        });
        let summary = run_experiment(&mut source, &config, &secrets).unwrap();
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.verdict, Verdict::Vulnerable);
        for outcome in &summary.outcomes {
            assert_eq!(outcome.leaked_byte(), Some(outcome.secret_byte));
            assert_eq!(outcome.confidence(), Some(100));
        }
    }

    #[test]
    fn calibration_replaces_threshold() {
        let config = TrialConfig {
            attack_iterations: 1,
            calibrate: Some(cache_utils::calibration::HistParams {
                iterations: 16,
                ..Default::default()
            }),
            ..TrialConfig::default()
        };
        let mut source = CacheModelTimingSource::new(64, 150, 400);
        let summary = run_experiment(&mut source, &config, &[0x41]).unwrap();
        assert!(summary.threshold_cycles >= 150);
        assert!(summary.threshold_cycles < 400);
        assert!(!summary.miss_faster_than_hit);
        // With the configured 80 cycles nothing would have been a hit.
        assert_eq!(summary.outcomes[0].confidence(), Some(1));
    }

    #[test]
    fn failed_calibration_keeps_configured_threshold() {
        let config = TrialConfig {
            attack_iterations: 1,
            calibrate: Some(cache_utils::calibration::HistParams {
                iterations: 16,
                ..Default::default()
            }),
            ..TrialConfig::default()
        };
        // Both latencies are past the end of the calibration histogram.
        let mut source = CacheModelTimingSource::new(64, 1500, 3000);
        let summary = run_experiment(&mut source, &config, &[0x41]).unwrap();
        assert_eq!(summary.threshold_cycles, 80);
        assert!(!summary.miss_faster_than_hit);
        assert_eq!(summary.outcomes[0].leaked_byte(), Some(0));
        assert_eq!(summary.outcomes[0].confidence(), Some(0));
        assert!(!summary.outcomes[0].success());
    }
}
