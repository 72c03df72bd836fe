use alias_forwarding::config::TrialConfig;
use alias_forwarding::experiment::{run_experiment, Verdict, Warning};
use alias_forwarding::trial::run_trial;

use cache_side_channel::table_side_channel::{mix, ProbeArray, PROBE_ENTRIES};
use flush_reload::synthetic::ScriptedTimingSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const HIT: u64 = 40;
const MISS: u64 = 200;

fn config() -> TrialConfig {
    TrialConfig {
        attack_iterations: 20,
        ..TrialConfig::default()
    }
}

/// Index `i` is a hit on its first `hits[i]` timed accesses, a miss afterwards.
fn hit_budget(probe: &ProbeArray, hits: [u32; PROBE_ENTRIES]) -> impl FnMut(*const u8) -> u64 {
    let layout = probe.layout();
    let mut seen = [0u32; PROBE_ENTRIES];
    move |p| {
        let i = layout.index_of(p).expect("timed access outside the probe array") as usize;
        seen[i] += 1;
        if seen[i] <= hits[i] {
            HIT
        } else {
            MISS
        }
    }
}

#[test]
fn leaks_0x41() {
    let mut probe = ProbeArray::new(512, 64).unwrap();
    let mut hits = [0u32; PROBE_ENTRIES];
    for (i, h) in hits.iter_mut().enumerate() {
        *h = (i % 10) as u32;
    }
    hits[0x41] = 87;
    let mut source = ScriptedTimingSource::new(hit_budget(&probe, hits));

    let outcome = run_trial(&mut source, &mut probe, &config(), 0x41);
    assert_eq!(outcome.leaked_byte(), Some(0x41));
    assert!(outcome.confidence().unwrap() >= 78);
    assert!(outcome.success());
}

#[test]
fn close_runner_up_is_not_a_leak() {
    let mut probe = ProbeArray::new(512, 64).unwrap();
    let mut hits = [0u32; PROBE_ENTRIES];
    hits[0x7F] = 12;
    hits[0x10] = 11;
    let mut source = ScriptedTimingSource::new(hit_budget(&probe, hits));

    let outcome = run_trial(&mut source, &mut probe, &config(), 0x7F);
    assert_eq!(outcome.leaked_byte(), Some(0x7F));
    assert_eq!(outcome.confidence(), Some(1));
    assert!(!outcome.success());
}

#[test]
fn wrong_byte_with_high_confidence_is_not_a_leak() {
    let mut probe = ProbeArray::new(512, 64).unwrap();
    let mut hits = [0u32; PROBE_ENTRIES];
    hits[0x00] = 100;
    let mut source = ScriptedTimingSource::new(hit_budget(&probe, hits));

    let outcome = run_trial(&mut source, &mut probe, &config(), 0x58);
    assert_eq!(outcome.leaked_byte(), Some(0x00));
    assert_eq!(outcome.confidence(), Some(100));
    assert!(!outcome.success());
}

#[test]
fn noise_only_run_is_not_vulnerable() {
    // Every access has the same small chance of looking like a hit.
    let mut rng = StdRng::seed_from_u64(0x4b);
    let mut source = ScriptedTimingSource::new(move |_| {
        if rng.gen_ratio(1, 1000) {
            HIT
        } else {
            MISS
        }
    });
    let summary = run_experiment(&mut source, &config(), &[0x41, 0x58]).unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.verdict, Verdict::NotVulnerable);
    let max_confidence = summary
        .outcomes
        .iter()
        .filter_map(|o| o.confidence())
        .max()
        .unwrap();
    assert!(max_confidence <= 10);
    if max_confidence <= config().calibration_warning_confidence {
        assert_eq!(
            summary.warnings,
            vec![Warning::Calibration { max_confidence }]
        );
    } else {
        assert!(summary.warnings.is_empty());
    }
}

#[test]
fn one_leak_out_of_four_is_vulnerable() {
    let config = config();
    let secrets = [0x41u8, 0x58, 0x42, 0x7F];
    let per_trial = config.probe.repetitions as usize * PROBE_ENTRIES;
    let mut timed = 0usize;
    // Only the third trial forwards the store.
    let mut source = ScriptedTimingSource::new(move |_| {
        let index = mix((timed % PROBE_ENTRIES) as u8);
        let trial = timed / per_trial;
        timed += 1;
        if trial == 2 && index == 0x42 {
            HIT
        } else {
            MISS
        }
    });
    let summary = run_experiment(&mut source, &config, &secrets).unwrap();
    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.incomplete, 0);
    assert!(summary.outcomes[2].success());
    assert_eq!(summary.verdict, Verdict::Vulnerable);
    assert!(summary.warnings.is_empty());
}
