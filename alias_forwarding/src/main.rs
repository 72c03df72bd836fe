use alias_forwarding::config::{Delay, EvictionOrder, TrialConfig, DEFAULT_SECRETS};
use alias_forwarding::experiment::{run_experiment, ExperimentError, Verdict};
use alias_forwarding::report;

use cache_side_channel::table_side_channel::ProbeParams;
use cache_side_channel::{pin_to_core, restore_affinity};
use cache_utils::cache_info;
use cache_utils::calibration::{HistParams, Threshold};
use clap::Parser;
use flush_reload::NativeTimingSource;
use std::io;
use std::process::ExitCode;

/// Detects speculative store-to-load forwarding between 4K-aliased addresses.
///
/// Stores each secret byte through one page, loads through another page at the
/// same page offset, and recovers the loaded byte with flush+reload.
#[derive(Parser, Debug)]
#[command(version, verbatim_doc_comment)]
struct Args {
    /// Comma-separated secret bytes: 0x41, 65 or A
    #[arg(long, value_delimiter = ',', value_parser = parse_secret)]
    secrets: Option<Vec<u8>>,

    /// Page offset of the aliased addresses
    #[arg(long, default_value_t = 256, value_parser = parse_usize)]
    offset: usize,

    /// Distance between probe entries, in bytes
    #[arg(long, default_value_t = 512, value_parser = parse_usize)]
    stride: usize,

    /// Evict, wait and attack rounds per trial
    #[arg(long, default_value_t = 1000)]
    attack_iterations: u32,

    /// Passes over the probe array per trial
    #[arg(long, default_value_t = 100)]
    repetitions: u32,

    /// Accesses taking at most this many cycles are hits
    #[arg(long, default_value_t = 80)]
    threshold: u64,

    /// A leak succeeds only with a confidence above this
    #[arg(long, default_value_t = 10)]
    confidence: i32,

    /// Busy loop iterations between eviction and attack
    #[arg(long, conflicts_with = "delay_cycles")]
    delay_spin: Option<u64>,

    /// Cycles to wait between eviction and attack
    #[arg(long)]
    delay_cycles: Option<u64>,

    #[arg(long, value_enum, default_value_t = EvictionOrder::FlushThenDelay)]
    eviction_order: EvictionOrder,

    /// Calibrate the hit threshold on the probe array instead of using --threshold
    #[arg(long, conflicts_with = "threshold")]
    calibrate: bool,

    /// Core to pin to, the first allowed core by default
    #[arg(long)]
    core: Option<usize>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Exit with status 2 when the processor is vulnerable
    #[arg(long)]
    fail_on_vulnerable: bool,
}

fn parse_usize(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

/// `0x41`, `65`, `A` and `'A'` all mean the same byte.
fn parse_secret(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let unquoted = s
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(s);
    let mut chars = unquoted.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if !c.is_ascii_digit() || unquoted != s {
            return if c.is_ascii() {
                Ok(c as u8)
            } else {
                Err(format!("{:?} is not an ASCII character", s))
            };
        }
    }
    let value = parse_usize(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", value))
}

impl Args {
    fn config(&self) -> TrialConfig {
        let delay = match (self.delay_spin, self.delay_cycles) {
            (_, Some(cycles)) => Delay::Cycles(cycles),
            (Some(n), None) => Delay::Spin(n),
            (None, None) => Delay::default(),
        };
        TrialConfig {
            offset: self.offset,
            stride: self.stride,
            line_size: cache_info::l1d_line_size(),
            attack_iterations: self.attack_iterations,
            probe: ProbeParams {
                repetitions: self.repetitions,
                threshold: Threshold::at_most(self.threshold),
            },
            confidence_threshold: self.confidence,
            delay,
            eviction_order: self.eviction_order,
            calibrate: self.calibrate.then(HistParams::default),
            ..TrialConfig::default()
        }
    }

    fn secrets(&self) -> Vec<u8> {
        self.secrets
            .clone()
            .unwrap_or_else(|| DEFAULT_SECRETS.to_vec())
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.config();
    let secrets = args.secrets();

    let mut source = match NativeTimingSource::new() {
        Ok(source) => source,
        Err(e) => {
            log::error!("{}", ExperimentError::Counter(e));
            return ExitCode::from(1);
        }
    };

    let old_affinity = match pin_to_core(args.core) {
        Ok((core, old)) => {
            log::info!("pinned to core {}", core);
            Some(old)
        }
        Err(e) => {
            log::warn!("running unpinned: {}", e);
            None
        }
    };

    let result = run_experiment(&mut source, &config, &secrets);

    if let Some(old) = old_affinity {
        if let Err(e) = restore_affinity(&old) {
            log::warn!("{}", e);
        }
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = if args.json {
        report::write_json(&mut out, &summary)
    } else {
        report::write_text(&mut out, &summary)
    };
    if let Err(e) = written {
        log::error!("cannot write report: {}", e);
        return ExitCode::from(1);
    }

    if args.fail_on_vulnerable && summary.verdict == Verdict::Vulnerable {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
