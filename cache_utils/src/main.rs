// Calibrates the reload hit threshold on every core the process may run on.
// Calibration has to be sequential, it pins on each core one after the other.

use cache_utils::calibration::{
    calibrate, flush_and_reload, hit_miss_threshold, load_and_reload, HistParams, Prepare,
    HIT_MISS_OPERATIONS,
};
use cache_utils::mmap::MMappedMemory;
use cache_utils::{cache_info, page_size};
use cpuid::{FamilyModelStepping, Features};

use nix::errno::Errno;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::process::ExitCode;

pub fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let features = Features::detect();
    let missing = features.missing_for_timing();
    if !missing.is_empty() {
        log::error!("cannot time cache accesses, missing: {:?}", missing);
        return ExitCode::FAILURE;
    }
    eprintln!("CPU: {}", FamilyModelStepping::get());

    let line = cache_info::l1d_line_size();
    let m = match MMappedMemory::try_new(page_size(), |i| i as u8) {
        Ok(m) => m,
        Err(e) => {
            log::error!("failed to map calibration page: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let array = m.slice();
    let params = HistParams::default();

    let old = match sched_getaffinity(Pid::from_raw(0)) {
        Ok(old) => old,
        Err(e) => {
            log::error!("failed to read affinity: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("core,hit_median,miss_median,threshold,error_rate");
    for i in 0..CpuSet::count() {
        if !old.is_set(i).unwrap_or(false) {
            continue;
        }
        let mut core = CpuSet::new();
        if core.set(i).is_err() {
            continue;
        }

        match sched_setaffinity(Pid::from_raw(0), &core) {
            Ok(()) => {
                let results = unsafe {
                    calibrate(
                        array.as_ptr(),
                        line,
                        array.len(),
                        &HIT_MISS_OPERATIONS,
                        params,
                        |op, p| match op.prepare {
                            Prepare::Access => load_and_reload(p),
                            Prepare::Flush => flush_and_reload(p),
                        },
                    )
                };
                match hit_miss_threshold(results, params.bucket_size) {
                    Some(c) => println!(
                        "{},{},{},{},{:.4}",
                        i,
                        c.hit_median,
                        c.miss_median,
                        c.threshold.cycles,
                        c.error.error_rate()
                    ),
                    None => log::warn!("core {}: no threshold found", i),
                }
            }
            Err(Errno::EINVAL) => {
                log::debug!("skipping core {}", i);
                continue;
            }
            Err(e) => {
                log::error!("Unexpected error while setting affinity: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &old) {
        log::warn!("failed to restore affinity: {}", e);
    }
    ExitCode::SUCCESS
}
