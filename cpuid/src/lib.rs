#![cfg_attr(not(feature = "use_std"), no_std)]

// Host capability detection for the timing primitives.
// Only x86_64 is supported, the counter and clflush are both x86 instructions.

extern crate alloc;

use alloc::vec::Vec;
use core::arch::x86_64;
use core::fmt;

use crate::CPUVendor::{Intel, Unknown, AMD};

const BASIC_FEATURES_LEAF: u32 = 0x1;
const EXTENDED_MAX_LEAF: u32 = 0x8000_0000;
const EXTENDED_FEATURES_LEAF: u32 = 0x8000_0001;
const ADVANCED_POWER_LEAF: u32 = 0x8000_0007;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CPUVendor {
    Intel,
    AMD,
    Unknown,
}

impl CPUVendor {
    pub fn get_cpu_vendor() -> CPUVendor {
        let r = unsafe { x86_64::__cpuid(0) };
        CPUVendor::decode_cpu_vendor(r)
    }

    pub fn decode_cpu_vendor(cpuid_result: x86_64::CpuidResult) -> CPUVendor {
        let feature_string = [cpuid_result.ebx, cpuid_result.edx, cpuid_result.ecx]
            .iter()
            .map(|&u| u.to_le_bytes())
            .collect::<Vec<_>>()
            .concat();
        match feature_string.as_slice() {
            b"GenuineIntel" => Intel,
            b"AuthenticAMD" => AMD,
            _ => Unknown,
        }
    }
}

/// Display family, display model and stepping, as decoded from leaf 1 EAX.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct FamilyModelStepping {
    pub vendor: CPUVendor,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl FamilyModelStepping {
    pub fn get() -> FamilyModelStepping {
        let vendor = CPUVendor::get_cpu_vendor();
        let eax = unsafe { x86_64::__cpuid(BASIC_FEATURES_LEAF) }.eax;
        Self::decode(vendor, eax)
    }

    pub fn decode(vendor: CPUVendor, eax: u32) -> FamilyModelStepping {
        let stepping = eax & 0xf;
        let mut model = (eax >> 4) & 0xf;
        let mut family = (eax >> 8) & 0xf;
        if family == 0xf {
            family += (eax >> 20) & 0xff
        }
        if family == 0xf || family == 0x6 || family > 0xf {
            model += (eax >> 12) & 0xf0
        }
        FamilyModelStepping {
            vendor,
            family,
            model,
            stepping,
        }
    }
}

impl fmt::Display for FamilyModelStepping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} family {:#x} model {:#x} stepping {}",
            self.vendor, self.family, self.model, self.stepping
        )
    }
}

/// The subset of cpuid feature flags the timing side channel relies on.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Default)]
pub struct Features {
    /// `rdtsc` is available (leaf 1, EDX bit 4).
    pub tsc: bool,
    /// `clflush` is available (leaf 1, EDX bit 19).
    pub clflush: bool,
    /// `rdtscp` is available (leaf 0x8000_0001, EDX bit 27).
    pub rdtscp: bool,
    /// The TSC ticks at a constant rate across P/C states (leaf 0x8000_0007, EDX bit 8).
    pub invariant_tsc: bool,
    /// Line size flushed by `clflush`, in bytes (leaf 1, EBX bits 15:8, times 8).
    pub clflush_line_size: usize,
}

impl Features {
    pub fn detect() -> Features {
        let basic = unsafe { x86_64::__cpuid(BASIC_FEATURES_LEAF) };
        let max_extended = unsafe { x86_64::__cpuid(EXTENDED_MAX_LEAF) }.eax;
        let extended = if max_extended >= EXTENDED_FEATURES_LEAF {
            Some(unsafe { x86_64::__cpuid(EXTENDED_FEATURES_LEAF) })
        } else {
            None
        };
        let power = if max_extended >= ADVANCED_POWER_LEAF {
            Some(unsafe { x86_64::__cpuid(ADVANCED_POWER_LEAF) })
        } else {
            None
        };
        Self::decode(basic, extended, power)
    }

    pub fn decode(
        basic: x86_64::CpuidResult,
        extended: Option<x86_64::CpuidResult>,
        power: Option<x86_64::CpuidResult>,
    ) -> Features {
        let tsc = basic.edx >> 4 & 1 != 0;
        let clflush = basic.edx >> 19 & 1 != 0;
        let clflush_line_size = if clflush {
            ((basic.ebx >> 8 & 0xff) * 8) as usize
        } else {
            0
        };
        let rdtscp = extended.map_or(false, |r| r.edx >> 27 & 1 != 0);
        let invariant_tsc = power.map_or(false, |r| r.edx >> 8 & 1 != 0);
        Features {
            tsc,
            clflush,
            rdtscp,
            invariant_tsc,
            clflush_line_size,
        }
    }

    /// Names of the features required for cache timing that this host lacks.
    pub fn missing_for_timing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.tsc {
            missing.push("tsc");
        }
        if !self.rdtscp {
            missing.push("rdtscp");
        }
        if !self.clflush {
            missing.push("clflush");
        }
        missing
    }
}

#[cfg(feature = "use_std")]
impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use itertools::Itertools;
        let flags = [
            ("tsc", self.tsc),
            ("rdtscp", self.rdtscp),
            ("invariant_tsc", self.invariant_tsc),
            ("clflush", self.clflush),
        ];
        write!(
            f,
            "{} (clflush line {} B)",
            flags
                .iter()
                .filter(|(_, present)| *present)
                .map(|(name, _)| name)
                .format(", "),
            self.clflush_line_size
        )
    }
}
