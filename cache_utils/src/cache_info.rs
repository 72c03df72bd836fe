//! Cache geometry as reported by cpuid leaf 4 (deterministic cache parameters).
//! Used to check that the probe stride puts every probe entry on its own line.

use core::arch::x86_64 as arch_x86;

const CACHE_INFO_CPUID_LEAF: u32 = 0x4;

/// Line size assumed when cpuid does not enumerate the caches.
pub const DEFAULT_CACHE_LINE_LEN: usize = 64;

pub fn get_cache_info() -> Vec<CacheInfo> {
    let max_leaf = unsafe { arch_x86::__cpuid(0) }.eax;
    if max_leaf < CACHE_INFO_CPUID_LEAF {
        return Vec::new();
    }
    let mut ret = Vec::new();
    let mut i = 0;

    while let Some(cache_info) =
        CacheInfo::from_cpuid_result(&unsafe { arch_x86::__cpuid_count(CACHE_INFO_CPUID_LEAF, i) })
    {
        ret.push(cache_info);
        i += 1;
    }
    ret
}

/// Line size of the first level data cache, or the default when unknown.
pub fn l1d_line_size() -> usize {
    l1d_line_size_from(&get_cache_info())
}

pub fn l1d_line_size_from(caches: &[CacheInfo]) -> usize {
    caches
        .iter()
        .find(|c| c.level == 1 && c.cache_type != CacheType::Instruction)
        .map(|c| c.cache_line_size as usize)
        .unwrap_or(DEFAULT_CACHE_LINE_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheType {
    Null = 0,
    Data = 1,
    Instruction = 2,
    Unified = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_type: CacheType,
    pub level: u8,
    pub fully_assoc: bool,
    pub cache_line_size: u16,
    pub associativity: u16,
    pub sets: u32,
    pub inclusive: bool,
}

impl CacheInfo {
    pub fn from_cpuid_result(cr: &arch_x86::CpuidResult) -> Option<CacheInfo> {
        let cache_type = match cr.eax & 0x1f {
            1 => CacheType::Data,
            2 => CacheType::Instruction,
            3 => CacheType::Unified,
            _ => {
                return None;
            }
        };
        let level: u8 = (cr.eax >> 5 & 0x7) as u8;
        let fully_assoc = (cr.eax >> 9 & 0x1) != 0;
        let cache_line_size = (cr.ebx & 0xfff) as u16 + 1;
        let associativity = (cr.ebx >> 22 & 0x3ff) as u16 + 1;
        let sets = cr.ecx + 1;
        let inclusive = (cr.edx & 0x2) != 0;

        Some(CacheInfo {
            cache_type,
            level,
            fully_assoc,
            cache_line_size,
            associativity,
            sets,
            inclusive,
        })
    }

    pub fn size(&self) -> usize {
        self.cache_line_size as usize * self.associativity as usize * self.sets as usize
    }
}
