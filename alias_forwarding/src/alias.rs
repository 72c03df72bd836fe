use bit_field::BitField;
use cache_utils::mmap::MMappedMemory;
use cache_utils::page_size;
use core::ops::Range;
use thiserror::Error;

/// Bits of the virtual address the store buffer compares first.
pub const ALIAS_BITS: Range<usize> = 0..12;
pub const OFFSET_MASK: usize = 0xFFF;

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("failed to map aliased page: {0}")]
    Allocation(#[source] nix::Error),
    #[error("offset {offset:#x} does not fit in a {page_size} byte page")]
    InvalidOffset { offset: usize, page_size: usize },
}

/// Two distinct pages and one address in each, at the same page offset.
/// The pages are unmapped when the pair is dropped.
#[derive(Debug)]
pub struct AliasedPair {
    store_region: MMappedMemory,
    load_region: MMappedMemory,
    offset: usize,
}

impl AliasedPair {
    pub fn store_addr(&self) -> *mut u8 {
        self.store_region.as_ptr().wrapping_add(self.offset) as *mut u8
    }

    pub fn load_addr(&self) -> *const u8 {
        self.load_region.as_ptr().wrapping_add(self.offset)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The low address bits both addresses share.
    pub fn low_bits(&self) -> usize {
        (self.store_addr() as usize).get_bits(ALIAS_BITS)
    }
}

pub fn setup_alias(offset: usize) -> Result<AliasedPair, AliasError> {
    let page_size = page_size();
    if offset >= page_size {
        return Err(AliasError::InvalidOffset { offset, page_size });
    }
    let store_region =
        MMappedMemory::try_new(page_size, |_| 0).map_err(AliasError::Allocation)?;
    let load_region =
        MMappedMemory::try_new(page_size, |_| 0).map_err(AliasError::Allocation)?;
    let pair = AliasedPair {
        store_region,
        load_region,
        offset,
    };
    debug_assert_eq!(
        pair.store_addr() as usize & OFFSET_MASK,
        pair.load_addr() as usize & OFFSET_MASK
    );
    log::info!(
        "4K-aliased addresses: {:p} and {:p} (offset: {:#x})",
        pair.store_addr(),
        pair.load_addr(),
        pair.low_bits()
    );
    Ok(pair)
}
