use alloc::vec::Vec;

use crate::addr::VirtAddr;

/// Maximum number of sub-levels one parent slot can select between.
///
/// Two sub-levels model parallel big-page and small-page tables sharing one
/// directory entry; more than two is not a thing any supported format has.
pub const MAX_SUB_LEVELS: usize = 2;

/// Errors produced by [`LevelFormat::validate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// `va_bit_hi` must not be below `va_bit_lo`.
    #[error("virtual address bit range {hi}..{lo} is inverted")]
    InvertedBitRange {
        /// Upper bit of the offending level.
        hi: u8,
        /// Lower bit of the offending level.
        lo: u8,
    },
    /// Bit 63 must stay clear so span masks fit in a `u64`.
    #[error("virtual address bit {0} out of range")]
    BitOutOfRange(u8),
    /// A level indexing all 64 address bits has an entry count that does not
    /// fit in a `usize`.
    #[error("level covers {0} virtual address bits")]
    LevelTooWide(u8),
    /// Entries must occupy at least one byte.
    #[error("entry size of zero bytes")]
    ZeroEntrySize,
    /// At most [`MAX_SUB_LEVELS`] sub-levels per level.
    #[error("{0} sub-levels (maximum is {MAX_SUB_LEVELS})")]
    TooManySubLevels(usize),
    /// Every sub-level must pick up exactly where its parent stops.
    #[error("sub-level covers bits up to {child_hi}, expected {expected}")]
    DiscontiguousSubLevel {
        /// Upper bit actually covered by the sub-level.
        child_hi: u8,
        /// Upper bit the sub-level should cover (`parent.va_bit_lo - 1`).
        expected: u8,
    },
}

/// Format description of one level of a translation hierarchy.
///
/// Immutable once built; the walker borrows the tree for its whole life and
/// identifies levels by reference into it.
#[derive(Debug, Clone)]
pub struct LevelFormat {
    /// Highest virtual-address bit indexed by entries of this level.
    pub va_bit_hi: u8,
    /// Lowest virtual-address bit indexed by entries of this level.
    pub va_bit_lo: u8,
    /// Size in bytes of one entry.
    pub entry_size: usize,
    /// Whether entries at this level may be leaf (page-table) entries rather
    /// than only directory entries.
    pub is_leaf: bool,
    /// Sub-level formats selected by entries of this level (0, 1 or 2).
    pub sub_levels: Vec<LevelFormat>,
}

impl LevelFormat {
    /// A leaf page-table level with no sub-levels.
    #[must_use]
    pub const fn page_table(va_bit_hi: u8, va_bit_lo: u8, entry_size: usize) -> Self {
        Self {
            va_bit_hi,
            va_bit_lo,
            entry_size,
            is_leaf: true,
            sub_levels: Vec::new(),
        }
    }

    /// A directory level over the given sub-levels.
    #[must_use]
    pub fn directory(
        va_bit_hi: u8,
        va_bit_lo: u8,
        entry_size: usize,
        sub_levels: Vec<LevelFormat>,
    ) -> Self {
        Self {
            va_bit_hi,
            va_bit_lo,
            entry_size,
            is_leaf: false,
            sub_levels,
        }
    }

    /// Checks structural soundness of the whole format tree.
    ///
    /// # Errors
    /// Returns the first [`FormatError`] found in pre-order.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.va_bit_hi >= 64 {
            return Err(FormatError::BitOutOfRange(self.va_bit_hi));
        }
        if self.va_bit_hi < self.va_bit_lo {
            return Err(FormatError::InvertedBitRange {
                hi: self.va_bit_hi,
                lo: self.va_bit_lo,
            });
        }
        if self.va_bit_hi - self.va_bit_lo + 1 == 64 {
            return Err(FormatError::LevelTooWide(64));
        }
        if self.entry_size == 0 {
            return Err(FormatError::ZeroEntrySize);
        }
        if self.sub_levels.len() > MAX_SUB_LEVELS {
            return Err(FormatError::TooManySubLevels(self.sub_levels.len()));
        }
        for sub in &self.sub_levels {
            let expected = self.va_bit_lo.saturating_sub(1);
            if self.va_bit_lo == 0 || sub.va_bit_hi != expected {
                return Err(FormatError::DiscontiguousSubLevel {
                    child_hi: sub.va_bit_hi,
                    expected,
                });
            }
            sub.validate()?;
        }
        Ok(())
    }

    /// Virtual bytes covered by a single entry of this level.
    ///
    /// For a leaf level this is the page size; for a directory it is the span
    /// of one whole sub-tree.
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1u64 << self.va_bit_lo
    }

    /// Number of entries in a full table/directory of this level.
    #[inline]
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        1usize << (self.va_bit_hi - self.va_bit_lo + 1)
    }

    /// Mask of all virtual-address bits at or below this level
    /// (bits `va_bit_hi..=0`).
    #[inline]
    #[must_use]
    pub const fn span_mask(&self) -> u64 {
        u64::MAX >> (63 - self.va_bit_hi)
    }

    /// Base of the full span of this level containing `va`.
    #[inline]
    #[must_use]
    pub const fn level_va_lo(&self, va: VirtAddr) -> VirtAddr {
        VirtAddr::new(va.as_u64() & !self.span_mask())
    }

    /// Last address of the full span of this level containing `va`.
    #[inline]
    #[must_use]
    pub const fn level_va_hi(&self, va: VirtAddr) -> VirtAddr {
        VirtAddr::new(va.as_u64() | self.span_mask())
    }

    /// Index of the entry covering `va` within this level.
    #[inline]
    #[must_use]
    pub const fn entry_index(&self, va: VirtAddr) -> usize {
        ((va.as_u64() >> self.va_bit_lo) as usize) & (self.entry_count() - 1)
    }

    /// First address covered by entry `index`, given the level's span base.
    #[inline]
    #[must_use]
    pub const fn entry_va_lo(&self, level_base: VirtAddr, index: usize) -> VirtAddr {
        VirtAddr::new(level_base.as_u64() + index as u64 * self.page_size())
    }

    /// Last address covered by entry `index`, given the level's span base.
    #[inline]
    #[must_use]
    pub const fn entry_va_hi(&self, level_base: VirtAddr, index: usize) -> VirtAddr {
        VirtAddr::new(self.entry_va_lo(level_base, index).as_u64() + (self.page_size() - 1))
    }
}

/// Translates an entry-index range of one level into the aligned index range
/// of a parallel level covering the same virtual span.
///
/// Coarse→fine multiplies by the page-size ratio, fine→coarse divides. For
/// example with 64 KiB and 4 KiB sub-levels, big entry 1 aligns to small
/// entries 16..=31, and small entries 1..=18 are covered by big entries 0..=1.
#[must_use]
pub fn aligned_entry_indices(
    from: &LevelFormat,
    index_lo: usize,
    index_hi: usize,
    to: &LevelFormat,
) -> (usize, usize) {
    let from_size = from.page_size();
    let to_size = to.page_size();
    if from_size < to_size {
        let ratio = (to_size / from_size) as usize;
        (index_lo / ratio, index_hi / ratio)
    } else {
        let ratio = (from_size / to_size) as usize;
        (index_lo * ratio, (index_hi + 1) * ratio - 1)
    }
}
