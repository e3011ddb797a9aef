//! Per-instance entry state tracking.
//!
//! Each resident level instance mirrors its backing memory with one
//! [`EntryState`] per entry plus reserved/hybrid flags, and keeps summary
//! counters over them. The counters decide lifetime: an instance whose
//! valid, sparse and reserved counts are all zero is eligible to be freed
//! on the way back up a walk.

use alloc::vec;
use alloc::vec::Vec;

/// Software state of one entry, shadowing what the backing memory encodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EntryState {
    /// Not present.
    #[default]
    Invalid,
    /// Read-as-zero without faulting.
    Sparse,
    /// Terminal translation at this level.
    Pte,
    /// References one or two sub-level instances.
    Pde,
    /// Big-page marker meaning "translation lives in the fine table".
    Nv4k,
}

#[derive(Debug, Copy, Clone, Default)]
struct EntryInfo {
    state: EntryState,
    reserved: bool,
    hybrid: bool,
}

/// Tracking state for one resident instance of a level.
///
/// `backing` is the host-owned memory handle; it is absent briefly while an
/// instance exists but has not been sized yet.
#[derive(Debug)]
pub struct LevelInstance<B> {
    backing: Option<B>,
    size: usize,
    entries: Vec<EntryInfo>,
    num_valid: u32,
    num_sparse: u32,
    num_reserved: u32,
    num_hybrid: u32,
    num_nv4k: u32,
}

impl<B> LevelInstance<B> {
    pub(crate) fn new(entry_count: usize) -> Self {
        Self {
            backing: None,
            size: 0,
            entries: vec![EntryInfo::default(); entry_count],
            num_valid: 0,
            num_sparse: 0,
            num_reserved: 0,
            num_hybrid: 0,
            num_nv4k: 0,
        }
    }

    /// Backing memory handle, if already allocated.
    #[inline]
    pub fn backing(&self) -> Option<&B> {
        self.backing.as_ref()
    }

    /// Size of the backing memory in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of entries the tracking (not the backing) covers.
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn state(&self, index: usize) -> EntryState {
        self.entries[index].state
    }

    #[inline]
    #[must_use]
    pub fn reserved(&self, index: usize) -> bool {
        self.entries[index].reserved
    }

    #[inline]
    #[must_use]
    pub fn hybrid(&self, index: usize) -> bool {
        self.entries[index].hybrid
    }

    /// Entries in [`EntryState::Pte`] or [`EntryState::Pde`].
    #[inline]
    #[must_use]
    pub fn num_valid(&self) -> u32 {
        self.num_valid
    }

    #[inline]
    #[must_use]
    pub fn num_sparse(&self) -> u32 {
        self.num_sparse
    }

    #[inline]
    #[must_use]
    pub fn num_reserved(&self) -> u32 {
        self.num_reserved
    }

    #[inline]
    #[must_use]
    pub fn num_hybrid(&self) -> u32 {
        self.num_hybrid
    }

    #[inline]
    #[must_use]
    pub fn num_nv4k(&self) -> u32 {
        self.num_nv4k
    }

    /// True when nothing pins this instance and it may be freed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_valid == 0 && self.num_sparse == 0 && self.num_reserved == 0
    }

    /// Moves the entry at `index` to `state`, transferring the summary
    /// counters accordingly.
    pub(crate) fn set_state(&mut self, index: usize, state: EntryState) {
        let old = self.entries[index].state;
        if old == state {
            return;
        }
        match old {
            EntryState::Invalid => {}
            EntryState::Sparse => {
                debug_assert_ne!(self.num_sparse, 0);
                self.num_sparse -= 1;
            }
            EntryState::Pte | EntryState::Pde => {
                debug_assert_ne!(self.num_valid, 0);
                self.num_valid -= 1;
            }
            EntryState::Nv4k => {
                debug_assert_ne!(self.num_nv4k, 0);
                self.num_nv4k -= 1;
            }
        }
        match state {
            EntryState::Invalid => {}
            EntryState::Sparse => self.num_sparse += 1,
            EntryState::Pte | EntryState::Pde => self.num_valid += 1,
            EntryState::Nv4k => self.num_nv4k += 1,
        }
        self.entries[index].state = state;
    }

    pub(crate) fn set_reserved(&mut self, index: usize, reserved: bool) {
        let entry = &mut self.entries[index];
        if entry.reserved == reserved {
            return;
        }
        entry.reserved = reserved;
        if reserved {
            self.num_reserved += 1;
        } else {
            debug_assert_ne!(self.num_reserved, 0);
            self.num_reserved -= 1;
        }
    }

    pub(crate) fn set_hybrid(&mut self, index: usize, hybrid: bool) {
        let entry = &mut self.entries[index];
        if entry.hybrid == hybrid {
            return;
        }
        entry.hybrid = hybrid;
        if hybrid {
            self.num_hybrid += 1;
        } else {
            debug_assert_ne!(self.num_hybrid, 0);
            self.num_hybrid -= 1;
        }
    }

    /// Installs grown backing, handing back the previous one for the caller
    /// to copy from and free.
    pub(crate) fn replace_backing(&mut self, backing: B, size: usize) -> Option<B> {
        self.size = size;
        self.backing.replace(backing)
    }

    pub(crate) fn into_backing(self) -> Option<B> {
        self.backing
    }

    /// Drops all tracking to zero without touching backing memory. Only
    /// used by forced teardown, where consistency is abandoned on purpose.
    pub(crate) fn clear_tracking(&mut self) {
        for entry in &mut self.entries {
            *entry = EntryInfo::default();
        }
        self.num_valid = 0;
        self.num_sparse = 0;
        self.num_reserved = 0;
        self.num_hybrid = 0;
        self.num_nv4k = 0;
    }
}
