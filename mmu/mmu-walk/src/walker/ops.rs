//! The closed set of walk operations.
//!
//! Every top-level API call becomes one [`OpKind`] value that is threaded
//! through the traversal. Per-entry dispatch is a plain `match`; recursive
//! sub-operations (sparse splits, clearing a directory before overwriting
//! it) construct fresh fill ops locally.

use mmu_fmt::VirtAddr;

use crate::backend::{FillState, WalkBackend};
use crate::walker::WalkCore;
use crate::error::WalkError;
use crate::instance::EntryState;
use crate::level::NodeId;

/// Constant entry pattern a fill operation drives a range toward.
#[derive(Debug, Copy, Clone)]
pub(crate) struct FillTarget {
    pub entry_state: EntryState,
    pub fill_state: FillState,
}

impl FillTarget {
    pub(crate) const INVALID: Self = Self {
        entry_state: EntryState::Invalid,
        fill_state: FillState::Invalid,
    };
    pub(crate) const SPARSE: Self = Self {
        entry_state: EntryState::Sparse,
        fill_state: FillState::Sparse,
    };
    pub(crate) const NV4K: Self = Self {
        entry_state: EntryState::Nv4k,
        fill_state: FillState::Nv4k,
    };
}

/// Traversal behavior shared by a family of operations.
#[derive(Debug, Copy, Clone)]
pub(crate) struct OpFlags {
    /// Drives entries toward a constant state; enables batched fills.
    pub fill: bool,
    /// Visits only resident directory entries and never allocates.
    pub release: bool,
    /// Skips dual sub-level conflict resolution.
    pub ignore_conflicts: bool,
    /// Forces PDE/PDB rewrites even when tracking reports no change.
    pub commit: bool,
}

/// One in-flight walk operation.
pub(crate) enum OpKind<'c, B: WalkBackend> {
    /// Write PTEs at the target level, pulling entries from the cursor.
    Map {
        target: NodeId,
        cursor: &'c mut B::MapCursor,
    },
    /// Drive the range to a constant state (unmap, sparsify).
    Fill(FillTarget),
    /// Pin target-level instances over the range.
    Reserve { target: NodeId },
    /// Drop reservations over the range.
    Release { target: NodeId },
    /// Rewrite all directory entries and the PDB along resident paths.
    Commit { target: NodeId },
}

impl<B: WalkBackend> OpKind<'_, B> {
    pub(crate) const fn fill_invalid() -> Self {
        Self::Fill(FillTarget::INVALID)
    }

    pub(crate) const fn fill_sparse() -> Self {
        Self::Fill(FillTarget::SPARSE)
    }

    pub(crate) const fn flags(&self) -> OpFlags {
        match self {
            Self::Map { .. } => OpFlags {
                fill: false,
                release: false,
                ignore_conflicts: false,
                commit: false,
            },
            Self::Fill(_) => OpFlags {
                fill: true,
                release: false,
                ignore_conflicts: false,
                commit: false,
            },
            Self::Reserve { .. } => OpFlags {
                fill: false,
                release: false,
                ignore_conflicts: true,
                commit: false,
            },
            Self::Release { .. } => OpFlags {
                fill: false,
                release: true,
                ignore_conflicts: true,
                commit: false,
            },
            Self::Commit { .. } => OpFlags {
                fill: false,
                release: true,
                ignore_conflicts: true,
                commit: true,
            },
        }
    }
}

/// Whether the operation consumed the level or the walk must descend.
pub(crate) enum Applied {
    Done,
    Descend,
}

impl<'f, B: WalkBackend> WalkCore<'_, 'f, B> {
    /// Applies `op` to the current level, deciding whether to recurse.
    pub(crate) fn op_apply(
        &mut self,
        op: &mut OpKind<'_, B>,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<Applied, WalkError> {
        match op {
            OpKind::Fill(_) => Ok(Applied::Descend),
            OpKind::Map { target, cursor } => {
                if *target == node {
                    self.map_level(node, key, va_lo, va_hi, &mut **cursor)?;
                    Ok(Applied::Done)
                } else {
                    Ok(Applied::Descend)
                }
            }
            OpKind::Reserve { target } => {
                if *target == node {
                    self.reserve_level(node, key, va_lo, va_hi)?;
                    Ok(Applied::Done)
                } else {
                    Ok(Applied::Descend)
                }
            }
            OpKind::Release { target } => {
                if *target == node {
                    self.release_level(node, key, va_lo, va_hi)?;
                    Ok(Applied::Done)
                } else {
                    Ok(Applied::Descend)
                }
            }
            OpKind::Commit { target } => {
                // Commit does all its work in the acquire path; reaching the
                // target just stops the descent.
                if *target == node {
                    Ok(Applied::Done)
                } else {
                    Ok(Applied::Descend)
                }
            }
        }
    }

    /// Writes PTEs over `[va_lo, va_hi]` at the map target level.
    fn map_level(
        &mut self,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
        cursor: &mut B::MapCursor,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let level_base = fmt.level_va_lo(VirtAddr::new(va_lo));
        let entry_lo = fmt.entry_index(VirtAddr::new(va_lo));
        let entry_hi = fmt.entry_index(VirtAddr::new(va_hi));

        // Entries still referencing sub-levels must have their sub-trees
        // cleared before being overwritten, or the instances below would
        // leak. Reserved sub-levels survive the clear; the entry then keeps
        // its directory role alongside the new mapping and is flagged
        // hybrid.
        for index in entry_lo..=entry_hi {
            if self.inst(node, key)?.state(index) != EntryState::Pde {
                continue;
            }
            let entry_va_lo = fmt.entry_va_lo(level_base, index).as_u64();
            let entry_va_hi = fmt.entry_va_hi(level_base, index).as_u64();
            let mut clear = OpKind::fill_invalid();
            self.walk_entries(&mut clear, node, key, entry_va_lo, entry_va_hi)?;
            if self.inst(node, key)?.state(index) == EntryState::Pde {
                self.inst_mut(node, key)?.set_hybrid(index, true);
            }
        }

        let requested = entry_hi - entry_lo + 1;
        let backing = self.levels[node.0]
            .instances
            .get(&key)
            .and_then(|inst| inst.backing())
            .ok_or(WalkError::InvalidState)?;
        let written = self
            .backend
            .map_next_entries(cursor, fmt, backing, entry_lo, entry_hi);
        if written != requested {
            return Err(WalkError::InvalidState);
        }

        let inst = self.inst_mut(node, key)?;
        for index in entry_lo..=entry_hi {
            inst.set_state(index, EntryState::Pte);
        }

        if self.flags.ats {
            self.reconcile_nv4k_after_map(node, key, entry_lo, entry_hi)?;
        }
        Ok(())
    }

    /// Pins target-level entries over `[va_lo, va_hi]`.
    fn reserve_level(
        &mut self,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let entry_lo = fmt.entry_index(VirtAddr::new(va_lo));
        let entry_hi = fmt.entry_index(VirtAddr::new(va_hi));
        let inst = self.inst_mut(node, key)?;
        for index in entry_lo..=entry_hi {
            inst.set_reserved(index, true);
        }
        Ok(())
    }

    /// Unpins target-level entries over `[va_lo, va_hi]`.
    fn release_level(
        &mut self,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let entry_lo = fmt.entry_index(VirtAddr::new(va_lo));
        let entry_hi = fmt.entry_index(VirtAddr::new(va_hi));
        let inst = self.inst_mut(node, key)?;
        for index in entry_lo..=entry_hi {
            inst.set_reserved(index, false);
        }
        Ok(())
    }
}
