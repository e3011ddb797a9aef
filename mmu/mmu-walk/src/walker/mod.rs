//! Recursive traversal over the level arena.
//!
//! [`WalkCore`] borrows the walker's mutable pieces for the duration of one
//! top-level operation. Levels are addressed as `(NodeId, key)` pairs where
//! `key` is the base virtual address of the instance; instances are
//! re-fetched from the arena at each use because release paths remove them
//! mid-walk.

mod acquire;
mod conflict;
mod migrate;
mod ops;
mod release;

pub(crate) use ops::{FillTarget, OpKind};

use alloc::vec::Vec;

use mmu_fmt::{LevelFormat, MAX_SUB_LEVELS, VirtAddr};

use crate::backend::WalkBackend;
use crate::error::WalkError;
use crate::instance::{EntryState, LevelInstance};
use crate::level::{Level, NodeId};
use crate::walk::WalkFlags;

use ops::Applied;

pub(crate) struct WalkCore<'w, 'f, B: WalkBackend> {
    pub levels: &'w mut Vec<Level<'f, B::Backing>>,
    pub backend: &'w mut B,
    pub flags: WalkFlags,
    pub invalidate_on_reserve: bool,
}

/// Outcome of processing a single directory entry.
enum EntryStep {
    /// Nothing resident below the entry; unwinding is skipped.
    Skipped,
    /// The entry was descended through and must be unwound.
    Descended,
}

impl<'f, B: WalkBackend> WalkCore<'_, 'f, B> {
    #[inline]
    pub(crate) fn fmt(&self, node: NodeId) -> &'f LevelFormat {
        self.levels[node.0].fmt
    }

    #[inline]
    pub(crate) fn inst(
        &self,
        node: NodeId,
        key: u64,
    ) -> Result<&LevelInstance<B::Backing>, WalkError> {
        self.levels[node.0]
            .instances
            .get(&key)
            .ok_or(WalkError::InvalidState)
    }

    #[inline]
    pub(crate) fn inst_mut(
        &mut self,
        node: NodeId,
        key: u64,
    ) -> Result<&mut LevelInstance<B::Backing>, WalkError> {
        self.levels[node.0]
            .instances
            .get_mut(&key)
            .ok_or(WalkError::InvalidState)
    }

    /// Key of the resident root instance, if any.
    pub(crate) fn root_key(&self) -> Option<u64> {
        self.levels[NodeId::ROOT.0]
            .instances
            .keys()
            .next()
            .copied()
    }

    /// Applies `op` to the instance `(node, key)` over `[va_lo, va_hi]`,
    /// descending into sub-levels as needed.
    pub(crate) fn process_pdes(
        &mut self,
        op: &mut OpKind<'_, B>,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<(), WalkError> {
        match self.op_apply(op, node, key, va_lo, va_hi)? {
            Applied::Done => Ok(()),
            Applied::Descend => self.walk_entries(op, node, key, va_lo, va_hi),
        }
    }

    /// Walks the directory entries of `(node, key)` touched by the range.
    ///
    /// Fill operations batch runs of fully covered entries into single bulk
    /// fills; everything else goes entry by entry through
    /// [`Self::descend_entry`], with the entry unwound afterwards even when
    /// the descent fails.
    pub(crate) fn walk_entries(
        &mut self,
        op: &mut OpKind<'_, B>,
        node: NodeId,
        key: u64,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let level_base = fmt.level_va_lo(VirtAddr::new(va_lo));
        let entry_lo = fmt.entry_index(VirtAddr::new(va_lo));
        let entry_hi = fmt.entry_index(VirtAddr::new(va_hi));
        let flags = op.flags();

        let mut fill_lo = entry_lo;
        let mut fill_hi = entry_lo;
        let mut pending_fill = false;

        for index in entry_lo..=entry_hi {
            let entry_va_lo = fmt.entry_va_lo(level_base, index).as_u64();
            let entry_va_hi = fmt.entry_va_hi(level_base, index).as_u64();
            let clipped_lo = va_lo.max(entry_va_lo);
            let clipped_hi = va_hi.min(entry_va_hi);

            let inst = self.inst(node, key)?;
            let state = inst.state(index);

            // Release-family ops only follow resident directory paths.
            if flags.release && state != EntryState::Pde && !inst.hybrid(index) {
                continue;
            }

            if let OpKind::Fill(target) = op {
                let target = *target;
                if !pending_fill {
                    fill_lo = index;
                }
                // Fully covered entries that are not directories move to the
                // target state in bulk. A directory entry instead descends
                // so its sub-tree is cleared and freed first. NV4K already
                // counts as invalid; refilling it would just be undone by
                // reconciliation.
                if state != target.entry_state
                    && state != EntryState::Pde
                    && !(state == EntryState::Nv4k && target.entry_state == EntryState::Invalid)
                    && entry_va_lo == clipped_lo
                    && entry_va_hi == clipped_hi
                {
                    fill_hi = index;
                    pending_fill = true;
                    if index < entry_hi {
                        continue;
                    }
                }
                if pending_fill {
                    self.flush_fill(node, key, fill_lo, fill_hi, target)?;
                    pending_fill = false;
                }
                let after = self.inst(node, key)?.state(index);
                if after == target.entry_state
                    || (after == EntryState::Nv4k && target.entry_state == EntryState::Invalid)
                {
                    continue;
                }
            }

            match self.descend_entry(op, node, key, index, state, entry_va_lo, entry_va_hi, clipped_lo, clipped_hi) {
                Ok(EntryStep::Skipped) => {}
                Ok(EntryStep::Descended) => {
                    self.pde_release(op, node, key, index, entry_va_lo)?;
                }
                Err(err) => {
                    // Unwind what the partial descent left behind; the
                    // original error is what gets reported.
                    let _ = self.pde_release(op, node, key, index, entry_va_lo);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Handles one directory entry that needs a sub-level: acquires it,
    /// splits sparse remainders, resolves dual-table conflicts and recurses.
    #[allow(clippy::too_many_arguments)]
    fn descend_entry(
        &mut self,
        op: &mut OpKind<'_, B>,
        node: NodeId,
        key: u64,
        index: usize,
        state: EntryState,
        entry_va_lo: u64,
        entry_va_hi: u64,
        clipped_lo: u64,
        clipped_hi: u64,
    ) -> Result<EntryStep, WalkError> {
        let flags = op.flags();
        let sub_level = self.select_sub_level(op, node, clipped_lo, clipped_hi)?;
        // Splitting a sparse entry fills the uncovered remainders, so the
        // sub-level must span the whole entry, not just the clipped range.
        let acquire_hi = if state == EntryState::Sparse {
            entry_va_hi
        } else {
            clipped_hi
        };
        let sub_keys = self.pde_acquire(op, node, key, index, sub_level, clipped_lo, acquire_hi)?;

        // Nothing resident below a release-family op means nothing to do,
        // and the entry must not be rewritten on the way out.
        if flags.release && sub_keys[sub_level].is_none() {
            return Ok(EntryStep::Skipped);
        }

        let child = self.levels[node.0].sub_levels[sub_level];
        let child_key = sub_keys[sub_level].ok_or(WalkError::InvalidState)?;

        // A sparse entry only partially covered by the range keeps sparse
        // semantics on both uncovered remainders, pushed down one level.
        if state == EntryState::Sparse {
            if clipped_lo > entry_va_lo {
                let mut split = OpKind::fill_sparse();
                self.process_pdes(&mut split, child, child_key, entry_va_lo, clipped_lo - 1)?;
            }
            if clipped_hi < entry_va_hi {
                let mut split = OpKind::fill_sparse();
                self.process_pdes(&mut split, child, child_key, clipped_hi + 1, entry_va_hi)?;
            }
        }

        if self.levels[node.0].sub_levels.len() == MAX_SUB_LEVELS && !flags.ignore_conflicts {
            self.resolve_sub_level_conflicts(node, &sub_keys, sub_level, clipped_lo, clipped_hi)?;
        }

        self.process_pdes(op, child, child_key, clipped_lo, clipped_hi)?;
        Ok(EntryStep::Descended)
    }

    /// Bulk-fills entries `[index_lo, index_hi]` and updates tracking, then
    /// reconciles NV4K bookkeeping on the big table of a dual pair if
    /// needed.
    pub(crate) fn flush_fill(
        &mut self,
        node: NodeId,
        key: u64,
        index_lo: usize,
        index_hi: usize,
        target: FillTarget,
    ) -> Result<(), WalkError> {
        self.fill_tracked(node, key, index_lo, index_hi, target)?;
        if self.flags.ats && target.entry_state == EntryState::Invalid {
            self.reconcile_nv4k(node, key, index_lo, index_hi)?;
        }
        Ok(())
    }

    /// Bulk-fills entries and mirrors the new state into tracking.
    pub(crate) fn fill_tracked(
        &mut self,
        node: NodeId,
        key: u64,
        index_lo: usize,
        index_hi: usize,
        target: FillTarget,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let backing = self.levels[node.0]
            .instances
            .get(&key)
            .and_then(|inst| inst.backing())
            .ok_or(WalkError::InvalidState)?;
        let filled = self
            .backend
            .fill_entries(fmt, backing, index_lo, index_hi, target.fill_state);
        if filled != index_hi - index_lo + 1 {
            return Err(WalkError::InvalidState);
        }
        let inst = self.inst_mut(node, key)?;
        for index in index_lo..=index_hi {
            inst.set_state(index, target.entry_state);
        }
        Ok(())
    }

    /// Picks the sub-level an entry descends into.
    ///
    /// Targeted operations follow the branch containing the target level.
    /// Fill operations have no target; a range the first table cannot
    /// represent at its page granularity must go through the last (finest)
    /// table, while representable ranges prefer whichever parallel table is
    /// resident and default to the first.
    fn select_sub_level(
        &self,
        op: &OpKind<'_, B>,
        node: NodeId,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<usize, WalkError> {
        let subs = &self.levels[node.0].sub_levels;
        if subs.is_empty() {
            return Err(WalkError::InvalidState);
        }
        if subs.len() == 1 {
            return Ok(0);
        }
        match op {
            OpKind::Fill(_) => {
                let big_page = self.fmt(subs[0]).page_size();
                if va_lo & (big_page - 1) != 0 || va_hi & (big_page - 1) != big_page - 1 {
                    return Ok(subs.len() - 1);
                }
                for (i, &child) in subs.iter().enumerate() {
                    let child_fmt = self.fmt(child);
                    let child_key = child_fmt.level_va_lo(VirtAddr::new(va_lo)).as_u64();
                    if self.levels[child.0].instances.contains_key(&child_key) {
                        return Ok(i);
                    }
                }
                Ok(0)
            }
            OpKind::Map { target, .. }
            | OpKind::Reserve { target }
            | OpKind::Release { target }
            | OpKind::Commit { target } => self.sub_level_toward(node, *target),
        }
    }

    /// Index of the sub-level of `node` whose sub-tree contains `target`.
    fn sub_level_toward(&self, node: NodeId, target: NodeId) -> Result<usize, WalkError> {
        let mut cur = target;
        while let Some(parent) = self.levels[cur.0].parent {
            if parent == node {
                return self.levels[node.0]
                    .sub_levels
                    .iter()
                    .position(|&c| c == cur)
                    .ok_or(WalkError::InvalidState);
            }
            cur = parent;
        }
        Err(WalkError::InvalidArgument)
    }

    /// Rewrites the directory entry `(node, key)[index]` to reference the
    /// given sub-level instances.
    pub(crate) fn write_pde(
        &mut self,
        node: NodeId,
        key: u64,
        index: usize,
        sub_keys: &[Option<u64>; MAX_SUB_LEVELS],
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let dir = self.levels[node.0]
            .instances
            .get(&key)
            .and_then(|inst| inst.backing())
            .ok_or(WalkError::InvalidState)?;
        let mut subs: [Option<&B::Backing>; MAX_SUB_LEVELS] = [None; MAX_SUB_LEVELS];
        for (i, &child) in self.levels[node.0].sub_levels.iter().enumerate() {
            if let Some(child_key) = sub_keys[i] {
                subs[i] = self.levels[child.0]
                    .instances
                    .get(&child_key)
                    .and_then(|inst| inst.backing());
            }
        }
        if self.backend.write_pde(fmt, dir, index, subs) {
            Ok(())
        } else {
            Err(WalkError::InvalidState)
        }
    }
}
