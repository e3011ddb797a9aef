//! Dual sub-level handling: conflict resolution between the parallel big
//! and small page tables, and NV4K reconciliation of the big table against
//! the small one.
//!
//! Both tables of a pair share one parent entry and cover the same span, so
//! their instances share the same base-address key; only the entry indices
//! differ by the page-size ratio.

use mmu_fmt::{MAX_SUB_LEVELS, VirtAddr, aligned_entry_indices};

use crate::backend::WalkBackend;
use crate::walker::{FillTarget, WalkCore};
use crate::error::WalkError;
use crate::instance::EntryState;
use crate::level::NodeId;

impl<B: WalkBackend> WalkCore<'_, '_, B> {
    /// Reconciles the two parallel tables after the walk picked `sub_level`
    /// as the side a non-release operation will write through.
    ///
    /// The other side's aligned entries are invalidated so only one table
    /// translates any given address, and sparse coverage carried by big
    /// entries is preserved on the small remainders the operation does not
    /// overwrite.
    pub(crate) fn resolve_sub_level_conflicts(
        &mut self,
        node: NodeId,
        sub_keys: &[Option<u64>; MAX_SUB_LEVELS],
        sub_level: usize,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<(), WalkError> {
        let big = self.levels[node.0].sub_levels[0];
        let small = self.levels[node.0].sub_levels[1];
        let big_fmt = self.fmt(big);
        let small_fmt = self.fmt(small);

        let (big_lo, big_hi, small_lo, small_hi);
        if sub_level == 1 {
            small_lo = small_fmt.entry_index(VirtAddr::new(va_lo));
            small_hi = small_fmt.entry_index(VirtAddr::new(va_hi));
            (big_lo, big_hi) = aligned_entry_indices(small_fmt, small_lo, small_hi, big_fmt);
        } else {
            big_lo = big_fmt.entry_index(VirtAddr::new(va_lo));
            big_hi = big_fmt.entry_index(VirtAddr::new(va_hi));
            (small_lo, small_hi) = aligned_entry_indices(big_fmt, big_lo, big_hi, small_fmt);
        }

        // Writing through the small table can split big sparse entries: the
        // small entries aligned under the boundary big entries but outside
        // the operation's range inherit the sparse coverage.
        if sub_level == 1 {
            if let (Some(big_key), Some(small_key)) = (sub_keys[0], sub_keys[1]) {
                let (adj_lo, adj_hi) = aligned_entry_indices(big_fmt, big_lo, big_hi, small_fmt);
                let big_inst = self.inst(big, big_key)?;
                let conflict_lo = big_inst.state(big_lo) == EntryState::Sparse;
                let conflict_hi = big_inst.state(big_hi) == EntryState::Sparse;
                if conflict_lo && adj_lo < small_lo {
                    self.flush_fill(small, small_key, adj_lo, small_lo - 1, FillTarget::SPARSE)?;
                }
                if conflict_hi && adj_hi > small_hi {
                    self.flush_fill(small, small_key, small_hi + 1, adj_hi, FillTarget::SPARSE)?;
                }
            }
        }

        // The side not written through must not translate the range.
        if let (Some(big_key), Some(small_key)) = (sub_keys[0], sub_keys[1]) {
            if sub_level == 0 {
                self.flush_fill(small, small_key, small_lo, small_hi, FillTarget::INVALID)?;
            } else {
                self.flush_fill(big, big_key, big_lo, big_hi, FillTarget::INVALID)?;
            }
        }
        Ok(())
    }

    /// The big sibling of `node`, when `node` is the small table of a dual
    /// pair.
    fn big_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.levels[node.0].parent?;
        let subs = &self.levels[parent.0].sub_levels;
        if subs.len() == MAX_SUB_LEVELS && subs[1] == node {
            Some(subs[0])
        } else {
            None
        }
    }

    /// The small sibling of `node`, when `node` is the big table of a dual
    /// pair.
    fn small_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.levels[node.0].parent?;
        let subs = &self.levels[parent.0].sub_levels;
        if subs.len() == MAX_SUB_LEVELS && subs[0] == node {
            Some(subs[1])
        } else {
            None
        }
    }

    /// Restores NV4K markers after entries of either side of a dual pair
    /// were invalidated. Scoped to the touched aligned range only.
    pub(crate) fn reconcile_nv4k(
        &mut self,
        node: NodeId,
        key: u64,
        index_lo: usize,
        index_hi: usize,
    ) -> Result<(), WalkError> {
        if let Some(big) = self.big_sibling(node) {
            return self.demote_big_range(big, node, key, index_lo, index_hi);
        }
        if self.small_sibling(node).is_some() {
            return self.demote_big_range(node, node, key, index_lo, index_hi);
        }
        Ok(())
    }

    /// Marks every big entry in the aligned range whose small-side coverage
    /// holds no valid entry as NV4K instead of Invalid. `touched` is the
    /// node whose indices `[index_lo, index_hi]` were just filled; when it
    /// is the big side itself the range needs no alignment translation.
    fn demote_big_range(
        &mut self,
        big: NodeId,
        touched: NodeId,
        key: u64,
        index_lo: usize,
        index_hi: usize,
    ) -> Result<(), WalkError> {
        if !self.levels[big.0].instances.contains_key(&key) {
            return Ok(());
        }
        let big_fmt = self.fmt(big);
        let small = self
            .small_sibling(big)
            .ok_or(WalkError::InvalidState)?;
        let small_fmt = self.fmt(small);

        let (big_lo, big_hi) = if touched == big {
            (index_lo, index_hi)
        } else {
            aligned_entry_indices(small_fmt, index_lo, index_hi, big_fmt)
        };

        for index in big_lo..=big_hi {
            if self.inst(big, key)?.state(index) != EntryState::Invalid {
                continue;
            }
            let (aligned_lo, aligned_hi) = aligned_entry_indices(big_fmt, index, index, small_fmt);
            let all_invalid = match self.levels[small.0].instances.get(&key) {
                Some(small_inst) => (aligned_lo..=aligned_hi)
                    .all(|small_index| small_inst.state(small_index) == EntryState::Invalid),
                None => true,
            };
            if all_invalid {
                self.fill_tracked(big, key, index, index, FillTarget::NV4K)?;
            }
        }
        Ok(())
    }

    /// After small-table entries `[index_lo, index_hi]` were mapped, clears
    /// NV4K from their aligned big entries.
    pub(crate) fn reconcile_nv4k_after_map(
        &mut self,
        node: NodeId,
        key: u64,
        index_lo: usize,
        index_hi: usize,
    ) -> Result<(), WalkError> {
        let Some(big) = self.big_sibling(node) else {
            return Ok(());
        };
        if !self.levels[big.0].instances.contains_key(&key) {
            return Ok(());
        }
        let small_fmt = self.fmt(node);
        let big_fmt = self.fmt(big);
        let (big_lo, big_hi) = aligned_entry_indices(small_fmt, index_lo, index_hi, big_fmt);

        for index in big_lo..=big_hi {
            if self.inst(big, key)?.state(index) == EntryState::Nv4k {
                self.fill_tracked(big, key, index, index, FillTarget::INVALID)?;
            }
        }
        Ok(())
    }
}
