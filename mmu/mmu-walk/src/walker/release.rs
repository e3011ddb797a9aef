//! Upward half of the walk: rewriting parent entries and freeing emptied
//! instances while the recursion unwinds.

use log::trace;

use mmu_fmt::{MAX_SUB_LEVELS, VirtAddr};

use crate::backend::WalkBackend;
use crate::walker::{FillTarget, OpKind, WalkCore};
use crate::error::WalkError;
use crate::instance::EntryState;
use crate::level::NodeId;

impl<B: WalkBackend> WalkCore<'_, '_, B> {
    /// Re-derives the state of directory entry `(node, key)[index]` from its
    /// sub-level instances after a descent, rewrites it if needed, and frees
    /// sub-instances nothing pins anymore.
    pub(crate) fn pde_release(
        &mut self,
        op: &OpKind<'_, B>,
        node: NodeId,
        key: u64,
        index: usize,
        entry_va_lo: u64,
    ) -> Result<(), WalkError> {
        let num_subs = self.levels[node.0].sub_levels.len();

        // The state an emptied entry falls back to comes from the
        // controlling fill target; targeted ops fall back to invalid.
        let mut state = match op {
            OpKind::Fill(target) => target.entry_state,
            _ => EntryState::Invalid,
        };

        let mut sub_keys: [Option<u64>; MAX_SUB_LEVELS] = [None; MAX_SUB_LEVELS];
        let mut keep = [false; MAX_SUB_LEVELS];
        let mut changed = false;
        let mut freed_resident = false;

        for i in (0..num_subs).rev() {
            let child = self.levels[node.0].sub_levels[i];
            let child_fmt = self.fmt(child);
            let child_key = child_fmt.level_va_lo(VirtAddr::new(entry_va_lo)).as_u64();
            let Some(inst) = self.levels[child.0].instances.get(&child_key) else {
                continue;
            };
            sub_keys[i] = Some(child_key);

            // Under ATS a big table holding nothing but NV4K markers exists
            // only for the small table's sake; once the small table is gone
            // it can be dropped too.
            if self.flags.ats && num_subs == MAX_SUB_LEVELS && i == 0 {
                if inst.num_nv4k() as usize == child_fmt.entry_count()
                    && inst.num_reserved() == 0
                    && (!keep[1] || changed)
                {
                    changed = true;
                    freed_resident = true;
                } else {
                    state = EntryState::Pde;
                    keep[i] = true;
                }
                continue;
            }

            if !inst.is_empty() || inst.num_hybrid() != 0 {
                state = EntryState::Pde;
                keep[i] = true;
            } else {
                if inst.backing().is_some() {
                    changed = true;
                }
                freed_resident = true;
            }
        }

        changed |= state != self.inst(node, key)?.state(index);

        if changed {
            match state {
                EntryState::Invalid | EntryState::Sparse => {
                    let target = if state == EntryState::Sparse {
                        FillTarget::SPARSE
                    } else {
                        FillTarget::INVALID
                    };
                    self.fill_tracked(node, key, index, index, target)?;
                    let inst = self.inst_mut(node, key)?;
                    if inst.hybrid(index) {
                        inst.set_hybrid(index, false);
                    }
                }
                EntryState::Pde => {
                    let mut kept_keys: [Option<u64>; MAX_SUB_LEVELS] = [None; MAX_SUB_LEVELS];
                    for i in 0..num_subs {
                        if keep[i] {
                            kept_keys[i] = sub_keys[i];
                        }
                    }
                    self.write_pde(node, key, index, &kept_keys)?;
                    let inst = self.inst_mut(node, key)?;
                    inst.set_state(index, EntryState::Pde);
                    // Some but not all sub-levels surviving leaves the entry
                    // hybrid.
                    if freed_resident {
                        inst.set_hybrid(index, true);
                    }
                }
                _ => return Err(WalkError::InvalidState),
            }
        }

        for i in 0..num_subs {
            if let Some(child_key) = sub_keys[i] {
                if !keep[i] {
                    let child = self.levels[node.0].sub_levels[i];
                    self.inst_release(child, child_key);
                }
            }
        }
        Ok(())
    }

    /// Removes the instance `(node, key)` and hands its backing to the host.
    pub(crate) fn inst_release(&mut self, node: NodeId, key: u64) {
        if let Some(inst) = self.levels[node.0].instances.remove(&key) {
            debug_assert_eq!(inst.num_valid(), 0);
            debug_assert_eq!(inst.num_reserved(), 0);
            let fmt = self.fmt(node);
            trace!(
                "instance free: bits {}..{} base {key:#x}",
                fmt.va_bit_hi, fmt.va_bit_lo
            );
            if let Some(backing) = inst.into_backing() {
                self.backend.level_free(fmt, VirtAddr::new(key), backing);
            }
        }
    }

    /// Frees the root instance and clears the PDB once nothing pins it.
    pub(crate) fn root_release(&mut self) -> Result<(), WalkError> {
        let Some((&key, inst)) = self.levels[NodeId::ROOT.0].instances.iter().next() else {
            return Ok(());
        };
        if !inst.is_empty() {
            return Ok(());
        }
        let fmt = self.fmt(NodeId::ROOT);
        if !self.backend.write_pdb(fmt, None) {
            return Err(WalkError::InvalidState);
        }
        self.inst_release(NodeId::ROOT, key);
        Ok(())
    }

    /// Unconditionally frees every resident instance under `node`, children
    /// first. Tracking consistency is abandoned; only backing memory is
    /// returned to the host.
    pub(crate) fn force_free(&mut self, node: NodeId) {
        let subs = self.levels[node.0].sub_levels.clone();
        for child in subs {
            self.force_free(child);
        }
        while let Some((&key, _)) = self.levels[node.0].instances.iter().next() {
            if let Some(inst) = self.levels[node.0].instances.get_mut(&key) {
                inst.clear_tracking();
            }
            self.inst_release(node, key);
        }
        if node == NodeId::ROOT {
            let fmt = self.fmt(NodeId::ROOT);
            let _ = self.backend.write_pdb(fmt, None);
        }
    }
}
