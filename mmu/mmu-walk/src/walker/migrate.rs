//! Relocating a resident instance's backing memory in place.

use log::trace;

use mmu_fmt::{MAX_SUB_LEVELS, VirtAddr};

use crate::backend::{FillState, WalkBackend};
use crate::walker::WalkCore;
use crate::error::WalkError;
use crate::level::NodeId;

impl<B: WalkBackend> WalkCore<'_, '_, B> {
    /// Moves the backing of `(node, key)` to `new_backing`, copying the
    /// overlapping prefix of entries, invalidating any newly exposed tail
    /// and freeing the old backing. With `update_parent` set the
    /// referencing parent entry (or the PDB, for the root) is rewritten
    /// before the old backing is released.
    ///
    /// Mapped contents are unchanged; this only relocates storage.
    pub(crate) fn migrate_instance(
        &mut self,
        node: NodeId,
        key: u64,
        new_backing: B::Backing,
        new_size: usize,
        update_parent: bool,
    ) -> Result<(), WalkError> {
        let fmt = self.fmt(node);
        let base = VirtAddr::new(key);

        let old_size = match self.inst(node, key) {
            Ok(inst) if inst.backing().is_some() => inst.size(),
            _ => {
                self.backend.level_free(fmt, base, new_backing);
                return Err(WalkError::InvalidArgument);
            }
        };
        if new_size == 0 || new_size % fmt.entry_size != 0 {
            self.backend.level_free(fmt, base, new_backing);
            return Err(WalkError::InvalidArgument);
        }
        trace!(
            "instance migrate: bits {}..{} base {key:#x}, {old_size} -> {new_size} bytes",
            fmt.va_bit_hi, fmt.va_bit_lo
        );

        let old = self
            .inst_mut(node, key)?
            .replace_backing(new_backing, new_size)
            .ok_or(WalkError::InvalidState)?;

        let copy_count = old_size.min(new_size) / fmt.entry_size;
        let new_count = new_size / fmt.entry_size;
        {
            let new_ref = self.levels[node.0]
                .instances
                .get(&key)
                .and_then(|inst| inst.backing())
                .ok_or(WalkError::InvalidState)?;
            if copy_count > 0 {
                let copied = self
                    .backend
                    .copy_entries(fmt, &old, new_ref, 0, copy_count - 1);
                if copied != copy_count {
                    self.backend.level_free(fmt, base, old);
                    return Err(WalkError::InvalidState);
                }
            }
            if new_count > copy_count {
                let filled = self.backend.fill_entries(
                    fmt,
                    new_ref,
                    copy_count,
                    new_count - 1,
                    FillState::Invalid,
                );
                if filled != new_count - copy_count {
                    self.backend.level_free(fmt, base, old);
                    return Err(WalkError::InvalidState);
                }
            }
        }

        if update_parent {
            if let Err(err) = self.rewrite_reference(node, key) {
                self.backend.level_free(fmt, base, old);
                return Err(err);
            }
        }

        self.backend.level_free(fmt, base, old);
        Ok(())
    }

    /// Rewrites whatever references the instance `(node, key)`: the PDB for
    /// the root, otherwise the parent directory entry.
    fn rewrite_reference(&mut self, node: NodeId, key: u64) -> Result<(), WalkError> {
        let Some(parent) = self.levels[node.0].parent else {
            let fmt = self.fmt(NodeId::ROOT);
            let backing = self.levels[NodeId::ROOT.0]
                .instances
                .get(&key)
                .and_then(|inst| inst.backing());
            if self.backend.write_pdb(fmt, backing) {
                return Ok(());
            }
            return Err(WalkError::InvalidState);
        };

        let parent_fmt = self.fmt(parent);
        let parent_key = parent_fmt.level_va_lo(VirtAddr::new(key)).as_u64();
        let index = parent_fmt.entry_index(VirtAddr::new(key));

        // Collect whichever siblings are resident so the rewritten entry
        // references the full pair.
        let mut sub_keys: [Option<u64>; MAX_SUB_LEVELS] = [None; MAX_SUB_LEVELS];
        for (i, &child) in self.levels[parent.0].sub_levels.iter().enumerate() {
            if self.levels[child.0].instances.contains_key(&key) {
                sub_keys[i] = Some(key);
            }
        }
        self.write_pde(parent, parent_key, index, &sub_keys)
    }
}
