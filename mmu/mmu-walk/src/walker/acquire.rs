//! Downward half of the walk: making level instances resident.

use log::trace;

use mmu_fmt::{MAX_SUB_LEVELS, VirtAddr};

use crate::backend::{FillState, LevelAlloc, WalkBackend};
use crate::walker::{OpKind, WalkCore};
use crate::error::WalkError;
use crate::instance::{EntryState, LevelInstance};
use crate::level::NodeId;

impl<B: WalkBackend> WalkCore<'_, '_, B> {
    /// Makes the root instance resident and points the PDB at it.
    ///
    /// Returns the root instance key. With `commit` set the PDB is
    /// rewritten even when nothing changed, and a missing root is an error
    /// instead of an allocation.
    pub(crate) fn root_acquire(
        &mut self,
        va_lo: u64,
        va_hi: u64,
        commit: bool,
    ) -> Result<u64, WalkError> {
        let (key, changed) =
            self.inst_acquire(NodeId::ROOT, va_lo, va_hi, true, false, commit, false)?;
        let key = key.ok_or(WalkError::InvalidState)?;
        if changed || commit {
            let fmt = self.fmt(NodeId::ROOT);
            let backing = self.levels[NodeId::ROOT.0]
                .instances
                .get(&key)
                .and_then(|inst| inst.backing());
            if !self.backend.write_pdb(fmt, backing) {
                return Err(WalkError::InvalidState);
            }
        }
        Ok(key)
    }

    /// Acquires the sub-level instances behind the directory entry
    /// `(node, key)[index]` and rewrites the entry if anything changed.
    ///
    /// Returns the instance key per sub-level, `None` where a sub-level is
    /// absent and may stay absent.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn pde_acquire(
        &mut self,
        op: &OpKind<'_, B>,
        node: NodeId,
        key: u64,
        index: usize,
        sub_level: usize,
        va_lo: u64,
        va_hi: u64,
    ) -> Result<[Option<u64>; MAX_SUB_LEVELS], WalkError> {
        let flags = op.flags();
        let num_subs = self.levels[node.0].sub_levels.len();
        let mut va_limit = va_hi;

        // Parallel partial tables must cover the same span: widen the limit
        // to the furthest coverage any existing sub-level already has.
        if num_subs > 1 {
            for i in 0..num_subs {
                let child = self.levels[node.0].sub_levels[i];
                let child_fmt = self.fmt(child);
                let child_key = child_fmt.level_va_lo(VirtAddr::new(va_lo)).as_u64();
                if let Some(inst) = self.levels[child.0].instances.get(&child_key) {
                    let covered = (inst.size() / child_fmt.entry_size) as u64;
                    if covered > 0 {
                        va_limit = va_limit.max(child_key + covered * child_fmt.page_size() - 1);
                    }
                }
            }
        }

        let mut sub_keys: [Option<u64>; MAX_SUB_LEVELS] = [None; MAX_SUB_LEVELS];
        let mut changed = false;

        // Small sub-level first, so the big table's acquisition can see
        // whether the fine table is resident.
        for i in (0..num_subs).rev() {
            let child = self.levels[node.0].sub_levels[i];
            let mut target = i == sub_level;
            let mut init_nv4k = false;
            let mut child_limit = va_limit;
            if self.flags.ats && num_subs > 1 && i == 0 && !flags.release {
                // ATS requires the big table to exist alongside any small
                // table, fully sized and NV4K-filled.
                if sub_keys[1].is_some() {
                    target = true;
                }
                init_nv4k = true;
                let child_fmt = self.fmt(child);
                child_limit = child_limit.max(child_fmt.level_va_hi(VirtAddr::new(va_lo)).as_u64());
            }
            let (child_key, child_changed) = self.inst_acquire(
                child,
                va_lo,
                child_limit,
                target,
                flags.release,
                flags.commit,
                init_nv4k,
            )?;
            sub_keys[i] = child_key;
            if child_key.is_none() {
                debug_assert!(flags.release || !target);
                continue;
            }
            changed |= child_changed;
        }

        if changed || flags.commit {
            self.write_pde(node, key, index, &sub_keys)?;
            self.inst_mut(node, key)?.set_state(index, EntryState::Pde);
        }
        Ok(sub_keys)
    }

    /// Makes one instance of `node` resident (or grows it) for a walk over
    /// `[va_lo, va_limit]`.
    ///
    /// Returns the instance key (`None` when the instance is absent and the
    /// operation does not require it) and whether backing changed. With
    /// `release` set nothing is ever allocated. A `commit` requires the
    /// instance to already exist at full size.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn inst_acquire(
        &mut self,
        node: NodeId,
        va_lo: u64,
        va_limit: u64,
        target: bool,
        release: bool,
        commit: bool,
        init_nv4k: bool,
    ) -> Result<(Option<u64>, bool), WalkError> {
        let fmt = self.fmt(node);
        let key = fmt.level_va_lo(VirtAddr::new(va_lo)).as_u64();
        let mut created = false;

        if !self.levels[node.0].instances.contains_key(&key) {
            if !target || release {
                return Ok((None, false));
            }
            if commit {
                return Err(WalkError::InvalidState);
            }
            trace!(
                "instance create: bits {}..{} base {key:#x}",
                fmt.va_bit_hi, fmt.va_bit_lo
            );
            self.levels[node.0]
                .instances
                .insert(key, LevelInstance::new(fmt.entry_count()));
            created = true;
        }

        // Release-family operations never touch backing sizes.
        if release {
            return Ok((Some(key), false));
        }

        match self.grow_instance(node, key, va_limit, target, init_nv4k) {
            Ok(changed) => Ok((Some(key), changed)),
            Err(err) => {
                if created {
                    self.inst_release(node, key);
                }
                Err(err)
            }
        }
    }

    /// Sizes the backing of `(node, key)` to cover `va_limit`, copying and
    /// freeing the old backing on growth and initializing the grown tail.
    fn grow_instance(
        &mut self,
        node: NodeId,
        key: u64,
        va_limit: u64,
        target: bool,
        init_nv4k: bool,
    ) -> Result<bool, WalkError> {
        let fmt = self.fmt(node);
        let (old_size, had_backing) = {
            let inst = self.inst(node, key)?;
            (inst.size(), inst.backing().is_some())
        };

        let alloc = {
            let current = self.levels[node.0]
                .instances
                .get(&key)
                .and_then(|inst| inst.backing());
            self.backend.level_alloc(
                fmt,
                VirtAddr::new(key),
                VirtAddr::new(va_limit),
                target,
                current,
            )?
        };
        let LevelAlloc::New { backing, size } = alloc else {
            // Retaining nothing is a backend contract violation.
            return if had_backing {
                Ok(false)
            } else {
                Err(WalkError::InvalidState)
            };
        };
        // Growth is monotonic and whole-entry.
        if size <= old_size || size % fmt.entry_size != 0 {
            self.backend.level_free(fmt, VirtAddr::new(key), backing);
            return Err(WalkError::InvalidState);
        }

        let entry_lo = old_size / fmt.entry_size;
        let entry_hi = size / fmt.entry_size - 1;
        let old = self.inst_mut(node, key)?.replace_backing(backing, size);

        if let Some(old_backing) = old {
            debug_assert!(had_backing);
            if entry_lo > 0 {
                let new_ref = self.levels[node.0]
                    .instances
                    .get(&key)
                    .and_then(|inst| inst.backing())
                    .ok_or(WalkError::InvalidState)?;
                let copied = self
                    .backend
                    .copy_entries(fmt, &old_backing, new_ref, 0, entry_lo - 1);
                if copied != entry_lo {
                    self.backend.level_free(fmt, VirtAddr::new(key), old_backing);
                    return Err(WalkError::InvalidState);
                }
            }
            self.backend.level_free(fmt, VirtAddr::new(key), old_backing);
        }

        if self.invalidate_on_reserve {
            let fill = if init_nv4k {
                FillState::Nv4k
            } else {
                FillState::Invalid
            };
            let new_ref = self.levels[node.0]
                .instances
                .get(&key)
                .and_then(|inst| inst.backing())
                .ok_or(WalkError::InvalidState)?;
            let filled = self
                .backend
                .fill_entries(fmt, new_ref, entry_lo, entry_hi, fill);
            if filled != entry_hi - entry_lo + 1 {
                return Err(WalkError::InvalidState);
            }
        }
        if init_nv4k {
            let inst = self.inst_mut(node, key)?;
            for index in entry_lo..=entry_hi {
                inst.set_state(index, EntryState::Nv4k);
            }
        }
        Ok(true)
    }
}
