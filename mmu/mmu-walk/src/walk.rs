//! Public walk engine interface.

use alloc::vec::Vec;

use log::debug;

use mmu_fmt::{LevelFormat, VirtAddr};

use crate::backend::WalkBackend;
use crate::walker::{OpKind, WalkCore};
use crate::error::WalkError;
use crate::instance::LevelInstance;
use crate::level::{self, Level, NodeId};

/// Behavior toggles fixed at construction.
#[derive(Debug, Copy, Clone, Default)]
pub struct WalkFlags {
    /// Keep big page tables populated with NV4K markers for an external
    /// address-translation service.
    pub ats: bool,
}

/// A page-table walk engine over one format tree.
///
/// The engine owns no page-table memory; it tracks which level instances
/// are resident and drives all memory changes through the backend. The
/// format tree is borrowed for the walker's lifetime and levels are
/// identified by reference into it.
///
/// All operations are synchronous and take `&mut self`; callers serialize
/// overlapping ranges externally.
pub struct Walk<'f, B: WalkBackend> {
    backend: B,
    flags: WalkFlags,
    levels: Vec<Level<'f, B::Backing>>,
    invalidate_on_reserve: bool,
}

impl<'f, B: WalkBackend> Walk<'f, B> {
    /// Creates a walker over `root_fmt`.
    ///
    /// # Errors
    /// Returns [`WalkError::Format`] when the format tree is unsound.
    pub fn new(root_fmt: &'f LevelFormat, backend: B, flags: WalkFlags) -> Result<Self, WalkError> {
        root_fmt.validate()?;
        Ok(Self {
            backend,
            flags,
            levels: level::build_levels(root_fmt),
            invalidate_on_reserve: true,
        })
    }

    /// Maps `[va_lo, va_hi]` with PTEs at the `target` level, produced by
    /// the backend from `cursor`.
    ///
    /// On failure the whole range is rolled back to unmapped.
    ///
    /// # Errors
    /// Misuse reports [`WalkError::LevelNotFound`], [`WalkError::InvalidArgument`]
    /// or [`WalkError::Misaligned`]; allocation failure reports
    /// [`WalkError::OutOfMemory`].
    pub fn map(
        &mut self,
        va_lo: VirtAddr,
        va_hi: VirtAddr,
        target: &LevelFormat,
        cursor: &mut B::MapCursor,
    ) -> Result<(), WalkError> {
        let target = self.resolve_target(target)?;
        self.check_range(va_lo, va_hi)?;
        self.check_alignment(va_lo, va_hi, target)?;
        debug!("map {va_lo}..={va_hi}");

        let (lo, hi) = (va_lo.as_u64(), va_hi.as_u64());
        let mut core = self.core();
        let root_key = core.root_acquire(lo, hi, false)?;
        let mut op = OpKind::Map { target, cursor };
        if let Err(err) = core.process_pdes(&mut op, NodeId::ROOT, root_key, lo, hi) {
            let mut rollback = OpKind::fill_invalid();
            let _ = core.process_pdes(&mut rollback, NodeId::ROOT, root_key, lo, hi);
            let _ = core.root_release();
            return Err(err);
        }
        Ok(())
    }

    /// Unmaps `[va_lo, va_hi]`, invalidating entries and freeing every
    /// instance the range was the last consumer of.
    ///
    /// # Errors
    /// See [`Self::map`]; unmapping never allocates.
    pub fn unmap(&mut self, va_lo: VirtAddr, va_hi: VirtAddr) -> Result<(), WalkError> {
        self.check_range(va_lo, va_hi)?;
        self.check_leaf_alignment(va_lo, va_hi)?;
        debug!("unmap {va_lo}..={va_hi}");

        let mut core = self.core();
        let Some(root_key) = core.root_key() else {
            return Ok(());
        };
        let mut op = OpKind::fill_invalid();
        let result = core.process_pdes(&mut op, NodeId::ROOT, root_key, va_lo.as_u64(), va_hi.as_u64());
        let released = core.root_release();
        result?;
        released
    }

    /// Marks `[va_lo, va_hi]` sparse: reads-as-zero without faulting.
    ///
    /// On failure the whole range is rolled back to unmapped.
    ///
    /// # Errors
    /// See [`Self::map`].
    pub fn sparsify(&mut self, va_lo: VirtAddr, va_hi: VirtAddr) -> Result<(), WalkError> {
        self.check_range(va_lo, va_hi)?;
        self.check_leaf_alignment(va_lo, va_hi)?;
        debug!("sparsify {va_lo}..={va_hi}");

        let (lo, hi) = (va_lo.as_u64(), va_hi.as_u64());
        let mut core = self.core();
        let root_key = core.root_acquire(lo, hi, false)?;
        let mut op = OpKind::fill_sparse();
        if let Err(err) = core.process_pdes(&mut op, NodeId::ROOT, root_key, lo, hi) {
            let mut rollback = OpKind::fill_invalid();
            let _ = core.process_pdes(&mut rollback, NodeId::ROOT, root_key, lo, hi);
            let _ = core.root_release();
            return Err(err);
        }
        Ok(())
    }

    /// Pre-allocates and pins `target`-level instances over the range so
    /// later maps cannot fail on directory allocation.
    ///
    /// With `invalidate` unset, newly allocated backing is left
    /// uninitialized; the caller takes over initialization.
    ///
    /// On failure the reservation is rolled back.
    ///
    /// # Errors
    /// See [`Self::map`].
    pub fn reserve(
        &mut self,
        target: &LevelFormat,
        va_lo: VirtAddr,
        va_hi: VirtAddr,
        invalidate: bool,
    ) -> Result<(), WalkError> {
        let target = self.resolve_target(target)?;
        self.check_range(va_lo, va_hi)?;
        self.check_alignment(va_lo, va_hi, target)?;
        debug!("reserve {va_lo}..={va_hi}");

        let (lo, hi) = (va_lo.as_u64(), va_hi.as_u64());
        self.invalidate_on_reserve = invalidate;
        let result = {
            let mut core = self.core();
            core.root_acquire(lo, hi, false).and_then(|root_key| {
                let mut op = OpKind::Reserve { target };
                core.process_pdes(&mut op, NodeId::ROOT, root_key, lo, hi)
            })
        };
        self.invalidate_on_reserve = true;
        if let Err(err) = result {
            let _ = self.release_range(target, lo, hi);
            return Err(err);
        }
        Ok(())
    }

    /// Drops the reservations [`Self::reserve`] placed over the range.
    ///
    /// # Errors
    /// See [`Self::map`]; releasing never allocates.
    pub fn release(
        &mut self,
        target: &LevelFormat,
        va_lo: VirtAddr,
        va_hi: VirtAddr,
    ) -> Result<(), WalkError> {
        let target = self.resolve_target(target)?;
        self.check_range(va_lo, va_hi)?;
        self.check_alignment(va_lo, va_hi, target)?;
        debug!("release {va_lo}..={va_hi}");

        self.release_range(target, va_lo.as_u64(), va_hi.as_u64())
    }

    /// Rewrites every directory entry and the PDB along resident paths down
    /// to `target`, without touching leaf contents. Restores volatile
    /// directory programming after it was lost.
    ///
    /// # Errors
    /// [`WalkError::InvalidState`] when the range has no resident root.
    /// See [`Self::map`] for misuse errors; committing never allocates.
    pub fn commit(
        &mut self,
        target: &LevelFormat,
        va_lo: VirtAddr,
        va_hi: VirtAddr,
    ) -> Result<(), WalkError> {
        let target = self.resolve_target(target)?;
        self.check_range(va_lo, va_hi)?;
        debug!("commit {va_lo}..={va_hi}");

        let (lo, hi) = (va_lo.as_u64(), va_hi.as_u64());
        let mut core = self.core();
        let root_key = core.root_acquire(lo, hi, true)?;
        let mut op = OpKind::Commit { target };
        core.process_pdes(&mut op, NodeId::ROOT, root_key, lo, hi)
    }

    /// Relocates the backing of the `fmt`-level instance covering `va` to
    /// `new_backing` of `new_size` bytes, then frees the old backing.
    /// Unless `update_parent` is false, the referencing parent entry (or
    /// the PDB) is rewritten to the new location.
    ///
    /// # Errors
    /// [`WalkError::InvalidArgument`] when no such instance is resident or
    /// the size is not a whole number of entries.
    pub fn migrate_instance(
        &mut self,
        fmt: &LevelFormat,
        va: VirtAddr,
        new_backing: B::Backing,
        new_size: usize,
        update_parent: bool,
    ) -> Result<(), WalkError> {
        let node = self.resolve_target(fmt)?;
        let key = self.levels[node.0].fmt.level_va_lo(va).as_u64();
        debug!("migrate instance at {va}");
        self.core()
            .migrate_instance(node, key, new_backing, new_size, update_parent)
    }

    /// Frees every resident instance without unwinding entry state, and
    /// clears the PDB. Only for tearing down an entire address space at
    /// once; the walker is empty but reusable afterwards.
    pub fn force_free_instances(&mut self) {
        debug!("force-freeing all resident instances");
        self.core().force_free(NodeId::ROOT);
    }

    /// Tracking state of the `fmt`-level instance covering `va`, if
    /// resident.
    #[must_use]
    pub fn instance(&self, fmt: &LevelFormat, va: VirtAddr) -> Option<&LevelInstance<B::Backing>> {
        let node = level::find_level(&self.levels, fmt)?;
        let key = self.levels[node.0].fmt.level_va_lo(va).as_u64();
        self.levels[node.0].instances.get(&key)
    }

    /// All resident instances with their level format and base address.
    pub fn instances(
        &self,
    ) -> impl Iterator<Item = (&'f LevelFormat, VirtAddr, &LevelInstance<B::Backing>)> {
        self.levels.iter().flat_map(|level| {
            level
                .instances
                .iter()
                .map(move |(&key, inst)| (level.fmt, VirtAddr::new(key), inst))
        })
    }

    /// Total number of resident level instances.
    #[must_use]
    pub fn resident_instances(&self) -> usize {
        self.levels.iter().map(|level| level.instances.len()).sum()
    }

    #[must_use]
    pub fn flags(&self) -> WalkFlags {
        self.flags
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn core(&mut self) -> WalkCore<'_, 'f, B> {
        WalkCore {
            levels: &mut self.levels,
            backend: &mut self.backend,
            flags: self.flags,
            invalidate_on_reserve: self.invalidate_on_reserve,
        }
    }

    fn release_range(&mut self, target: NodeId, lo: u64, hi: u64) -> Result<(), WalkError> {
        let mut core = self.core();
        let Some(root_key) = core.root_key() else {
            return Ok(());
        };
        let mut op = OpKind::Release { target };
        let result = core.process_pdes(&mut op, NodeId::ROOT, root_key, lo, hi);
        let released = core.root_release();
        result?;
        released
    }

    fn resolve_target(&self, fmt: &LevelFormat) -> Result<NodeId, WalkError> {
        level::find_level(&self.levels, fmt).ok_or(WalkError::LevelNotFound)
    }

    fn check_range(&self, va_lo: VirtAddr, va_hi: VirtAddr) -> Result<(), WalkError> {
        let root = self.levels[NodeId::ROOT.0].fmt;
        if va_lo > va_hi || va_hi.as_u64() > root.level_va_hi(VirtAddr::new(0)).as_u64() {
            return Err(WalkError::InvalidArgument);
        }
        Ok(())
    }

    /// Level-targeted ranges must align to the target's full page size.
    fn check_alignment(
        &self,
        va_lo: VirtAddr,
        va_hi: VirtAddr,
        target: NodeId,
    ) -> Result<(), WalkError> {
        let page_size = self.levels[target.0].fmt.page_size();
        // Mask form: `va_hi + 1` would overflow on a range ending at the
        // top of the address space.
        if va_lo.as_u64() & (page_size - 1) != 0
            || va_hi.as_u64() & (page_size - 1) != page_size - 1
        {
            return Err(WalkError::Misaligned);
        }
        Ok(())
    }

    /// Untargeted ranges must align to the finest page size in the tree.
    fn check_leaf_alignment(&self, va_lo: VirtAddr, va_hi: VirtAddr) -> Result<(), WalkError> {
        let page_size = self
            .levels
            .iter()
            .filter(|level| level.fmt.is_leaf)
            .map(|level| level.fmt.page_size())
            .min()
            .unwrap_or_else(|| self.levels[NodeId::ROOT.0].fmt.page_size());
        if va_lo.as_u64() & (page_size - 1) != 0
            || va_hi.as_u64() & (page_size - 1) != page_size - 1
        {
            return Err(WalkError::Misaligned);
        }
        Ok(())
    }
}
