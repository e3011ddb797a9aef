//! The host-side boundary of the walk engine.
//!
//! The walker never touches page-table memory itself. Everything that reads
//! or writes backing memory goes through a [`WalkBackend`] implementation,
//! which owns entry encodings, memory allocation and TLB maintenance. The
//! walker only tracks which entries are in which state and when a level
//! instance must exist, grow or be freed.

use mmu_fmt::{LevelFormat, VirtAddr};

/// The backend could not allocate backing memory.
///
/// The walker maps this to [`WalkError::OutOfMemory`](crate::WalkError) and
/// rolls back the partially applied operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backing allocation failed")]
pub struct AllocError;

/// Bulk fill pattern for a run of entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FillState {
    /// Entries encode "not present".
    Invalid,
    /// Entries encode the sparse (read-as-zero) pattern.
    Sparse,
    /// Big-page entries encode the NV4K "fine table elsewhere" pattern.
    Nv4k,
}

/// Outcome of a [`WalkBackend::level_alloc`] request.
pub enum LevelAlloc<B> {
    /// The current backing already covers the requested limit.
    Retain,
    /// New backing of `size` bytes, covering entries from the level base up
    /// to at least the requested limit. The walker copies the old entries
    /// over, frees the old backing and initializes the grown tail.
    New { backing: B, size: usize },
}

/// Host callbacks the walker drives page-table memory through.
///
/// Bulk callbacks (`fill_entries`, `copy_entries`, `map_next_entries`)
/// report how many entries they processed; anything short of the requested
/// count is treated as corruption and aborts the walk.
pub trait WalkBackend {
    /// Opaque handle to one level instance's backing memory.
    type Backing;

    /// Caller-owned state threaded through a map operation, advanced once
    /// per produced entry batch.
    type MapCursor;

    /// Allocate or grow backing for the level instance based at `va_base`,
    /// sized to cover `va_limit`.
    ///
    /// `target` is true when this level is the operation's target (a
    /// partial allocation sized to the limit is acceptable); otherwise the
    /// instance is an intermediate directory and should be fully sized.
    /// `current` carries the existing backing on a growth request; returning
    /// [`LevelAlloc::Retain`] keeps it.
    fn level_alloc(
        &mut self,
        fmt: &LevelFormat,
        va_base: VirtAddr,
        va_limit: VirtAddr,
        target: bool,
        current: Option<&Self::Backing>,
    ) -> Result<LevelAlloc<Self::Backing>, AllocError>;

    /// Free backing previously returned from [`Self::level_alloc`].
    fn level_free(&mut self, fmt: &LevelFormat, va_base: VirtAddr, backing: Self::Backing);

    /// Point the hardware page-directory base at `root`, or clear it when
    /// `root` is `None`. Returns false if the update could not be applied.
    fn write_pdb(&mut self, root_fmt: &LevelFormat, root: Option<&Self::Backing>) -> bool;

    /// Write the directory entry `index` in `dir` to reference the given
    /// sub-level instances. Absent sub-levels are `None`. Returns false if
    /// the entry could not be written.
    fn write_pde(
        &mut self,
        fmt: &LevelFormat,
        dir: &Self::Backing,
        index: usize,
        sub_levels: [Option<&Self::Backing>; mmu_fmt::MAX_SUB_LEVELS],
    ) -> bool;

    /// Fill entries `[index_lo, index_hi]` of `backing` with `state`,
    /// returning the number of entries written.
    fn fill_entries(
        &mut self,
        fmt: &LevelFormat,
        backing: &Self::Backing,
        index_lo: usize,
        index_hi: usize,
        state: FillState,
    ) -> usize;

    /// Copy entries `[index_lo, index_hi]` from `src` to `dst` during level
    /// growth, returning the number of entries copied.
    fn copy_entries(
        &mut self,
        fmt: &LevelFormat,
        src: &Self::Backing,
        dst: &Self::Backing,
        index_lo: usize,
        index_hi: usize,
    ) -> usize;

    /// Produce the next PTEs of a map operation into entries
    /// `[index_lo, index_hi]` of `backing`, returning the number written.
    fn map_next_entries(
        &mut self,
        cursor: &mut Self::MapCursor,
        fmt: &LevelFormat,
        backing: &Self::Backing,
        index_lo: usize,
        index_hi: usize,
    ) -> usize;
}
