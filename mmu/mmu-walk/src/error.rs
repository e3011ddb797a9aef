use mmu_fmt::FormatError;

use crate::backend::AllocError;

/// Error returned by every top-level walk operation.
///
/// One result covers the whole requested range; there is no partial-range
/// success reporting. Misuse variants are returned before any mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// The backend could not provide backing memory for a level instance.
    #[error("level backing allocation failed")]
    OutOfMemory,

    /// The requested range is empty, inverted or outside the root span.
    #[error("invalid virtual address range")]
    InvalidArgument,

    /// Level-granular operations require ranges aligned to the target
    /// level's full page size.
    #[error("virtual address range not aligned to the target level page size")]
    Misaligned,

    /// The operation targets a format level that is not part of this
    /// walker's format tree.
    #[error("target level not found in the format tree")]
    LevelNotFound,

    /// The format tree handed to [`Walk::new`](crate::Walk::new) is
    /// structurally unsound.
    #[error("invalid level format: {0}")]
    Format(#[from] FormatError),

    /// Internal bookkeeping no longer matches the backing structures, e.g. a
    /// bulk callback reported less progress than requested. Not recoverable.
    #[error("walk state corrupted")]
    InvalidState,
}

impl From<AllocError> for WalkError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}
