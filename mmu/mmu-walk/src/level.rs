//! The walker's mirror of the format tree.
//!
//! The format tree is flattened into an arena of [`Level`] nodes indexed by
//! [`NodeId`], with the root at index zero. Each node owns the resident
//! instances of that level, keyed by the base virtual address the instance
//! covers. Instances come and go during walks; the arena itself is fixed at
//! construction.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use mmu_fmt::LevelFormat;

use crate::instance::LevelInstance;

/// Index of a level node in the walker's arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NodeId(pub usize);

impl NodeId {
    pub(crate) const ROOT: Self = Self(0);
}

/// One level of the format tree plus its resident instances.
pub(crate) struct Level<'f, B> {
    pub fmt: &'f LevelFormat,
    pub parent: Option<NodeId>,
    pub sub_levels: Vec<NodeId>,
    /// Resident instances keyed by the instance's base virtual address.
    pub instances: BTreeMap<u64, LevelInstance<B>>,
}

/// Flattens `root` into an arena, parents before children.
pub(crate) fn build_levels<B>(root: &LevelFormat) -> Vec<Level<'_, B>> {
    let mut levels = Vec::new();
    push_level(&mut levels, root, None);
    levels
}

fn push_level<'f, B>(
    levels: &mut Vec<Level<'f, B>>,
    fmt: &'f LevelFormat,
    parent: Option<NodeId>,
) -> NodeId {
    let id = NodeId(levels.len());
    levels.push(Level {
        fmt,
        parent,
        sub_levels: Vec::new(),
        instances: BTreeMap::new(),
    });
    for sub in &fmt.sub_levels {
        let child = push_level(levels, sub, Some(id));
        levels[id.0].sub_levels.push(child);
    }
    id
}

/// Finds the arena node for `fmt` by identity, not by value: the caller must
/// pass a reference into the same format tree the walker was built over.
pub(crate) fn find_level<B>(levels: &[Level<'_, B>], fmt: &LevelFormat) -> Option<NodeId> {
    levels
        .iter()
        .position(|level| core::ptr::eq(level.fmt, fmt))
        .map(NodeId)
}
