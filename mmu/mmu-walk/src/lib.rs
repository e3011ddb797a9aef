//! Format-agnostic page-table walk engine.
//!
//! Drives map, unmap, sparsify, reserve/release, commit and migrate
//! operations over an N-level translation hierarchy described by a
//! [`mmu_fmt::LevelFormat`] tree. The engine knows nothing about entry
//! encodings or where page-table memory lives; every memory access goes
//! through the host's [`WalkBackend`] implementation. What the engine owns
//! is the bookkeeping: which level instances are resident, how big they
//! are, and the state and pin counts of every entry, so that instances are
//! allocated at first use, grown on demand and freed the moment nothing
//! references them.
//!
//! Levels allocate lazily and partially: a page table backing only the
//! mapped prefix of its span grows when a walk extends past it, with
//! existing entries copied bit-for-bit to the new backing.
//!
//! A format level may carry two parallel sub-levels (big and small page
//! tables sharing one directory entry); the engine keeps only one side
//! translating any given address and, in address-translation-service mode,
//! maintains NV4K markers in the big table for ranges whose small entries
//! hold no valid mapping.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod backend;
mod walker;
mod error;
mod instance;
mod level;
mod walk;

#[cfg(test)]
mod tests;

pub use backend::{AllocError, FillState, LevelAlloc, WalkBackend};
pub use error::WalkError;
pub use instance::{EntryState, LevelInstance};
pub use walk::{Walk, WalkFlags};
