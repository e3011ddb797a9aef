//! # Page-Level Format Descriptors
//!
//! Format descriptions for N-level page-table hierarchies, together with the
//! virtual-address index math a walker needs to traverse them.
//!
//! A translation hierarchy is described as an immutable tree of
//! [`LevelFormat`] nodes. Each node covers a contiguous slice of
//! virtual-address bits and owns zero, one or two sub-level descriptors:
//!
//! - **0 sub-levels**: a page table; its entries are leaf mappings.
//! - **1 sub-level**: a plain page directory.
//! - **2 sub-levels**: a dual arrangement where one parent slot selects
//!   between a coarse ("big page") and a fine ("small page") table covering
//!   the same virtual range.
//!
//! ```text
//!  root directory          bits 47..39
//!    └── directory         bits 38..30
//!          ├── big table   bits 29..16   (64 KiB pages)
//!          └── small table bits 29..12   ( 4 KiB pages)
//! ```
//!
//! The descriptors are format-only: they say how addresses split into entry
//! indices and how large entries are, never what the entry bits mean. Entry
//! encoding belongs to the host driving the walker.
//!
//! All helpers here are pure bit math over [`VirtAddr`] and entry indices;
//! they allocate nothing and hold no state.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod addr;
mod level;

pub use crate::addr::VirtAddr;
pub use crate::level::{FormatError, LevelFormat, MAX_SUB_LEVELS, aligned_entry_indices};
