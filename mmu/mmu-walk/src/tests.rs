//! Scenario tests driving the walker through a mock backend.
//!
//! The backend models page-table memory as word vectors with a simple
//! 64-bit entry encoding, records every callback as an event and can be
//! told to fail allocations, so tests can check both the walker's tracking
//! and the exact memory traffic it generates.

use std::collections::BTreeMap;

use bitfield_struct::bitfield;

use mmu_fmt::{LevelFormat, VirtAddr};

use crate::backend::{AllocError, FillState, LevelAlloc, WalkBackend};
use crate::error::WalkError;
use crate::instance::EntryState;
use crate::walk::{Walk, WalkFlags};

const KIND_INVALID: u8 = 0;
const KIND_SPARSE: u8 = 1;
const KIND_NV4K: u8 = 2;
const KIND_PTE: u8 = 3;
const KIND_PDE: u8 = 4;

/// Mock 64-bit entry. For PTEs `lo` is the frame number; for PDEs `lo` and
/// `hi` are the big/small table ids plus one (zero meaning absent).
#[bitfield(u64)]
struct MockEntry {
    #[bits(4)]
    kind: u8,
    #[bits(28)]
    lo: u32,
    #[bits(28)]
    hi: u32,
    #[bits(4)]
    __: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Alloc { id: usize, size: usize },
    Free { id: usize },
    Fill { id: usize, lo: usize, hi: usize, state: FillState },
    Copy { src: usize, dst: usize, lo: usize, hi: usize },
    WritePde { id: usize, index: usize },
    WritePdb(Option<usize>),
}

#[derive(Default)]
struct MockBackend {
    tables: BTreeMap<usize, Vec<u64>>,
    next_id: usize,
    pdb: Option<usize>,
    events: Vec<Event>,
    /// Fail any allocation once this many have succeeded.
    fail_after_allocs: Option<usize>,
    allocs: usize,
    frees: usize,
}

struct MockCursor {
    next_pfn: u32,
}

impl MockBackend {
    fn create_table(&mut self, size: usize) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.tables.insert(id, vec![0u64; size / 8]);
        self.allocs += 1;
        self.events.push(Event::Alloc { id, size });
        id
    }

    fn words(&self, id: usize) -> &[u64] {
        &self.tables[&id]
    }

    fn kind(&self, id: usize, index: usize) -> u8 {
        MockEntry::from_bits(self.tables[&id][index]).kind()
    }

    fn balanced(&self) -> bool {
        self.allocs == self.frees
    }

    fn fill_word(state: FillState) -> u64 {
        let kind = match state {
            FillState::Invalid => KIND_INVALID,
            FillState::Sparse => KIND_SPARSE,
            FillState::Nv4k => KIND_NV4K,
        };
        MockEntry::new().with_kind(kind).into_bits()
    }
}

impl WalkBackend for MockBackend {
    type Backing = usize;
    type MapCursor = MockCursor;

    fn level_alloc(
        &mut self,
        fmt: &LevelFormat,
        _va_base: VirtAddr,
        va_limit: VirtAddr,
        target: bool,
        current: Option<&usize>,
    ) -> Result<LevelAlloc<usize>, AllocError> {
        let entries = if target {
            fmt.entry_index(va_limit) + 1
        } else {
            fmt.entry_count()
        };
        let size = entries * fmt.entry_size;
        if let Some(&id) = current {
            if self.tables[&id].len() * 8 >= size {
                return Ok(LevelAlloc::Retain);
            }
        }
        if let Some(limit) = self.fail_after_allocs {
            if self.allocs >= limit {
                return Err(AllocError);
            }
        }
        let id = self.create_table(size);
        Ok(LevelAlloc::New { backing: id, size })
    }

    fn level_free(&mut self, _fmt: &LevelFormat, _va_base: VirtAddr, backing: usize) {
        assert!(self.tables.remove(&backing).is_some(), "double free");
        self.frees += 1;
        self.events.push(Event::Free { id: backing });
    }

    fn write_pdb(&mut self, _root_fmt: &LevelFormat, root: Option<&usize>) -> bool {
        self.pdb = root.copied();
        self.events.push(Event::WritePdb(self.pdb));
        true
    }

    fn write_pde(
        &mut self,
        _fmt: &LevelFormat,
        dir: &usize,
        index: usize,
        sub_levels: [Option<&usize>; mmu_fmt::MAX_SUB_LEVELS],
    ) -> bool {
        let word = MockEntry::new()
            .with_kind(KIND_PDE)
            .with_lo(sub_levels[0].map_or(0, |&id| id as u32 + 1))
            .with_hi(sub_levels[1].map_or(0, |&id| id as u32 + 1))
            .into_bits();
        self.tables.get_mut(dir).expect("missing directory")[index] = word;
        self.events.push(Event::WritePde { id: *dir, index });
        true
    }

    fn fill_entries(
        &mut self,
        _fmt: &LevelFormat,
        backing: &usize,
        index_lo: usize,
        index_hi: usize,
        state: FillState,
    ) -> usize {
        let word = Self::fill_word(state);
        let table = self.tables.get_mut(backing).expect("missing table");
        for entry in &mut table[index_lo..=index_hi] {
            *entry = word;
        }
        self.events.push(Event::Fill {
            id: *backing,
            lo: index_lo,
            hi: index_hi,
            state,
        });
        index_hi - index_lo + 1
    }

    fn copy_entries(
        &mut self,
        _fmt: &LevelFormat,
        src: &usize,
        dst: &usize,
        index_lo: usize,
        index_hi: usize,
    ) -> usize {
        let words: Vec<u64> = self.tables[src][index_lo..=index_hi].to_vec();
        self.tables.get_mut(dst).expect("missing table")[index_lo..=index_hi]
            .copy_from_slice(&words);
        self.events.push(Event::Copy {
            src: *src,
            dst: *dst,
            lo: index_lo,
            hi: index_hi,
        });
        index_hi - index_lo + 1
    }

    fn map_next_entries(
        &mut self,
        cursor: &mut MockCursor,
        _fmt: &LevelFormat,
        backing: &usize,
        index_lo: usize,
        index_hi: usize,
    ) -> usize {
        let table = self.tables.get_mut(backing).expect("missing table");
        for entry in &mut table[index_lo..=index_hi] {
            *entry = MockEntry::new()
                .with_kind(KIND_PTE)
                .with_lo(cursor.next_pfn)
                .into_bits();
            cursor.next_pfn += 1;
        }
        index_hi - index_lo + 1
    }
}

/// Root directory of nine VA bits over one 4 KiB page table.
fn two_level() -> LevelFormat {
    LevelFormat::directory(29, 21, 8, vec![LevelFormat::page_table(20, 12, 8)])
}

/// Root directory over parallel 64 KiB big and 4 KiB small page tables.
fn dual_level() -> LevelFormat {
    LevelFormat::directory(
        29,
        21,
        8,
        vec![
            LevelFormat::page_table(20, 16, 8),
            LevelFormat::page_table(20, 12, 8),
        ],
    )
}

fn walker(fmt: &LevelFormat) -> Walk<'_, MockBackend> {
    Walk::new(fmt, MockBackend::default(), WalkFlags::default()).unwrap()
}

fn ats_walker(fmt: &LevelFormat) -> Walk<'_, MockBackend> {
    Walk::new(fmt, MockBackend::default(), WalkFlags { ats: true }).unwrap()
}

fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

fn map(walk: &mut Walk<'_, MockBackend>, target: &LevelFormat, lo: u64, hi: u64) {
    let mut cursor = MockCursor { next_pfn: 0 };
    walk.map(va(lo), va(hi), target, &mut cursor).unwrap();
}

/// Recomputes every counter from a fresh per-entry scan and compares it to
/// the incrementally maintained value.
fn assert_counters_consistent(walk: &Walk<'_, MockBackend>) {
    for (fmt, base, inst) in walk.instances() {
        let mut valid = 0;
        let mut sparse = 0;
        let mut reserved = 0;
        let mut hybrid = 0;
        let mut nv4k = 0;
        for index in 0..inst.entry_count() {
            match inst.state(index) {
                EntryState::Pte | EntryState::Pde => valid += 1,
                EntryState::Sparse => sparse += 1,
                EntryState::Nv4k => nv4k += 1,
                EntryState::Invalid => {}
            }
            reserved += u32::from(inst.reserved(index));
            hybrid += u32::from(inst.hybrid(index));
        }
        let level = (fmt.va_bit_hi, fmt.va_bit_lo, base);
        assert_eq!(inst.num_valid(), valid, "numValid at {level:?}");
        assert_eq!(inst.num_sparse(), sparse, "numSparse at {level:?}");
        assert_eq!(inst.num_reserved(), reserved, "numReserved at {level:?}");
        assert_eq!(inst.num_hybrid(), hybrid, "numHybrid at {level:?}");
        assert_eq!(inst.num_nv4k(), nv4k, "numNv4k at {level:?}");
    }
}

#[test]
fn map_unmap_round_trip() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    // ten pages under the second root entry
    map(&mut walk, pt, 0x20_0000, 0x20_9FFF);
    assert_eq!(walk.resident_instances(), 2);
    assert_counters_consistent(&walk);

    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(1), EntryState::Pde);
    let leaf = walk.instance(pt, va(0x20_0000)).unwrap();
    assert_eq!(leaf.num_valid(), 10);
    for index in 0..10 {
        assert_eq!(leaf.state(index), EntryState::Pte);
    }

    let root_id = walk.backend().pdb.unwrap();
    assert_eq!(walk.backend().kind(root_id, 1), KIND_PDE);

    walk.unmap(va(0x20_0000), va(0x20_9FFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert_eq!(walk.backend().pdb, None);
    assert!(walk.backend().balanced());
}

#[test]
fn sparsify_is_idempotent() {
    let fmt = two_level();
    let mut walk = walker(&fmt);

    let range = (va(0x20_0000), va(0x5F_FFFF));
    walk.sparsify(range.0, range.1).unwrap();
    let first: Vec<_> = walk
        .instances()
        .map(|(f, base, inst)| {
            (
                f.va_bit_lo,
                base,
                inst.num_valid(),
                inst.num_sparse(),
                inst.num_reserved(),
            )
        })
        .collect();
    assert_counters_consistent(&walk);

    walk.sparsify(range.0, range.1).unwrap();
    let second: Vec<_> = walk
        .instances()
        .map(|(f, base, inst)| {
            (
                f.va_bit_lo,
                base,
                inst.num_valid(),
                inst.num_sparse(),
                inst.num_reserved(),
            )
        })
        .collect();
    assert_eq!(first, second);
    assert_counters_consistent(&walk);

    // fully covered root entries go sparse without child tables
    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(1), EntryState::Sparse);
    assert_eq!(root.state(2), EntryState::Sparse);
    assert_eq!(walk.resident_instances(), 1);
}

#[test]
fn unmap_splits_sparse_remainders() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    // root entry 0 goes sparse as a whole, no page table yet
    walk.sparsify(va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 1);

    // punching a hole forces the sparse coverage down into a page table
    walk.unmap(va(0x3000), va(0x5FFF)).unwrap();
    let leaf = walk.instance(pt, va(0)).unwrap();
    for index in 0..3 {
        assert_eq!(leaf.state(index), EntryState::Sparse, "entry {index}");
    }
    for index in 3..6 {
        assert_eq!(leaf.state(index), EntryState::Invalid, "entry {index}");
    }
    for index in 6..512 {
        assert_eq!(leaf.state(index), EntryState::Sparse, "entry {index}");
    }
    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(0), EntryState::Pde);
    assert_counters_consistent(&walk);

    // the remainder is still sparse, so nothing was freed
    walk.unmap(va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn reserve_release_inverse() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    map(&mut walk, pt, 0x20_0000, 0x20_9FFF);
    let before: Vec<_> = walk
        .instances()
        .map(|(f, base, inst)| (f.va_bit_lo, base, inst.num_valid(), inst.num_reserved()))
        .collect();

    walk.reserve(pt, va(0x20_0000), va(0x3F_FFFF), true).unwrap();
    let leaf = walk.instance(pt, va(0x20_0000)).unwrap();
    assert_eq!(leaf.num_reserved(), 512);
    assert_eq!(leaf.num_valid(), 10);
    assert_counters_consistent(&walk);

    walk.release(pt, va(0x20_0000), va(0x3F_FFFF)).unwrap();
    let after: Vec<_> = walk
        .instances()
        .map(|(f, base, inst)| (f.va_bit_lo, base, inst.num_valid(), inst.num_reserved()))
        .collect();
    assert_eq!(before, after);
    assert_counters_consistent(&walk);
}

#[test]
fn reserve_pins_empty_tables() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    walk.reserve(pt, va(0), va(0x1F_FFFF), true).unwrap();
    assert_eq!(walk.resident_instances(), 2);
    let leaf = walk.instance(pt, va(0)).unwrap();
    assert_eq!(leaf.num_valid(), 0);
    assert_eq!(leaf.num_reserved(), 512);

    // mapping and unmapping inside the reservation keeps the table
    map(&mut walk, pt, 0x1000, 0x3FFF);
    walk.unmap(va(0x1000), va(0x3FFF)).unwrap();
    assert_eq!(walk.resident_instances(), 2);
    assert_counters_consistent(&walk);

    walk.release(pt, va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn growth_copies_existing_entries() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    let mut cursor = MockCursor { next_pfn: 7 };
    walk.map(va(0), va(0x3FFF), pt, &mut cursor).unwrap();
    let first_id = *walk
        .instance(pt, va(0))
        .unwrap()
        .backing()
        .unwrap();
    let first_words: Vec<u64> = walk.backend().words(first_id)[0..4].to_vec();

    walk.map(va(0x4000), va(0x13FFF), pt, &mut cursor).unwrap();
    let second_id = *walk
        .instance(pt, va(0))
        .unwrap()
        .backing()
        .unwrap();
    assert_ne!(first_id, second_id);

    let events = &walk.backend().events;
    assert!(events.contains(&Event::Copy {
        src: first_id,
        dst: second_id,
        lo: 0,
        hi: 3,
    }));
    assert!(events.contains(&Event::Fill {
        id: second_id,
        lo: 4,
        hi: 19,
        state: FillState::Invalid,
    }));
    assert!(events.contains(&Event::Free { id: first_id }));

    // the four original entries survive bit for bit
    assert_eq!(&walk.backend().words(second_id)[0..4], &first_words[..]);
    let leaf = walk.instance(pt, va(0)).unwrap();
    assert_eq!(leaf.num_valid(), 20);
    assert_counters_consistent(&walk);
}

#[test]
fn map_failure_rolls_back() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);
    walk.backend_mut().fail_after_allocs = Some(1);

    let mut cursor = MockCursor { next_pfn: 0 };
    let err = walk.map(va(0), va(0x3FFF), pt, &mut cursor).unwrap_err();
    assert_eq!(err, WalkError::OutOfMemory);
    assert_eq!(walk.resident_instances(), 0);
    assert_eq!(walk.backend().pdb, None);
    assert!(walk.backend().balanced());
}

#[test]
fn conflict_resolution_preserves_sparse_boundaries() {
    let fmt = dual_level();
    let big = &fmt.sub_levels[0];
    let small = &fmt.sub_levels[1];
    let mut walk = walker(&fmt);

    // sparse coverage held by big entries 0..=2
    walk.sparsify(va(0), va(0x2_FFFF)).unwrap();
    let big_inst = walk.instance(big, va(0)).unwrap();
    for index in 0..3 {
        assert_eq!(big_inst.state(index), EntryState::Sparse);
    }

    // map small pages straddling big entries 0 and 1
    map(&mut walk, small, 0x8000, 0x1_7FFF);

    let small_inst = walk.instance(small, va(0)).unwrap();
    for index in 0..8 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }
    for index in 8..24 {
        assert_eq!(small_inst.state(index), EntryState::Pte, "entry {index}");
    }
    for index in 24..32 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }

    let big_inst = walk.instance(big, va(0)).unwrap();
    assert_eq!(big_inst.state(0), EntryState::Invalid);
    assert_eq!(big_inst.state(1), EntryState::Invalid);
    assert_eq!(big_inst.state(2), EntryState::Sparse);
    assert_counters_consistent(&walk);
}

#[test]
fn nv4k_demotion_and_promotion() {
    let fmt = dual_level();
    let big = &fmt.sub_levels[0];
    let small = &fmt.sub_levels[1];
    let mut walk = ats_walker(&fmt);

    // small mappings over big entries 0 and 1
    map(&mut walk, small, 0, 0x1_FFFF);
    let big_inst = walk.instance(big, va(0)).unwrap();
    assert_eq!(big_inst.entry_count(), 32);
    assert_eq!(big_inst.state(0), EntryState::Invalid);
    assert_eq!(big_inst.state(1), EntryState::Invalid);
    assert_eq!(big_inst.num_nv4k(), 30);
    let big_id = *big_inst.backing().unwrap();
    assert_eq!(walk.backend().kind(big_id, 2), KIND_NV4K);

    // dropping all small entries under big entry 0 demotes it back
    walk.unmap(va(0), va(0xFFFF)).unwrap();
    let big_inst = walk.instance(big, va(0)).unwrap();
    assert_eq!(big_inst.state(0), EntryState::Nv4k);
    assert_eq!(big_inst.state(1), EntryState::Invalid);
    assert_eq!(walk.backend().kind(big_id, 0), KIND_NV4K);
    assert_counters_consistent(&walk);

    // mapping one small page under big entry 0 promotes it again
    map(&mut walk, small, 0, 0xFFF);
    let big_inst = walk.instance(big, va(0)).unwrap();
    assert_eq!(big_inst.state(0), EntryState::Invalid);
    assert_counters_consistent(&walk);

    // removing everything tears the pair down completely
    walk.unmap(va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn commit_restores_directory_programming() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    map(&mut walk, pt, 0x20_0000, 0x20_9FFF);
    let root_id = walk.backend().pdb.unwrap();
    let leaf_id = *walk.instance(pt, va(0x20_0000)).unwrap().backing().unwrap();
    let leaf_words: Vec<u64> = walk.backend().words(leaf_id).to_vec();

    // lose the volatile programming
    walk.backend_mut().pdb = None;
    walk.backend_mut().tables.get_mut(&root_id).unwrap()[1] = 0;
    let allocs_before = walk.backend().allocs;

    walk.commit(pt, va(0x20_0000), va(0x20_9FFF)).unwrap();
    assert_eq!(walk.backend().pdb, Some(root_id));
    assert_eq!(walk.backend().kind(root_id, 1), KIND_PDE);
    assert_eq!(walk.backend().words(leaf_id), &leaf_words[..]);
    assert_eq!(walk.backend().allocs, allocs_before);
}

#[test]
fn commit_without_root_fails() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);
    assert_eq!(
        walk.commit(pt, va(0), va(0x1F_FFFF)),
        Err(WalkError::InvalidState)
    );
}

#[test]
fn migrate_relocates_backing() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    map(&mut walk, pt, 0x20_0000, 0x20_9FFF);
    let root_id = walk.backend().pdb.unwrap();
    let old_id = *walk.instance(pt, va(0x20_0000)).unwrap().backing().unwrap();
    let old_words: Vec<u64> = walk.backend().words(old_id).to_vec();

    let new_id = walk.backend_mut().create_table(16 * 8);
    walk.migrate_instance(pt, va(0x20_0000), new_id, 16 * 8, true)
        .unwrap();

    assert!(!walk.backend().tables.contains_key(&old_id));
    assert_eq!(&walk.backend().words(new_id)[0..10], &old_words[..]);
    for index in 10..16 {
        assert_eq!(walk.backend().kind(new_id, index), KIND_INVALID);
    }
    let entry = MockEntry::from_bits(walk.backend().words(root_id)[1]);
    assert_eq!(entry.kind(), KIND_PDE);
    assert_eq!(entry.lo(), new_id as u32 + 1);

    // the root moves the same way through the directory-base pointer
    let new_root = walk.backend_mut().create_table(512 * 8);
    walk.migrate_instance(&fmt, va(0), new_root, 512 * 8, true)
        .unwrap();
    assert_eq!(walk.backend().pdb, Some(new_root));

    walk.unmap(va(0x20_0000), va(0x20_9FFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn migrate_requires_resident_instance() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);
    let id = walk.backend_mut().create_table(512 * 8);
    assert_eq!(
        walk.migrate_instance(pt, va(0), id, 512 * 8, true),
        Err(WalkError::InvalidArgument)
    );
    // the rejected backing was handed back
    assert!(!walk.backend().tables.contains_key(&id));
}

#[test]
fn force_free_releases_everything() {
    let fmt = dual_level();
    let small = &fmt.sub_levels[1];
    let mut walk = ats_walker(&fmt);

    map(&mut walk, small, 0, 0x1_FFFF);
    walk.sparsify(va(0x20_0000), va(0x3F_FFFF)).unwrap();
    walk.reserve(small, va(0x40_0000), va(0x5F_FFFF), true).unwrap();
    assert!(walk.resident_instances() > 3);

    walk.force_free_instances();
    assert_eq!(walk.resident_instances(), 0);
    assert_eq!(walk.backend().pdb, None);
    assert!(walk.backend().tables.is_empty());
    assert!(walk.backend().balanced());

    // the walker stays usable afterwards
    map(&mut walk, small, 0, 0xFFF);
    assert_counters_consistent(&walk);
}

#[test]
fn unmap_of_empty_walker_is_a_noop() {
    let fmt = two_level();
    let mut walk = walker(&fmt);
    walk.unmap(va(0), va(0x1F_FFFF)).unwrap();
    assert!(walk.backend().events.is_empty());
}

#[test]
fn rejects_misuse() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);
    let mut cursor = MockCursor { next_pfn: 0 };

    // inverted range
    assert_eq!(
        walk.map(va(0x2000), va(0x1000), pt, &mut cursor),
        Err(WalkError::InvalidArgument)
    );
    // beyond the root span
    assert_eq!(
        walk.unmap(va(0), va(1 << 40)),
        Err(WalkError::InvalidArgument)
    );
    // not aligned to the target page size
    assert_eq!(
        walk.map(va(0x800), va(0x17FF), pt, &mut cursor),
        Err(WalkError::Misaligned)
    );
    // level from a different format tree
    let other = two_level();
    assert_eq!(
        walk.map(va(0), va(0xFFF), &other.sub_levels[0], &mut cursor),
        Err(WalkError::LevelNotFound)
    );
    assert_eq!(walk.resident_instances(), 0);
}

#[test]
fn partial_sparsify_lands_in_small_table() {
    let fmt = dual_level();
    let big = &fmt.sub_levels[0];
    let small = &fmt.sub_levels[1];
    let mut walk = walker(&fmt);

    // three 4 KiB pages; the big table cannot represent this range
    walk.sparsify(va(0x3000), va(0x5FFF)).unwrap();
    let small_inst = walk.instance(small, va(0)).unwrap();
    for index in 0..3 {
        assert_eq!(small_inst.state(index), EntryState::Invalid, "entry {index}");
    }
    for index in 3..6 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }
    assert!(walk.instance(big, va(0)).is_none());
    assert_counters_consistent(&walk);

    walk.unmap(va(0x3000), va(0x5FFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn unmap_hole_in_sparse_dual_entry() {
    let fmt = dual_level();
    let small = &fmt.sub_levels[1];
    let mut walk = walker(&fmt);

    // root entry 0 goes sparse as a whole, then a 4 KiB-granular hole
    // forces the coverage down into the small table
    walk.sparsify(va(0), va(0x1F_FFFF)).unwrap();
    walk.unmap(va(0x3000), va(0x5FFF)).unwrap();

    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(0), EntryState::Pde);
    let small_inst = walk.instance(small, va(0)).unwrap();
    for index in 0..3 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }
    for index in 3..6 {
        assert_eq!(small_inst.state(index), EntryState::Invalid, "entry {index}");
    }
    for index in 6..512 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }
    assert_counters_consistent(&walk);

    walk.unmap(va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn unmap_hole_preserves_big_backed_sparse() {
    let fmt = dual_level();
    let big = &fmt.sub_levels[0];
    let small = &fmt.sub_levels[1];
    let mut walk = walker(&fmt);

    // sparse coverage carried by big entries 0..=2
    walk.sparsify(va(0), va(0x2_FFFF)).unwrap();
    walk.unmap(va(0x1000), va(0x1FFF)).unwrap();

    // the hole goes through the small table; only big entry 0 moves
    let small_inst = walk.instance(small, va(0)).unwrap();
    assert_eq!(small_inst.state(0), EntryState::Sparse);
    assert_eq!(small_inst.state(1), EntryState::Invalid);
    for index in 2..16 {
        assert_eq!(small_inst.state(index), EntryState::Sparse, "entry {index}");
    }
    let big_inst = walk.instance(big, va(0)).unwrap();
    assert_eq!(big_inst.state(0), EntryState::Invalid);
    assert_eq!(big_inst.state(1), EntryState::Sparse);
    assert_eq!(big_inst.state(2), EntryState::Sparse);
    assert_counters_consistent(&walk);
}

#[test]
fn map_over_reserved_directory_leaves_hybrid_entry() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    // a 2 MiB mapping at the directory level over a reserved page table
    walk.reserve(pt, va(0x20_0000), va(0x3F_FFFF), true).unwrap();
    map(&mut walk, &fmt, 0x20_0000, 0x3F_FFFF);

    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(1), EntryState::Pte);
    assert!(root.hybrid(1));
    assert_eq!(root.num_hybrid(), 1);
    let root_id = walk.backend().pdb.unwrap();
    assert_eq!(walk.backend().kind(root_id, 1), KIND_PTE);
    // the reserved table survives underneath the mapping
    let leaf = walk.instance(pt, va(0x20_0000)).unwrap();
    assert_eq!(leaf.num_reserved(), 512);
    assert_counters_consistent(&walk);

    // dropping the reservation releases the sub-level through the hybrid
    // entry and invalidates it
    walk.release(pt, va(0x20_0000), va(0x3F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn uninitialized_reserve_skips_quiescent_fill() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    walk.reserve(pt, va(0), va(0x1F_FFFF), false).unwrap();
    let leaf = walk.instance(pt, va(0)).unwrap();
    assert_eq!(leaf.num_reserved(), 512);
    let leaf_id = *leaf.backing().unwrap();
    assert!(
        !walk
            .backend()
            .events
            .iter()
            .any(|event| matches!(event, Event::Fill { id, .. } if *id == leaf_id)),
        "reserved table was filled"
    );

    walk.release(pt, va(0), va(0x1F_FFFF)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn operations_at_top_of_address_space() {
    // a root span reaching bit 63, where `va_hi + 1` has no representation
    let fmt = LevelFormat::directory(63, 55, 8, vec![LevelFormat::page_table(54, 43, 8)]);
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    let page = pt.page_size();
    assert_eq!(
        walk.unmap(va(u64::MAX - 0xFFF), va(u64::MAX)),
        Err(WalkError::Misaligned)
    );

    walk.sparsify(va(u64::MAX - page + 1), va(u64::MAX)).unwrap();
    let root = walk.instance(&fmt, va(0)).unwrap();
    assert_eq!(root.state(511), EntryState::Pde);
    let leaf = walk.instance(pt, va(u64::MAX)).unwrap();
    assert_eq!(leaf.state(4095), EntryState::Sparse);
    assert_counters_consistent(&walk);

    walk.unmap(va(u64::MAX - page + 1), va(u64::MAX)).unwrap();
    assert_eq!(walk.resident_instances(), 0);
    assert!(walk.backend().balanced());
}

#[test]
fn map_over_sparse_keeps_remainder_sparse() {
    let fmt = two_level();
    let pt = &fmt.sub_levels[0];
    let mut walk = walker(&fmt);

    walk.sparsify(va(0), va(0x1F_FFFF)).unwrap();
    map(&mut walk, pt, 0x4000, 0x7FFF);

    let leaf = walk.instance(pt, va(0)).unwrap();
    for index in 0..4 {
        assert_eq!(leaf.state(index), EntryState::Sparse);
    }
    for index in 4..8 {
        assert_eq!(leaf.state(index), EntryState::Pte);
    }
    for index in 8..512 {
        assert_eq!(leaf.state(index), EntryState::Sparse, "entry {index}");
    }
    assert_counters_consistent(&walk);
}
