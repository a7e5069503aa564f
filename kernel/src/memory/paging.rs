//! x86-64 4-level page table walking and manipulation.
//!
//! Page tables are manipulated through a [`PhysMapper`], the window through
//! which physical frames are visible to the kernel (the higher-half direct
//! map during normal operation, an arena in tests). All four operations
//! return a [`PageTableAccess`] describing the touched path so callers can
//! reason about partially completed walks.
//!
//! Entry levels count down from the base page table: an entry referring to a
//! level-*n* page table has level *n*; a leaf entry referring to a page
//! frame has level 0. Level `0xFF` marks an invalid entry.

use super::pmm::FrameAllocator;
use bitflags::bitflags;

/// Number of entries in a page table.
pub const PAGE_TABLE_ENTRIES: u64 = 512;

/// Size of a page and of a page frame.
pub const PAGE_SIZE: u64 = 4096;

/// Physical address bits of a page table entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Level marker of an invalid entry.
pub const INVALID_LEVEL: u8 = 0xFF;

bitflags! {
    /// Architecture page table entry flags exposed by the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT          = 1 << 0;
        const WRITE_ALLOWED    = 1 << 1;
        const USER_MODE_ACCESS = 1 << 2;
        const WRITE_THROUGH    = 1 << 3;
        const CACHE_DISABLE    = 1 << 4;
        const ACCESSED         = 1 << 5;
        const DIRTY            = 1 << 6;
    }
}

/// A page table entry together with the hierarchy level of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub bits: u64,
    pub level: u8,
}

impl PageTableEntry {
    pub const INVALID: Self = Self {
        bits: 0,
        level: INVALID_LEVEL,
    };

    pub fn is_valid(&self) -> bool {
        self.level != INVALID_LEVEL
    }

    pub fn is_present(&self) -> bool {
        self.bits & PageFlags::PRESENT.bits() != 0
    }

    pub fn is_write_allowed(&self) -> bool {
        self.bits & PageFlags::WRITE_ALLOWED.bits() != 0
    }

    pub fn is_user_mode_access_allowed(&self) -> bool {
        self.bits & PageFlags::USER_MODE_ACCESS.bits() != 0
    }

    pub fn is_accessed(&self) -> bool {
        self.bits & PageFlags::ACCESSED.bits() != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.bits & PageFlags::DIRTY.bits() != 0
    }

    /// True when the entry refers to a page frame rather than another table.
    pub fn points_to_frame(&self) -> bool {
        self.level == 0
    }

    /// Physical address of the referred frame or table.
    pub fn address(&self) -> u64 {
        self.bits & ADDR_MASK
    }

    /// The raw flag word.
    pub fn flags(&self) -> u16 {
        (self.bits & !ADDR_MASK) as u16
    }
}

/// Access to physical memory contents through a kernel-visible window.
pub trait PhysMapper {
    /// Pointer through which the frame at `phys` can be read and written.
    fn phys_to_virt(&self, phys: u64) -> *mut u8;
}

/// The higher-half direct map: physical address plus a constant offset.
#[derive(Debug, Clone, Copy)]
pub struct HhdmMapper {
    pub offset: u64,
}

impl PhysMapper for HhdmMapper {
    fn phys_to_virt(&self, phys: u64) -> *mut u8 {
        (self.offset + phys) as *mut u8
    }
}

/// Handle to one page table: its physical address and hierarchy level.
///
/// The level-4 table is the *base page table* of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTable {
    pub phys: u64,
    pub level: u8,
}

impl PageTable {
    pub fn base(phys: u64) -> Self {
        Self { phys, level: 4 }
    }

    pub fn is_base_page_table(&self) -> bool {
        self.level == 4
    }

    /// The table as a pseudo page table entry (used as `path[4]`).
    pub fn as_entry(&self) -> PageTableEntry {
        PageTableEntry {
            bits: self.phys,
            level: self.level,
        }
    }

    fn slot(&self, mapper: &impl PhysMapper, index: u64) -> *mut u64 {
        debug_assert!(index < PAGE_TABLE_ENTRIES);
        unsafe { (mapper.phys_to_virt(self.phys) as *mut u64).add(index as usize) }
    }

    /// Read the entry at `index`. The entry's level is one below this
    /// table's level.
    pub fn entry(&self, mapper: &impl PhysMapper, index: u64) -> PageTableEntry {
        let bits = unsafe { self.slot(mapper, index).read_volatile() };
        PageTableEntry {
            bits,
            level: self.level - 1,
        }
    }

    /// Overwrite the entry at `index` with raw bits.
    pub fn update(&self, mapper: &impl PhysMapper, index: u64, bits: u64) {
        unsafe { self.slot(mapper, index).write_volatile(bits) };
    }

    /// Interpret the entry at `index` as the next-level page table.
    pub fn entry_as_table(&self, mapper: &impl PhysMapper, index: u64) -> PageTable {
        let entry = self.entry(mapper, index);
        PageTable {
            phys: entry.address(),
            level: self.level - 1,
        }
    }

    /// True when no entry in the table is present.
    pub fn is_empty(&self, mapper: &impl PhysMapper) -> bool {
        (0..PAGE_TABLE_ENTRIES).all(|i| !self.entry(mapper, i).is_present())
    }

    /// Zero-fill the table.
    pub fn clear(&self, mapper: &impl PhysMapper) {
        for i in 0..PAGE_TABLE_ENTRIES {
            self.update(mapper, i, 0);
        }
    }
}

/// Outcome of a page table access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableAccessStatus {
    Okay,
    /// The page was already mapped or an intermediate allocation failed.
    AllocError,
    /// Freeing the page frame failed.
    FreeError,
    /// An intermediate page table entry is missing.
    PageTableEntryMissing,
}

/// The result of walking (and possibly modifying) the page table hierarchy.
///
/// `path` is filled back to front: the base table pseudo-entry sits at
/// index 4 and the leaf entry at index 0. Entries below index `level` are
/// invalid; the number of valid entries is `5 - level`.
#[derive(Debug, Clone, Copy)]
pub struct PageTableAccess {
    pub status: PageTableAccessStatus,
    pub path: [PageTableEntry; 5],
    pub level: u8,
    /// `pt_leak_map[n]` is set when the level-`n` table's frame could not be
    /// freed while unwinding.
    pub pt_leak_map: [bool; 5],
    pub physical_address: u64,
    pub pte_after: PageTableEntry,
}

impl PageTableAccess {
    fn new(status: PageTableAccessStatus, level: u8) -> Self {
        Self {
            status,
            path: [PageTableEntry::INVALID; 5],
            level,
            pt_leak_map: [false; 5],
            physical_address: 0,
            pte_after: PageTableEntry::INVALID,
        }
    }
}

/// Table index of `virt` at hierarchy level `level` (1..=4).
fn table_index(virt: u64, level: u8) -> u64 {
    (virt >> (12 + 9 * (level as u64 - 1))) & 0x1FF
}

/// Sign-extend a virtual address at bit 47.
pub fn to_canonical(virt: u64) -> u64 {
    if virt & (1 << 47) != 0 {
        virt | 0xFFFF_0000_0000_0000
    } else {
        virt & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Install a leaf mapping `virt -> frame` in the hierarchy rooted at
/// `base_pt`, creating intermediate tables on demand.
///
/// If an intermediate allocation fails, every intermediate table created by
/// this walk is freed again and the access reports `AllocError` with the
/// path touched so far. Mapping an already present page also reports
/// `AllocError`.
pub fn allocate_page(
    mapper: &impl PhysMapper,
    base_pt: PageTable,
    virt: u64,
    frame: u64,
    flags: PageFlags,
    pmm: &mut FrameAllocator,
) -> PageTableAccess {
    let mut access = PageTableAccess::new(PageTableAccessStatus::Okay, 0);
    access.path[4] = base_pt.as_entry();

    // Intermediate tables inherit write access; user access only when the
    // leaf asks for it.
    let mut intermediate = PageFlags::PRESENT | PageFlags::WRITE_ALLOWED;
    if flags.contains(PageFlags::USER_MODE_ACCESS) {
        intermediate |= PageFlags::USER_MODE_ACCESS;
    }

    let mut created: [Option<(PageTable, u64)>; 3] = [None; 3];
    let mut table = base_pt;
    for level in (2..=4u8).rev() {
        let index = table_index(virt, level);
        let entry = table.entry(mapper, index);
        if !entry.is_present() {
            let table_frame = match pmm.allocate() {
                Ok(addr) => addr,
                Err(_) => {
                    // Unwind the intermediates created by this walk, deepest
                    // first.
                    for slot in created.iter().rev().flatten() {
                        let (parent, idx) = *slot;
                        let child = parent.entry_as_table(mapper, idx);
                        parent.update(mapper, idx, 0);
                        if pmm.free(child.phys, 1).is_err() {
                            access.pt_leak_map[child.level as usize] = true;
                        }
                    }
                    access.status = PageTableAccessStatus::AllocError;
                    access.level = level;
                    return access;
                }
            };
            let new_table = PageTable {
                phys: table_frame,
                level: level - 1,
            };
            new_table.clear(mapper);
            table.update(mapper, index, table_frame | intermediate.bits());
            created[(4 - level) as usize] = Some((table, index));
        }
        access.path[(level - 1) as usize] = table.entry(mapper, index);
        table = table.entry_as_table(mapper, index);
    }

    let leaf_index = table_index(virt, 1);
    let leaf = table.entry(mapper, leaf_index);
    if leaf.is_present() {
        access.status = PageTableAccessStatus::AllocError;
        access.level = 1;
        return access;
    }

    let bits = (frame & ADDR_MASK) | (flags | PageFlags::PRESENT).bits();
    table.update(mapper, leaf_index, bits);
    let installed = table.entry(mapper, leaf_index);
    access.path[0] = installed;
    access.pte_after = installed;
    access.physical_address = frame;
    access.level = 0;
    invalidate_page(virt);
    access
}

/// Remove the leaf mapping of `virt` and free its frame. Intermediate
/// tables that become empty are freed as well; frames that cannot be freed
/// are recorded in `pt_leak_map`.
pub fn free_page(
    mapper: &impl PhysMapper,
    base_pt: PageTable,
    virt: u64,
    pmm: &mut FrameAllocator,
) -> PageTableAccess {
    let mut access = PageTableAccess::new(PageTableAccessStatus::Okay, 0);
    access.path[4] = base_pt.as_entry();

    // tables[0] = L1 table, tables[1] = L2, tables[2] = L3.
    let mut tables = [base_pt; 3];
    let mut table = base_pt;
    for level in (2..=4u8).rev() {
        let index = table_index(virt, level);
        let entry = table.entry(mapper, index);
        if !entry.is_present() {
            access.status = PageTableAccessStatus::PageTableEntryMissing;
            access.level = level;
            return access;
        }
        access.path[(level - 1) as usize] = entry;
        table = table.entry_as_table(mapper, index);
        tables[(level - 2) as usize] = table;
    }

    let leaf_index = table_index(virt, 1);
    let leaf = table.entry(mapper, leaf_index);
    if !leaf.is_present() {
        access.status = PageTableAccessStatus::PageTableEntryMissing;
        access.level = 1;
        return access;
    }
    access.path[0] = leaf;
    access.physical_address = leaf.address();

    table.update(mapper, leaf_index, 0);
    access.pte_after = table.entry(mapper, leaf_index);
    invalidate_page(virt);
    if pmm.free(leaf.address(), 1).is_err() {
        access.status = PageTableAccessStatus::FreeError;
        return access;
    }

    // Free intermediate tables that became empty, bottom up. The base page
    // table itself is never freed here.
    for level in 1..=3u8 {
        let child = tables[(level - 1) as usize];
        if !child.is_empty(mapper) {
            break;
        }
        let parent = if level == 3 {
            base_pt
        } else {
            tables[level as usize]
        };
        parent.update(mapper, table_index(virt, level + 1), 0);
        if pmm.free(child.phys, 1).is_err() {
            access.pt_leak_map[level as usize] = true;
        }
    }
    access
}

/// Set or clear `flags` on the leaf entry of `virt`.
pub fn modify_page_flags(
    mapper: &impl PhysMapper,
    base_pt: PageTable,
    virt: u64,
    flags: PageFlags,
    set: bool,
) -> PageTableAccess {
    let mut access = walk(mapper, base_pt, virt);
    if access.status != PageTableAccessStatus::Okay {
        return access;
    }
    let table = leaf_table(mapper, base_pt, virt);
    let leaf_index = table_index(virt, 1);
    let leaf = table.entry(mapper, leaf_index);
    let bits = if set {
        leaf.bits | flags.bits()
    } else {
        leaf.bits & !flags.bits()
    };
    table.update(mapper, leaf_index, bits);
    access.pte_after = table.entry(mapper, leaf_index);
    invalidate_page(virt);
    access
}

/// Pure lookup of the mapping for `virt`.
pub fn find_page(mapper: &impl PhysMapper, base_pt: PageTable, virt: u64) -> PageTableAccess {
    walk(mapper, base_pt, virt)
}

/// Translate `virt` to its physical address, honoring the page offset.
pub fn translate(mapper: &impl PhysMapper, base_pt: PageTable, virt: u64) -> Option<u64> {
    let access = walk(mapper, base_pt, virt);
    if access.status == PageTableAccessStatus::Okay {
        Some(access.physical_address | (virt & (PAGE_SIZE - 1)))
    } else {
        None
    }
}

fn walk(mapper: &impl PhysMapper, base_pt: PageTable, virt: u64) -> PageTableAccess {
    let mut access = PageTableAccess::new(PageTableAccessStatus::Okay, 0);
    access.path[4] = base_pt.as_entry();

    let mut table = base_pt;
    for level in (1..=4u8).rev() {
        let index = table_index(virt, level);
        let entry = table.entry(mapper, index);
        if !entry.is_present() {
            access.status = PageTableAccessStatus::PageTableEntryMissing;
            access.level = level;
            return access;
        }
        access.path[(level - 1) as usize] = entry;
        if level > 1 {
            table = table.entry_as_table(mapper, index);
        } else {
            access.pte_after = entry;
            access.physical_address = entry.address();
        }
    }
    access
}

fn leaf_table(mapper: &impl PhysMapper, base_pt: PageTable, virt: u64) -> PageTable {
    let mut table = base_pt;
    for level in (2..=4u8).rev() {
        table = table.entry_as_table(mapper, table_index(virt, level));
    }
    table
}

/// Flush the TLB entry of one page.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn invalidate_page(virt: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn invalidate_page(_virt: u64) {}

/// Flush the whole TLB by reloading the paging root.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn flush_tlb() {}

/// Load a new base page table into the paging root register.
///
/// The new hierarchy must map the kernel, otherwise the next instruction
/// fetch faults.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn load_base_page_table(phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    let frame = PhysFrame::containing_address(PhysAddr::new(phys));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn load_base_page_table(_phys: u64) {}

/// Physical address of the currently loaded base page table.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn current_base_page_table() -> u64 {
    x86_64::registers::control::Cr3::read()
        .0
        .start_address()
        .as_u64()
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn current_base_page_table() -> u64 {
    0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::map::{MemoryMap, MemoryRegion, MemoryRegionKind};
    use alloc::vec;
    use alloc::vec::Vec;

    /// Fake physical memory: "physical" addresses are offsets into a
    /// page-aligned arena.
    pub(crate) struct TestEnv {
        _arena: Vec<u8>,
        base: usize,
        pub bitmap: Vec<u8>,
        pub pmm: FrameAllocator,
    }

    pub(crate) struct TestMapper {
        base: usize,
    }

    impl PhysMapper for TestMapper {
        fn phys_to_virt(&self, phys: u64) -> *mut u8 {
            (self.base as u64 + phys) as *mut u8
        }
    }

    impl TestEnv {
        pub fn new(frames: u64) -> Self {
            let bytes = (frames * PAGE_SIZE) as usize;
            let mut arena = vec![0u8; bytes + PAGE_SIZE as usize];
            let base = (arena.as_mut_ptr() as usize + PAGE_SIZE as usize - 1)
                & !(PAGE_SIZE as usize - 1);
            let map = MemoryMap::from_regions(&[MemoryRegion::new(
                0,
                frames * PAGE_SIZE,
                MemoryRegionKind::Usable,
            )]);
            let mut bitmap = vec![0u8; ((frames + 7) / 8) as usize];
            let pmm = FrameAllocator::with_storage(
                map,
                PAGE_SIZE,
                bitmap.as_mut_ptr(),
                bitmap.len() as u64,
            )
            .unwrap();
            Self {
                _arena: arena,
                base,
                bitmap,
                pmm,
            }
        }

        pub fn mapper(&self) -> TestMapper {
            TestMapper { base: self.base }
        }

        pub fn new_base_pt(&mut self) -> PageTable {
            let phys = self.pmm.allocate().unwrap();
            let pt = PageTable::base(phys);
            pt.clear(&self.mapper());
            pt
        }

        pub fn free_frames(&self) -> u32 {
            self.bitmap.iter().map(|b| b.count_zeros()).sum()
        }

        /// Hand the allocator and mapper out for use beyond the env's
        /// scope, leaking the backing arena (tests only).
        pub fn leak(self) -> (TestMapper, FrameAllocator) {
            let TestEnv {
                _arena,
                base,
                bitmap,
                pmm,
            } = self;
            core::mem::forget(_arena);
            core::mem::forget(bitmap);
            (TestMapper { base }, pmm)
        }
    }

    #[test]
    fn test_allocate_and_find_page() {
        let mut env = TestEnv::new(32);
        let base = env.new_base_pt();
        let frame = env.pmm.allocate().unwrap();
        let mapper = env.mapper();

        let access = allocate_page(
            &mapper,
            base,
            0x4000_2000,
            frame,
            PageFlags::WRITE_ALLOWED,
            &mut env.pmm,
        );
        assert_eq!(access.status, PageTableAccessStatus::Okay);
        assert_eq!(access.level, 0);
        assert_eq!(access.physical_address, frame);
        assert!(access.pte_after.is_present());
        assert!(access.pte_after.is_write_allowed());
        // All five path entries valid, base pseudo-entry at [4].
        assert!(access.path.iter().all(|e| e.is_valid()));
        assert_eq!(access.path[4].bits, base.phys);

        assert_eq!(translate(&mapper, base, 0x4000_2123), Some(frame + 0x123));
    }

    #[test]
    fn test_double_allocate_fails() {
        let mut env = TestEnv::new(32);
        let base = env.new_base_pt();
        let frame = env.pmm.allocate().unwrap();
        let mapper = env.mapper();

        let first = allocate_page(&mapper, base, 0x1000, frame, PageFlags::empty(), &mut env.pmm);
        assert_eq!(first.status, PageTableAccessStatus::Okay);
        let second = allocate_page(&mapper, base, 0x1000, frame, PageFlags::empty(), &mut env.pmm);
        assert_eq!(second.status, PageTableAccessStatus::AllocError);
        assert_eq!(second.level, 1);
    }

    #[test]
    fn test_alloc_failure_unwinds_intermediates() {
        // 4 frames: base PT + target frame leave two free frames; the walk
        // needs three intermediate tables and must fail, freeing the ones it
        // created.
        let mut env = TestEnv::new(4);
        let base = env.new_base_pt();
        let frame = env.pmm.allocate().unwrap();
        let mapper = env.mapper();
        let free_before = env.free_frames();

        let access =
            allocate_page(&mapper, base, 0x5000_0000, frame, PageFlags::empty(), &mut env.pmm);
        assert_eq!(access.status, PageTableAccessStatus::AllocError);
        assert_eq!(env.free_frames(), free_before);
        assert_eq!(base.entry(&mapper, table_index(0x5000_0000, 4)).bits, 0);
    }

    #[test]
    fn test_free_page_releases_empty_intermediates() {
        let mut env = TestEnv::new(32);
        let base = env.new_base_pt();
        let frame = env.pmm.allocate().unwrap();
        let mapper = env.mapper();
        let free_before = env.free_frames();

        allocate_page(&mapper, base, 0x7000_0000, frame, PageFlags::empty(), &mut env.pmm);
        let access = free_page(&mapper, base, 0x7000_0000, &mut env.pmm);
        assert_eq!(access.status, PageTableAccessStatus::Okay);
        assert_eq!(access.physical_address, frame);
        // The three intermediates are gone and the frame itself was freed on
        // top of the pre-allocation state.
        assert_eq!(access.pt_leak_map, [false; 5]);
        assert_eq!(env.free_frames(), free_before + 1);
        assert_eq!(
            find_page(&mapper, base, 0x7000_0000).status,
            PageTableAccessStatus::PageTableEntryMissing
        );
    }

    #[test]
    fn test_free_missing_page() {
        let mut env = TestEnv::new(16);
        let base = env.new_base_pt();
        let mapper = env.mapper();
        let access = free_page(&mapper, base, 0x1234_5000, &mut env.pmm);
        assert_eq!(access.status, PageTableAccessStatus::PageTableEntryMissing);
        assert_eq!(access.level, 4);
    }

    #[test]
    fn test_modify_page_flags() {
        let mut env = TestEnv::new(32);
        let base = env.new_base_pt();
        let frame = env.pmm.allocate().unwrap();
        let mapper = env.mapper();

        allocate_page(&mapper, base, 0x9000, frame, PageFlags::WRITE_ALLOWED, &mut env.pmm);
        let access = modify_page_flags(&mapper, base, 0x9000, PageFlags::WRITE_ALLOWED, false);
        assert_eq!(access.status, PageTableAccessStatus::Okay);
        assert!(!access.pte_after.is_write_allowed());
        assert!(access.pte_after.is_present());

        let access = modify_page_flags(&mapper, base, 0x9000, PageFlags::USER_MODE_ACCESS, true);
        assert!(access.pte_after.is_user_mode_access_allowed());
    }

    #[test]
    fn test_canonical_form() {
        assert_eq!(to_canonical(0x0000_7FFF_FFFF_FFFF), 0x0000_7FFF_FFFF_FFFF);
        assert_eq!(to_canonical(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
        assert_eq!(to_canonical(0xFFFF_8000_0000_0000), 0xFFFF_8000_0000_0000);
    }
}
