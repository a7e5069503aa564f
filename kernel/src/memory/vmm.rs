//! Virtual memory manager.
//!
//! Builds the first kernel address space at boot (higher-half direct map,
//! frame-bitmap window, kernel heap claim, kernel code), then serves page
//! allocation in the loaded space and whole-address-space management for
//! user programs. The upper half of every address space aliases the same
//! kernel mappings; only the lower half is owned per space.

use super::layout::KernelSpaceLayout;
use super::map::{MemoryMap, MemoryRegion, MemoryRegionKind};
use super::paging::{
    self, PageFlags, PageTable, PageTableAccessStatus, PhysMapper, PAGE_SIZE,
    PAGE_TABLE_ENTRIES,
};
use super::pmm::FrameAllocator;

/// Reasons the construction of the first address space can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmStartError {
    BasePtAllocFailed,
    HhdmMappingFailed,
    PmmWindowMappingFailed,
    KernelHeapClaimFailed,
    KernelCodeMappingFailed,
}

/// Virtual memory manager over one loaded address space.
pub struct VirtualMemoryManager<M: PhysMapper> {
    mapper: M,
    pmm: FrameAllocator,
    v_map: MemoryMap,
    user_space_end: u64,
    current_base: PageTable,
}

impl<M: PhysMapper> VirtualMemoryManager<M> {
    /// Build the first kernel address space.
    ///
    /// Stages: higher-half direct map sized to the largest physical address,
    /// the frame-bitmap window, the kernel heap claim (no pages, the heap
    /// grows on demand), and the kernel code region. Every stage claims its
    /// region in the virtual map; if a stage fails, all pages mapped by
    /// prior stages are freed again before the error is returned.
    pub fn start(
        mapper: M,
        mut pmm: FrameAllocator,
        mut v_map: MemoryMap,
        layout: KernelSpaceLayout,
        kernel_code_phys: MemoryRegion,
    ) -> Result<Self, (VmmStartError, FrameAllocator)> {
        let base_frame = match pmm.allocate() {
            Ok(frame) => frame,
            Err(_) => return Err((VmmStartError::BasePtAllocFailed, pmm)),
        };
        let base_pt = PageTable::base(base_frame);
        base_pt.clear(&mapper);

        let flags = PageFlags::WRITE_ALLOWED;
        let hhdm_size = pmm.managed_memory().end();
        let bitmap = pmm.bitmap_region();

        // (virtual start, physical start, size, claim kind)
        let stages = [
            (
                layout.higher_half_direct_map,
                0u64,
                hhdm_size,
                MemoryRegionKind::HigherHalfDirectMap,
                VmmStartError::HhdmMappingFailed,
            ),
            (
                layout.pmm_window,
                bitmap.start,
                bitmap.size,
                MemoryRegionKind::PmmReserved,
                VmmStartError::PmmWindowMappingFailed,
            ),
            (
                layout.kernel_code,
                kernel_code_phys.start,
                kernel_code_phys.size,
                MemoryRegionKind::KernelCode,
                VmmStartError::KernelCodeMappingFailed,
            ),
        ];

        // Pre-heap: track completed stages in a fixed buffer.
        let mut mapped: [(u64, u64); 3] = [(0, 0); 3];
        let mut mapped_len = 0;
        for (virt, phys, size, kind, error) in stages {
            let mut offset = 0;
            let mut failed = false;
            while offset < size {
                let access = paging::allocate_page(
                    &mapper,
                    base_pt,
                    virt + offset,
                    phys + offset,
                    flags,
                    &mut pmm,
                );
                if access.status != PageTableAccessStatus::Okay {
                    failed = true;
                    break;
                }
                offset += PAGE_SIZE;
            }
            if !failed {
                let claim = MemoryRegion::new(virt, size, kind);
                if v_map.claim(claim, PAGE_SIZE).is_err() {
                    failed = true;
                }
            }
            if failed {
                // Unwind this stage's partial mappings and all prior stages.
                let mut cursor = 0;
                while cursor < offset {
                    paging::free_page(&mapper, base_pt, virt + cursor, &mut pmm);
                    cursor += PAGE_SIZE;
                }
                for (prior_virt, prior_size) in mapped[..mapped_len].iter().rev() {
                    let mut cursor = 0;
                    while cursor < *prior_size {
                        paging::free_page(&mapper, base_pt, prior_virt + cursor, &mut pmm);
                        cursor += PAGE_SIZE;
                    }
                }
                return Err((error, pmm));
            }
            mapped[mapped_len] = (virt, size);
            mapped_len += 1;
        }

        // The heap window is claimed without backing pages.
        let heap = MemoryRegion::new(
            layout.kernel_heap,
            layout.kernel_heap_size,
            MemoryRegionKind::KernelHeap,
        );
        if v_map.claim(heap, PAGE_SIZE).is_err() {
            for (prior_virt, prior_size) in mapped[..mapped_len].iter().rev() {
                let mut cursor = 0;
                while cursor < *prior_size {
                    paging::free_page(&mapper, base_pt, prior_virt + cursor, &mut pmm);
                    cursor += PAGE_SIZE;
                }
            }
            return Err((VmmStartError::KernelHeapClaimFailed, pmm));
        }

        let user_space_end = v_map
            .regions()
            .iter()
            .find(|r| r.kind == MemoryRegionKind::Userspace)
            .map(|r| paging::to_canonical(r.end()))
            .unwrap_or(super::layout::USER_SPACE_END);

        paging::load_base_page_table(base_frame);
        paging::flush_tlb();

        Ok(Self {
            mapper,
            pmm,
            v_map,
            user_space_end,
            current_base: base_pt,
        })
    }

    /// End of the user-space window in canonical form.
    pub fn user_space_end(&self) -> u64 {
        self.user_space_end
    }

    /// The base page table of the currently loaded address space.
    pub fn current_base(&self) -> PageTable {
        self.current_base
    }

    pub fn virtual_map(&self) -> &MemoryMap {
        &self.v_map
    }

    pub fn pmm(&mut self) -> &mut FrameAllocator {
        &mut self.pmm
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Map one fresh frame at `virt` in the loaded space.
    pub fn allocate(&mut self, virt: u64, flags: PageFlags) -> bool {
        let frame = match self.pmm.allocate() {
            Ok(frame) => frame,
            Err(_) => {
                log::warn!("vmm: out of physical memory for page {:#x}", virt);
                return false;
            }
        };
        let access =
            paging::allocate_page(&self.mapper, self.current_base, virt, frame, flags, &mut self.pmm);
        if access.status != PageTableAccessStatus::Okay {
            log::warn!("vmm: page allocation failed at {:#x}", virt);
            if self.pmm.free(frame, 1).is_err() {
                log::warn!("vmm: failed to release frame {:#x} after map failure", frame);
            }
            return false;
        }
        true
    }

    /// Map `pages` fresh frames starting at `virt`; on failure every page
    /// mapped by this call is freed again.
    pub fn allocate_n(&mut self, virt: u64, flags: PageFlags, pages: u64) -> bool {
        for i in 0..pages {
            if !self.allocate(virt + i * PAGE_SIZE, flags) {
                for j in 0..i {
                    self.free(virt + j * PAGE_SIZE);
                }
                return false;
            }
        }
        true
    }

    /// Unmap the page at `virt` and free its frame.
    pub fn free(&mut self, virt: u64) -> bool {
        let access = paging::free_page(&self.mapper, self.current_base, virt, &mut self.pmm);
        if access.status != PageTableAccessStatus::Okay {
            log::warn!("vmm: failed to free page {:#x}", virt);
            return false;
        }
        true
    }

    /// Unmap `pages` pages starting at `virt`. Continues past individual
    /// failures and reports whether all frees succeeded.
    pub fn free_n(&mut self, virt: u64, pages: u64) -> bool {
        let mut all = true;
        for i in 0..pages {
            if !self.free(virt + i * PAGE_SIZE) {
                all = false;
            }
        }
        all
    }

    /// Translate a virtual address in the loaded space.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        paging::translate(&self.mapper, self.current_base, virt)
    }

    /// Create a new address space whose upper half aliases the loaded one.
    pub fn allocate_vas(&mut self) -> Option<u64> {
        let frame = match self.pmm.allocate() {
            Ok(frame) => frame,
            Err(_) => {
                log::error!("vmm: base page table allocation failed");
                return None;
            }
        };
        let new_base = PageTable::base(frame);
        for i in 0..PAGE_TABLE_ENTRIES {
            let bits = if i >= PAGE_TABLE_ENTRIES / 2 {
                let entry = self.current_base.entry(&self.mapper, i);
                if entry.is_present() {
                    entry.bits
                } else {
                    0
                }
            } else {
                0
            };
            new_base.update(&self.mapper, i, bits);
        }
        Some(frame)
    }

    /// Free an address space: the lower (user) half is released recursively,
    /// upper-half tables are shared and left alone, and finally the base
    /// table frame itself is freed.
    pub fn free_vas(&mut self, base_pt_addr: u64) -> bool {
        let base_pt = PageTable::base(base_pt_addr);
        let mut ok = true;
        for i in 0..PAGE_TABLE_ENTRIES / 2 {
            let entry = base_pt.entry(&self.mapper, i);
            if entry.is_present() {
                if !self.free_table_recursive(entry.address(), 3) {
                    ok = false;
                }
                base_pt.update(&self.mapper, i, 0);
            }
        }
        if self.pmm.free(base_pt_addr, 1).is_err() {
            log::warn!("vmm: failed to free base page table {:#x}", base_pt_addr);
            ok = false;
        }
        ok
    }

    fn free_table_recursive(&mut self, table_phys: u64, level: u8) -> bool {
        let table = PageTable {
            phys: table_phys,
            level,
        };
        let mut ok = true;
        for i in 0..PAGE_TABLE_ENTRIES {
            let entry = table.entry(&self.mapper, i);
            if !entry.is_present() {
                continue;
            }
            if level > 1 {
                if !self.free_table_recursive(entry.address(), level - 1) {
                    ok = false;
                }
            } else if self.pmm.free(entry.address(), 1).is_err() {
                log::warn!("vmm: failed to free page frame {:#x}", entry.address());
                ok = false;
            }
            table.update(&self.mapper, i, 0);
        }
        if self.pmm.free(table_phys, 1).is_err() {
            log::warn!("vmm: failed to free page table frame {:#x}", table_phys);
            ok = false;
        }
        ok
    }

    /// Switch to another address space, refreshing its upper half from the
    /// outgoing space first.
    pub fn load_vas(&mut self, base_pt_addr: u64) {
        if base_pt_addr == self.current_base.phys {
            return;
        }
        let new_base = PageTable::base(base_pt_addr);
        for i in PAGE_TABLE_ENTRIES / 2..PAGE_TABLE_ENTRIES {
            let bits = self.current_base.entry(&self.mapper, i).bits;
            new_base.update(&self.mapper, i, bits);
        }
        self.current_base = new_base;
        paging::load_base_page_table(base_pt_addr);
        paging::flush_tlb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::tests::{TestEnv, TestMapper};

    const HHDM: u64 = 0xFFFF_8000_0000_0000;

    fn test_layout() -> KernelSpaceLayout {
        KernelSpaceLayout {
            higher_half_direct_map: HHDM,
            pmm_window: 0xFFFF_C880_0000_0000,
            kernel_heap: 0xFFFF_C900_0000_0000,
            kernel_heap_size: 0x20_0000,
            kernel_code: 0xFFFF_FFFF_8000_0000,
        }
    }

    fn test_v_map() -> MemoryMap {
        MemoryMap::from_regions(&[
            MemoryRegion::new(0, super::super::layout::USER_SPACE_END, MemoryRegionKind::Userspace),
            MemoryRegion::new(
                0xFFFF_8000_0000_0000,
                0x7FFF_FFFF_F000,
                MemoryRegionKind::Usable,
            ),
        ])
    }

    fn start_vmm(frames: u64) -> VirtualMemoryManager<TestMapper> {
        let (mapper, pmm) = TestEnv::new(frames).leak();
        let kernel_code = MemoryRegion::new(0, PAGE_SIZE, MemoryRegionKind::KernelCode);
        VirtualMemoryManager::start(mapper, pmm, test_v_map(), test_layout(), kernel_code)
            .map_err(|(e, _)| e)
            .unwrap()
    }

    #[test]
    fn test_kernel_space_construction() {
        let vmm = start_vmm(64);
        // HHDM window claimed in the virtual map.
        assert!(vmm
            .virtual_map()
            .regions()
            .iter()
            .any(|r| r.kind == MemoryRegionKind::HigherHalfDirectMap));
        assert!(vmm
            .virtual_map()
            .regions()
            .iter()
            .any(|r| r.kind == MemoryRegionKind::KernelHeap));
        assert_eq!(vmm.user_space_end(), super::super::layout::USER_SPACE_END);
        // The direct map covers physical address 0.
        assert_eq!(vmm.translate(HHDM), Some(0));
    }

    #[test]
    fn test_upper_half_shared_across_address_spaces() {
        let mut vmm = start_vmm(64);
        let base0 = vmm.current_base();
        let vas = vmm.allocate_vas().unwrap();

        // Invariant: upper-half translations agree between the boot space
        // and every derived space.
        let probe = HHDM + 0x3000;
        let base1 = PageTable::base(vas);
        assert_eq!(
            paging::translate(vmm.mapper(), base0, probe),
            paging::translate(vmm.mapper(), base1, probe),
        );

        // Lower half starts out unmapped in the new space.
        assert_eq!(paging::translate(vmm.mapper(), base1, 0x1000), None);
        assert!(vmm.free_vas(vas));
    }

    #[test]
    fn test_allocate_n_unwinds_on_failure() {
        let mut vmm = start_vmm(64);
        // Exhaust free memory; a multi-page request must then fail without
        // leaving partial mappings behind.
        let mut exhausted = 0;
        while vmm.pmm().allocate().is_ok() {
            exhausted += 1;
        }
        assert!(exhausted > 0);
        assert!(!vmm.allocate_n(0xFFFF_C900_1000_0000, PageFlags::WRITE_ALLOWED, 4));
        assert_eq!(vmm.translate(0xFFFF_C900_1000_0000), None);
    }

    #[test]
    fn test_load_vas_refreshes_upper_half() {
        let mut vmm = start_vmm(128);
        let vas = vmm.allocate_vas().unwrap();

        // Map a new kernel page after the derived space was created.
        let probe = 0xFFFF_C900_0000_0000u64;
        assert!(vmm.allocate(probe, PageFlags::WRITE_ALLOWED));
        let expected = vmm.translate(probe);
        assert!(expected.is_some());

        // Loading the derived space copies the fresh upper-half entries.
        vmm.load_vas(vas);
        assert_eq!(vmm.translate(probe), expected);
    }
}
