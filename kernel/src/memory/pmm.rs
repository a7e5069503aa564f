//! Physical memory manager.
//!
//! A bitmap frame allocator over the bootloader's physical memory map. Bit
//! *i* set means frame *i* (counted from the managed base) is in use. The
//! bitmap itself lives in the first usable region large enough to hold it
//! and its own frames are marked used, so it can never be handed out or
//! freed. Reserved regions of the map are likewise refused by explicit
//! allocation and free.

use super::map::{MemoryMap, MemoryRegion, MemoryRegionKind};
use crate::util::{align_down, align_up, div_round_up};

/// Reasons the frame allocator can fail to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmStartError {
    /// The memory map contains no regions.
    MemoryRangeDetectionFailed,
    /// No usable region is large enough to hold the bitmap.
    OutOfMemory,
}

/// Errors returned by frame operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No free run of the requested length exists.
    OutOfMemory,
    /// The range intersects a reserved map region or the bitmap itself.
    Reserved,
    /// An explicitly requested frame is already allocated.
    AlreadyUsed,
    /// The range lies outside the managed memory.
    OutOfBounds,
}

/// Bitmap page-frame allocator.
pub struct FrameAllocator {
    page_size: u64,
    mem_base: u64,
    frame_count: u64,
    bitmap: *mut u8,
    bitmap_len: u64,
    bitmap_phys: u64,
    /// False when the bitmap storage was provided externally (early boot,
    /// tests) and must not be protected as a self-managed region.
    self_placed: bool,
    map: MemoryMap,
}

// The allocator is only ever accessed under a lock.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Start the allocator, placing the bitmap inside the managed memory.
    ///
    /// `phys_offset` is the address offset through which physical memory can
    /// be accessed (the higher-half direct map during normal operation).
    pub fn start(map: MemoryMap, page_size: u64, phys_offset: u64) -> Result<Self, PmmStartError> {
        let (mem_base, frame_count) =
            Self::detect_range(&map, page_size).ok_or(PmmStartError::MemoryRangeDetectionFailed)?;
        let bitmap_len = div_round_up(frame_count, 8);

        let bitmap_phys = map
            .regions()
            .iter()
            .find(|r| r.kind == MemoryRegionKind::Usable && r.size >= bitmap_len)
            .map(|r| r.start)
            .ok_or(PmmStartError::OutOfMemory)?;

        let mut pmm = Self {
            page_size,
            mem_base,
            frame_count,
            bitmap: (phys_offset + bitmap_phys) as *mut u8,
            bitmap_len,
            bitmap_phys,
            self_placed: true,
            map,
        };
        pmm.init_bitmap();
        Ok(pmm)
    }

    /// Start the allocator with externally provided bitmap storage.
    ///
    /// Used before paging is up and by the test suite. The storage must hold
    /// at least `ceil(frames / 8)` bytes and outlive the allocator.
    pub fn with_storage(
        map: MemoryMap,
        page_size: u64,
        storage: *mut u8,
        storage_len: u64,
    ) -> Result<Self, PmmStartError> {
        let (mem_base, frame_count) =
            Self::detect_range(&map, page_size).ok_or(PmmStartError::MemoryRangeDetectionFailed)?;
        let bitmap_len = div_round_up(frame_count, 8);
        if storage_len < bitmap_len {
            return Err(PmmStartError::OutOfMemory);
        }

        let mut pmm = Self {
            page_size,
            mem_base,
            frame_count,
            bitmap: storage,
            bitmap_len,
            bitmap_phys: 0,
            self_placed: false,
            map,
        };
        pmm.init_bitmap();
        Ok(pmm)
    }

    fn detect_range(map: &MemoryMap, page_size: u64) -> Option<(u64, u64)> {
        let first = map.regions().first()?;
        let base = align_down(first.start, page_size);
        let top = map
            .regions()
            .iter()
            .map(|r| r.end())
            .max()
            .map(|end| align_up(end, page_size))?;
        Some((base, (top - base) / page_size))
    }

    fn init_bitmap(&mut self) {
        // Runs before the heap exists: regions are copied into a fixed
        // buffer instead of collecting.
        for i in 0..self.bitmap_len {
            unsafe { self.bitmap.add(i as usize).write(0xFF) };
        }
        // Everything starts as used, then usable regions are carved free.
        let mut regions = [MemoryRegion::new(0, 0, MemoryRegionKind::Reserved); MemoryMap::LIMIT];
        let len = self.map.len();
        regions[..len].copy_from_slice(self.map.regions());
        for r in regions.iter().take(len) {
            if r.kind == MemoryRegionKind::Usable {
                self.mark_region(r.start, r.size, false);
            }
        }
        if self.self_placed {
            self.mark_region(self.bitmap_phys, self.bitmap_len, true);
        }
    }

    /// Size of the bitmap in bytes.
    pub fn bitmap_size(&self) -> u64 {
        self.bitmap_len
    }

    /// The physical region occupied by the bitmap.
    pub fn bitmap_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.bitmap_phys, self.bitmap_len, MemoryRegionKind::PmmReserved)
    }

    /// The managed physical memory region.
    pub fn managed_memory(&self) -> MemoryRegion {
        MemoryRegion::new(
            self.mem_base,
            self.frame_count * self.page_size,
            MemoryRegionKind::Usable,
        )
    }

    /// Relocate the virtual address used to access the bitmap.
    pub fn relocate_bitmap(&mut self, access: u64) {
        self.bitmap = access as *mut u8;
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    fn frame_of(&self, addr: u64) -> u64 {
        (addr - self.mem_base) / self.page_size
    }

    fn frame_of_round_up(&self, addr: u64) -> u64 {
        div_round_up(addr - self.mem_base, self.page_size)
    }

    fn addr_of(&self, frame: u64) -> u64 {
        self.mem_base + frame * self.page_size
    }

    fn is_free(&self, frame: u64) -> bool {
        // An unmanaged frame reads as free; marking is bounds-checked.
        if frame >= self.frame_count {
            return true;
        }
        let byte = (frame / 8) as usize;
        let bit = frame % 8;
        unsafe { self.bitmap.add(byte).read() & (1 << bit) == 0 }
    }

    fn mark(&mut self, frame: u64, in_use: bool) {
        let byte = (frame / 8) as usize;
        let bit = frame % 8;
        unsafe {
            let p = self.bitmap.add(byte);
            if in_use {
                p.write(p.read() | 1 << bit);
            } else {
                p.write(p.read() & !(1 << bit));
            }
        }
    }

    fn mark_block(&mut self, base: u64, frames: u64, in_use: bool) -> bool {
        if base + frames > self.frame_count {
            return false;
        }
        for frame in base..base + frames {
            self.mark(frame, in_use);
        }
        true
    }

    /// Mark a byte region. Marking used rounds outward (start down, length
    /// up); marking free rounds inward so a partially covered frame is never
    /// freed.
    fn mark_region(&mut self, start: u64, size: u64, in_use: bool) -> bool {
        let (base, frames) = if in_use {
            (self.frame_of(start), div_round_up(size, self.page_size))
        } else {
            (self.frame_of_round_up(start), size / self.page_size)
        };
        self.mark_block(base, frames, in_use)
    }

    fn find_free_run(&self, frames: u64) -> Option<u64> {
        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.frame_count {
            if self.is_free(frame) {
                run_len += 1;
                if run_len >= frames {
                    return Some(run_start);
                }
            } else {
                run_start = frame + 1;
                run_len = 0;
            }
        }
        None
    }

    /// Check a byte range against the bitmap's own region and every
    /// non-usable map region.
    fn protected(&self, addr: u64, frames: u64) -> Option<PmmError> {
        let end = addr + frames * self.page_size;
        if self.self_placed {
            let bitmap_end = align_up(self.bitmap_phys + self.bitmap_len, self.page_size);
            if self.bitmap_phys < end && addr < bitmap_end {
                log::warn!("pmm: range {:#x}..{:#x} overlaps the frame bitmap", addr, end);
                return Some(PmmError::Reserved);
            }
        }
        let probe = MemoryRegion::new(addr, end - addr, MemoryRegionKind::Used);
        for region in self.map.regions() {
            if region.kind != MemoryRegionKind::Usable && region.overlaps(&probe) {
                log::warn!(
                    "pmm: range {:#x}..{:#x} overlaps reserved region {:#x}..{:#x}",
                    addr,
                    end,
                    region.start,
                    region.end()
                );
                return Some(PmmError::Reserved);
            }
        }
        None
    }

    /// Allocate a single page frame.
    pub fn allocate(&mut self) -> Result<u64, PmmError> {
        self.allocate_n(1)
    }

    /// Allocate `frames` contiguous page frames, returning the start address.
    pub fn allocate_n(&mut self, frames: u64) -> Result<u64, PmmError> {
        let base = self.find_free_run(frames).ok_or_else(|| {
            log::warn!("pmm: out of physical memory ({} frame request)", frames);
            PmmError::OutOfMemory
        })?;
        self.mark_block(base, frames, true);
        Ok(self.addr_of(base))
    }

    /// Allocate the specific frame(s) starting at `addr`.
    pub fn allocate_explicit(&mut self, addr: u64, frames: u64) -> Result<(), PmmError> {
        if let Some(err) = self.protected(addr, frames) {
            return Err(err);
        }
        let base = self.frame_of(addr);
        for frame in base..base + frames {
            if !self.is_free(frame) {
                return Err(PmmError::AlreadyUsed);
            }
        }
        if !self.mark_block(base, frames, true) {
            return Err(PmmError::OutOfBounds);
        }
        Ok(())
    }

    /// Free the frame(s) starting at `addr`.
    pub fn free(&mut self, addr: u64, frames: u64) -> Result<(), PmmError> {
        if let Some(err) = self.protected(addr, frames) {
            return Err(err);
        }
        if !self.mark_region(addr, frames * self.page_size, false) {
            return Err(PmmError::OutOfBounds);
        }
        Ok(())
    }

    /// Turn bootloader-reclaimable regions into usable memory.
    pub fn claim_bootloader_reclaimable(&mut self) -> bool {
        let reclaimable: alloc::vec::Vec<MemoryRegion> = self
            .map
            .regions()
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::BootloaderReclaimable)
            .copied()
            .collect();
        let mut success = true;
        for region in reclaimable {
            let claim = MemoryRegion::new(region.start, region.size, MemoryRegionKind::Usable);
            if self.map.claim(claim, self.page_size).is_err() {
                log::warn!(
                    "pmm: failed to claim bootloader reclaimable region {:#x}..{:#x}",
                    region.start,
                    region.end()
                );
                success = false;
            }
            if !self.mark_region(region.start, region.size, false) {
                log::warn!(
                    "pmm: failed to mark bootloader reclaimable region free {:#x}..{:#x}",
                    region.start,
                    region.end()
                );
                success = false;
            }
        }
        success
    }

    /// Read the allocation state of the managed memory in `start..end` into
    /// `buf` as coalesced `Usable`/`Used` runs. Returns the number of
    /// regions written. `start` is rounded down and `end` up to page
    /// boundaries; a range outside the managed memory reads nothing.
    pub fn read_page_frame_states(
        &self,
        buf: &mut [MemoryRegion],
        start: u64,
        end: u64,
    ) -> usize {
        let mem_end = self.mem_base + self.frame_count * self.page_size;
        if start < self.mem_base || end > mem_end || buf.is_empty() {
            return 0;
        }
        let start = align_down(start, self.page_size);
        let end = core::cmp::min(align_up(end, self.page_size), mem_end);

        let first = self.frame_of(start);
        let last = self.frame_of(end);

        let mut run_start = start;
        let mut run_size = self.page_size;
        let mut run_kind = if self.is_free(first) {
            MemoryRegionKind::Usable
        } else {
            MemoryRegionKind::Used
        };
        let mut written = 0;

        for frame in first + 1..last {
            if written >= buf.len() {
                break;
            }
            let kind = if self.is_free(frame) {
                MemoryRegionKind::Usable
            } else {
                MemoryRegionKind::Used
            };
            if kind != run_kind {
                buf[written] = MemoryRegion::new(run_start, run_size, run_kind);
                written += 1;
                run_start = self.addr_of(frame);
                run_size = self.page_size;
                run_kind = kind;
            } else {
                run_size += self.page_size;
            }
        }
        if written < buf.len() {
            buf[written] = MemoryRegion::new(run_start, run_size, run_kind);
            written += 1;
        }
        written
    }
}
