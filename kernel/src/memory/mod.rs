//! Memory management: physical frames, paging, virtual address spaces and
//! the slab-backed kernel heap.
//!
//! Boot order is strict: the frame allocator is built over the bootloader's
//! memory map, the first kernel address space is assembled on top of it,
//! and only then can the heap start growing into its window. Each stage
//! reports failure upward; none of them panic.

pub mod heap;
pub mod layout;
pub mod map;
pub mod paging;
pub mod pmm;
pub mod slab;
pub mod vmm;

use layout::KernelSpaceLayout;
use map::{MemoryMap, MemoryRegion, MemoryRegionKind};
use paging::{HhdmMapper, PAGE_SIZE};
use pmm::FrameAllocator;
use spin::Mutex;
use vmm::VirtualMemoryManager;

/// Reasons the memory subsystem cannot come up. Fatal at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryInitError {
    Pmm(pmm::PmmStartError),
    Vmm(vmm::VmmStartError),
    Heap(slab::HeapStartError),
}

static VMM: Mutex<Option<VirtualMemoryManager<HhdmMapper>>> = Mutex::new(None);

/// Bring up frames, the kernel address space and the heap.
///
/// `phys_map` is the converted bootloader memory map, `hhdm_offset` the
/// bootloader-provided physical memory window, and `kernel_code` the
/// physical region holding the kernel image.
pub fn init(
    phys_map: MemoryMap,
    hhdm_offset: u64,
    kernel_code: MemoryRegion,
) -> Result<(), MemoryInitError> {
    let pmm = FrameAllocator::start(phys_map, PAGE_SIZE, hhdm_offset).map_err(MemoryInitError::Pmm)?;
    log::info!(
        "memory: managing {} MiB of physical memory, bitmap {} KiB",
        pmm.managed_memory().size / (1024 * 1024),
        pmm.bitmap_size() / 1024
    );

    let layout = KernelSpaceLayout::default();
    let v_map = kernel_virtual_map();
    let mapper = HhdmMapper { offset: hhdm_offset };
    let vmm = VirtualMemoryManager::start(mapper, pmm, v_map, layout, kernel_code)
        .map_err(|(err, _)| MemoryInitError::Vmm(err))?;
    *VMM.lock() = Some(vmm);

    heap::init(layout.kernel_heap, layout.kernel_heap_size, heap::vmm_page_ops())
        .map_err(MemoryInitError::Heap)?;
    Ok(())
}

/// The initial virtual map: the user window plus the usable upper half.
fn kernel_virtual_map() -> MemoryMap {
    MemoryMap::from_regions(&[
        MemoryRegion::new(0, layout::USER_SPACE_END, MemoryRegionKind::Userspace),
        MemoryRegion::new(
            0xFFFF_8000_0000_0000,
            0x0000_7FFF_FFFF_F000,
            MemoryRegionKind::Usable,
        ),
    ])
}

/// Run `f` against the global virtual memory manager.
///
/// Returns `None` before [`init`] has completed.
pub fn with_vmm<R>(f: impl FnOnce(&mut VirtualMemoryManager<HhdmMapper>) -> R) -> Option<R> {
    VMM.lock().as_mut().map(f)
}

/// End of user space in canonical form, for user-pointer validation.
pub fn user_space_end() -> u64 {
    with_vmm(|vmm| vmm.user_space_end()).unwrap_or(layout::USER_SPACE_END)
}
