//! Kernel virtual address space layout.
//!
//! The lower half of every address space belongs to user space; the upper
//! half is shared kernel territory. The windows below are carved out of the
//! upper half when the first address space is built at boot.

/// Exclusive end of the user-space window (the canonical split).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Base of the higher-half direct map of physical memory.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Window where the frame allocator bitmap is remapped.
pub const PMM_WINDOW_BASE: u64 = 0xFFFF_C880_0000_0000;

/// Base of the kernel heap window served by the slab allocator.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C900_0000_0000;

/// Size of the kernel heap window.
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024;

/// Virtual base the kernel image is linked at.
pub const KERNEL_CODE_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Where the virtual windows of one address space live.
#[derive(Debug, Clone, Copy)]
pub struct KernelSpaceLayout {
    pub higher_half_direct_map: u64,
    pub pmm_window: u64,
    pub kernel_heap: u64,
    pub kernel_heap_size: u64,
    pub kernel_code: u64,
}

impl Default for KernelSpaceLayout {
    fn default() -> Self {
        Self {
            higher_half_direct_map: HHDM_BASE,
            pmm_window: PMM_WINDOW_BASE,
            kernel_heap: KERNEL_HEAP_BASE,
            kernel_heap_size: KERNEL_HEAP_SIZE,
            kernel_code: KERNEL_CODE_BASE,
        }
    }
}
