//! Kernel heap: the global allocator backed by the slab allocator.
//!
//! The slab allocator lives in a static so its internal raw pointers stay
//! valid. All access is serialized through a spin lock; callers inside
//! scheduler lock regions are already interrupt-free.

use super::paging::PageFlags;
use super::slab::{HeapStartError, ObjectCache, PageOps, SlabAllocator};
use core::alloc::{GlobalAlloc, Layout};
use spin::Mutex;

static SLAB: Mutex<SlabAllocator> = Mutex::new(SlabAllocator::empty());

/// Run `f` on the slab with interrupts disabled and switches postponed,
/// so an interrupt handler can never spin on a lock its own thread holds.
fn with_slab<R>(f: impl FnOnce(&mut SlabAllocator) -> R) -> R {
    crate::task::scheduler::lock();
    let result = f(&mut SLAB.lock());
    crate::task::scheduler::unlock();
    result
}

/// Start the heap over `[heap_base, heap_base + heap_size)`.
pub fn init(heap_base: u64, heap_size: u64, ops: PageOps) -> Result<(), HeapStartError> {
    let result = SLAB.lock().start(heap_base, heap_size, ops);
    match &result {
        Ok(()) => log::info!(
            "heap: slab allocator serving {:#x}..{:#x}",
            heap_base,
            heap_base + heap_size
        ),
        Err(err) => log::error!("heap: start failed: {:?}", err),
    }
    result
}

/// Allocate `size` bytes from the general-purpose caches.
pub fn allocate(size: usize) -> *mut u8 {
    with_slab(|slab| slab.allocate(size))
}

/// Allocate `size` bytes of uncached, write-through memory for device
/// buffers.
pub fn allocate_dma(size: usize) -> *mut u8 {
    with_slab(|slab| slab.allocate_dma(size))
}

/// Return an object to its cache.
pub fn free(ptr: *mut u8) {
    with_slab(|slab| slab.free(ptr))
}

/// Create an object cache with custom size and alignment.
pub fn create_new_cache(object_size: usize, align: usize, dma: bool) -> *mut ObjectCache {
    with_slab(|slab| slab.create_new_cache(object_size, align, dma))
}

/// Destroy a cache created with [`create_new_cache`].
pub fn destroy_cache(cache: *mut ObjectCache) {
    with_slab(|slab| slab.destroy_cache(cache))
}

/// `PageOps` backed by the global virtual memory manager.
pub fn vmm_page_ops() -> PageOps {
    PageOps {
        map: |virt, pages, flags| {
            super::with_vmm(|vmm| vmm.allocate_n(virt, flags, pages)).unwrap_or(false)
        },
        unmap: |virt, pages| {
            super::with_vmm(|vmm| {
                vmm.free_n(virt, pages);
            });
        },
    }
}

struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The slab guarantees power-of-two object alignment, so covering
        // the alignment means covering the size.
        let size = core::cmp::max(layout.size(), layout.align());
        with_slab(|slab| slab.allocate(size))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        with_slab(|slab| slab.free(ptr))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap;

/// Marker so the type is exercised on hosted builds too.
#[cfg(not(target_os = "none"))]
#[allow(dead_code)]
static ALLOCATOR: KernelHeap = KernelHeap;

/// `PageFlags` used for ordinary heap pages.
#[allow(dead_code)]
pub const HEAP_PAGE_FLAGS: PageFlags = PageFlags::WRITE_ALLOWED;
