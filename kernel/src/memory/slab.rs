//! Slab allocator serving the kernel heap.
//!
//! Object caches hand out fixed-size objects carved from page-sized slabs
//! inside a dedicated heap window. Small objects (up to 1/8 page) use
//! *on-slab* layout: the objects sit at the start of the page and the slab
//! descriptor at its end, with a one-byte free-index chain threaded through
//! the free objects. Larger objects use *off-slab* layout: the descriptor
//! and per-object nodes live in their own caches and a pointer-to-slab hash
//! map resolves frees.
//!
//! Six bootstrap caches make the allocator self-hosting: caches for cache
//! descriptors, slab descriptors, object nodes, the hash map, hash nodes
//! and memory nodes (remembered free pages). On top of those sit two
//! families of 13 general caches each (16 B to 64 KiB, powers of two): one
//! write-back general-purpose family and one write-through uncached DMA
//! family.
//!
//! After [`SlabAllocator::start`] the instance must not be moved: caches
//! hold raw pointers into it.

use super::paging::{PageFlags, PAGE_SIZE};
use core::mem::size_of;
use core::ptr;

/// Smallest object size served by the general caches.
pub const MIN_OBJ_SIZE: usize = 16;
/// Largest object size served by the general caches.
pub const MAX_OBJ_SIZE: usize = 64 * 1024;
/// Number of general caches per family (16 B .. 64 KiB).
const STATIC_CACHE_COUNT: usize = 13;
/// Objects up to a 1/8 page are stored on-slab.
const ON_SLAB_LIMIT: usize = (PAGE_SIZE / 8) as usize;
/// End marker of the on-slab free-index chain.
const FREE_END: u8 = 0xFF;
/// Bucket count of the pointer hash map. Prime to spread page-aligned keys.
const BUCKET_COUNT: usize = 37;

/// Backing-page operations, installed by the boot code (VMM-backed) or the
/// test harness (pre-mapped arena).
#[derive(Clone, Copy)]
pub struct PageOps {
    /// Back `pages` pages at `virt` with fresh frames.
    pub map: fn(virt: u64, pages: u64, flags: PageFlags) -> bool,
    /// Release the backing of `pages` pages at `virt`.
    pub unmap: fn(virt: u64, pages: u64),
}

/// Where slab metadata lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    OnSlab,
    OffSlab,
}

/// Reasons the heap cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapStartError {
    HeapNotMapped,
    ObjectCacheCache,
    SlabCache,
    ObjectNodeCache,
    HashMapCache,
    HashNodeCache,
    MemoryNodeCache,
    GeneralCacheAlloc,
    GeneralCache,
    DmaCache,
}

/// A remembered run of freed, still-mapped heap pages.
#[repr(C)]
struct MemoryNode {
    next: *mut MemoryNode,
    addr: u64,
    pages: u64,
}

/// Free-list node of an off-slab object.
#[repr(C)]
struct ObjectBufNode {
    next: *mut ObjectBufNode,
    object: *mut u8,
    owner: *mut Slab,
}

/// Bucket entry of the pointer-to-node hash map.
#[repr(C)]
struct HashNode {
    next: *mut HashNode,
    key: *mut u8,
    value: *mut ObjectBufNode,
}

/// Object-pointer to [`ObjectBufNode`] map used to resolve off-slab frees.
#[repr(C)]
struct PtrHashMap {
    buckets: [*mut HashNode; BUCKET_COUNT],
}

impl PtrHashMap {
    fn bucket(key: *mut u8) -> usize {
        // Low 12 bits are identical for objects at the same slab offset;
        // hash the page number as well.
        let k = key as usize;
        ((k >> 4) ^ (k >> 12)) % BUCKET_COUNT
    }

    unsafe fn insert(&mut self, hash_node_cache: *mut ObjectCache, key: *mut u8, value: *mut ObjectBufNode) -> bool {
        let node = (*hash_node_cache).alloc() as *mut HashNode;
        if node.is_null() {
            return false;
        }
        let idx = Self::bucket(key);
        (*node).key = key;
        (*node).value = value;
        (*node).next = self.buckets[idx];
        self.buckets[idx] = node;
        true
    }

    unsafe fn remove(&mut self, hash_node_cache: *mut ObjectCache, key: *mut u8) -> *mut ObjectBufNode {
        let idx = Self::bucket(key);
        let mut cursor = self.buckets[idx];
        let mut prev: *mut HashNode = ptr::null_mut();
        while !cursor.is_null() {
            if (*cursor).key == key {
                let value = (*cursor).value;
                if prev.is_null() {
                    self.buckets[idx] = (*cursor).next;
                } else {
                    (*prev).next = (*cursor).next;
                }
                (*hash_node_cache).free_obj(cursor as *mut u8);
                return value;
            }
            prev = cursor;
            cursor = (*cursor).next;
        }
        ptr::null_mut()
    }

    unsafe fn get(&self, key: *mut u8) -> *mut ObjectBufNode {
        let mut cursor = self.buckets[Self::bucket(key)];
        while !cursor.is_null() {
            if (*cursor).key == key {
                return (*cursor).value;
            }
            cursor = (*cursor).next;
        }
        ptr::null_mut()
    }
}

/// One slab: a run of pages carved into equal objects.
#[repr(C)]
struct Slab {
    next: *mut Slab,
    prev: *mut Slab,
    cache: *mut ObjectCache,
    /// On-slab free chain head (object index), `FREE_END` when full.
    free_head: u8,
    /// Off-slab free node list.
    free_nodes: *mut ObjectBufNode,
    object_size: usize,
    object_count: usize,
    allocated: usize,
    page: u64,
    slab_size: usize,
}

impl Slab {
    /// Lay out an on-slab slab on `page`: objects first, descriptor at the
    /// end, free chain threaded through the first byte of each object.
    unsafe fn create_on_slab(cache: *mut ObjectCache, page: u64, slab_size: usize, object_size: usize) -> *mut Slab {
        let meta_offset = (slab_size - size_of::<Slab>()) & !15;
        let slab = (page as usize + meta_offset) as *mut Slab;
        let object_count = core::cmp::min(meta_offset / object_size, FREE_END as usize);

        (*slab) = Slab {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            cache,
            free_head: 0,
            free_nodes: ptr::null_mut(),
            object_size,
            object_count,
            allocated: 0,
            page,
            slab_size,
        };
        for i in 0..object_count {
            let obj = (page as usize + i * object_size) as *mut u8;
            let next = if i + 1 < object_count { (i + 1) as u8 } else { FREE_END };
            obj.write(next);
        }
        slab
    }

    /// Build an off-slab slab: the descriptor comes from `slab_cache` and
    /// one free node per object from `node_cache`.
    unsafe fn create_off_slab(
        cache: *mut ObjectCache,
        slab_cache: *mut ObjectCache,
        node_cache: *mut ObjectCache,
        page: u64,
        slab_size: usize,
        object_size: usize,
    ) -> *mut Slab {
        let slab = (*slab_cache).alloc() as *mut Slab;
        if slab.is_null() {
            return ptr::null_mut();
        }
        let object_count = slab_size / object_size;
        (*slab) = Slab {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            cache,
            free_head: FREE_END,
            free_nodes: ptr::null_mut(),
            object_size,
            object_count,
            allocated: 0,
            page,
            slab_size,
        };
        for i in (0..object_count).rev() {
            let node = (*node_cache).alloc() as *mut ObjectBufNode;
            if node.is_null() {
                // Roll the nodes built so far back into their cache.
                let mut cursor = (*slab).free_nodes;
                while !cursor.is_null() {
                    let next = (*cursor).next;
                    (*node_cache).free_obj(cursor as *mut u8);
                    cursor = next;
                }
                (*slab_cache).free_obj(slab as *mut u8);
                return ptr::null_mut();
            }
            (*node).object = (page as usize + i * object_size) as *mut u8;
            (*node).owner = slab;
            (*node).next = (*slab).free_nodes;
            (*slab).free_nodes = node;
        }
        slab
    }

    unsafe fn alloc_on_slab(&mut self) -> *mut u8 {
        if self.free_head == FREE_END {
            return ptr::null_mut();
        }
        let index = self.free_head as usize;
        let obj = (self.page as usize + index * self.object_size) as *mut u8;
        self.free_head = obj.read();
        self.allocated += 1;
        obj
    }

    unsafe fn free_on_slab(&mut self, obj: *mut u8) {
        let index = ((obj as usize - self.page as usize) / self.object_size) as u8;
        obj.write(self.free_head);
        self.free_head = index;
        self.allocated -= 1;
    }

    unsafe fn alloc_off_slab(&mut self) -> *mut ObjectBufNode {
        let node = self.free_nodes;
        if node.is_null() {
            return ptr::null_mut();
        }
        self.free_nodes = (*node).next;
        self.allocated += 1;
        node
    }

    unsafe fn free_off_slab(&mut self, node: *mut ObjectBufNode) {
        (*node).next = self.free_nodes;
        self.free_nodes = node;
        self.allocated -= 1;
    }

    fn is_full(&self) -> bool {
        self.allocated == self.object_count
    }

    fn is_empty(&self) -> bool {
        self.allocated == 0
    }
}

/// A dynamically growing cache of equally sized objects.
#[repr(C)]
pub struct ObjectCache {
    object_size: usize,
    align: usize,
    page_flags: PageFlags,
    cache_type: CacheType,
    pages_per_slab: u64,

    full: *mut Slab,
    partial: *mut Slab,
    empty: *mut Slab,
    slab_count: usize,

    // Wired by `SlabAllocator::start`; null for bootstrap caches that never
    // need them.
    slab_cache: *mut ObjectCache,
    node_cache: *mut ObjectCache,
    hash_node_cache: *mut ObjectCache,
    hash: *mut PtrHashMap,
    memory_node_cache: *mut ObjectCache,
    heap: *mut HeapWindow,

    free_pages: *mut MemoryNode,
}

impl ObjectCache {
    const fn zeroed() -> Self {
        Self {
            object_size: 0,
            align: 0,
            page_flags: PageFlags::empty(),
            cache_type: CacheType::OnSlab,
            pages_per_slab: 1,
            full: ptr::null_mut(),
            partial: ptr::null_mut(),
            empty: ptr::null_mut(),
            slab_count: 0,
            slab_cache: ptr::null_mut(),
            node_cache: ptr::null_mut(),
            hash_node_cache: ptr::null_mut(),
            hash: ptr::null_mut(),
            memory_node_cache: ptr::null_mut(),
            heap: ptr::null_mut(),
            free_pages: ptr::null_mut(),
        }
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    fn init(&mut self, object_size: usize, align: usize, page_flags: PageFlags, heap: *mut HeapWindow) {
        let object_size = core::cmp::max(object_size, MIN_OBJ_SIZE);
        let object_size = (object_size + align - 1) & !(align - 1);
        self.object_size = object_size;
        self.align = align;
        self.page_flags = page_flags;
        self.heap = heap;
        if object_size <= ON_SLAB_LIMIT {
            self.cache_type = CacheType::OnSlab;
            self.pages_per_slab = 1;
        } else {
            self.cache_type = CacheType::OffSlab;
            // At least one object per slab, up to eight for small objects.
            let per_slab = core::cmp::max(1, (4 * PAGE_SIZE as usize) / object_size);
            let per_slab = core::cmp::min(per_slab, 8);
            self.pages_per_slab =
                crate::util::div_round_up((per_slab * object_size) as u64, PAGE_SIZE);
        }
    }

    unsafe fn list_remove(list: &mut *mut Slab, slab: *mut Slab) {
        if !(*slab).prev.is_null() {
            (*(*slab).prev).next = (*slab).next;
        } else {
            *list = (*slab).next;
        }
        if !(*slab).next.is_null() {
            (*(*slab).next).prev = (*slab).prev;
        }
        (*slab).next = ptr::null_mut();
        (*slab).prev = ptr::null_mut();
    }

    unsafe fn list_push(list: &mut *mut Slab, slab: *mut Slab) {
        (*slab).next = *list;
        (*slab).prev = ptr::null_mut();
        if !(*list).is_null() {
            (**list).prev = slab;
        }
        *list = slab;
    }

    /// Acquire backing pages: remembered free pages first, fresh heap pages
    /// otherwise.
    unsafe fn acquire_pages(&mut self, pages: u64) -> u64 {
        let mut cursor = self.free_pages;
        let mut prev: *mut MemoryNode = ptr::null_mut();
        while !cursor.is_null() {
            if (*cursor).pages == pages {
                let addr = (*cursor).addr;
                if prev.is_null() {
                    self.free_pages = (*cursor).next;
                } else {
                    (*prev).next = (*cursor).next;
                }
                if !self.memory_node_cache.is_null() {
                    (*self.memory_node_cache).free_obj(cursor as *mut u8);
                }
                return addr;
            }
            prev = cursor;
            cursor = (*cursor).next;
        }
        (*self.heap).acquire(pages, self.page_flags)
    }

    /// Remember a freed slab's pages for the next grow.
    unsafe fn release_pages(&mut self, addr: u64, pages: u64) {
        if self.memory_node_cache.is_null() {
            return;
        }
        let node = (*self.memory_node_cache).alloc() as *mut MemoryNode;
        if node.is_null() {
            return;
        }
        (*node).addr = addr;
        (*node).pages = pages;
        (*node).next = self.free_pages;
        self.free_pages = node;
    }

    /// Add one fresh slab to the empty list.
    unsafe fn grow(&mut self) -> bool {
        let slab_size = (self.pages_per_slab * PAGE_SIZE) as usize;
        let page = self.acquire_pages(self.pages_per_slab);
        if page == 0 {
            return false;
        }
        let slab = match self.cache_type {
            CacheType::OnSlab => {
                Slab::create_on_slab(self as *mut ObjectCache, page, slab_size, self.object_size)
            }
            CacheType::OffSlab => Slab::create_off_slab(
                self as *mut ObjectCache,
                self.slab_cache,
                self.node_cache,
                page,
                slab_size,
                self.object_size,
            ),
        };
        if slab.is_null() {
            self.release_pages(page, self.pages_per_slab);
            return false;
        }
        Self::list_push(&mut self.empty, slab);
        self.slab_count += 1;
        true
    }

    /// Allocate one object, growing the cache when necessary.
    pub unsafe fn alloc(&mut self) -> *mut u8 {
        let slab = if !self.partial.is_null() {
            self.partial
        } else {
            if self.empty.is_null() && !self.grow() {
                return ptr::null_mut();
            }
            let slab = self.empty;
            Self::list_remove(&mut self.empty, slab);
            Self::list_push(&mut self.partial, slab);
            slab
        };

        let obj = match self.cache_type {
            CacheType::OnSlab => (*slab).alloc_on_slab(),
            CacheType::OffSlab => {
                let node = (*slab).alloc_off_slab();
                if node.is_null() {
                    ptr::null_mut()
                } else {
                    let obj = (*node).object;
                    if !self.hash.is_null()
                        && !(*self.hash).insert(self.hash_node_cache, obj, node)
                    {
                        (*slab).free_off_slab(node);
                        return ptr::null_mut();
                    }
                    obj
                }
            }
        };
        if obj.is_null() {
            return obj;
        }
        if (*slab).is_full() {
            Self::list_remove(&mut self.partial, slab);
            Self::list_push(&mut self.full, slab);
        }
        obj
    }

    /// Free an object belonging to `slab`.
    unsafe fn free_to_slab(&mut self, slab: *mut Slab, obj: *mut u8) {
        let was_full = (*slab).is_full();
        match self.cache_type {
            CacheType::OnSlab => (*slab).free_on_slab(obj),
            CacheType::OffSlab => {
                let node = if self.hash.is_null() {
                    ptr::null_mut()
                } else {
                    (*self.hash).remove(self.hash_node_cache, obj)
                };
                if node.is_null() {
                    log::warn!("slab: off-slab free of untracked object {:p}", obj);
                    return;
                }
                (*slab).free_off_slab(node);
            }
        }

        if was_full {
            Self::list_remove(&mut self.full, slab);
            Self::list_push(&mut self.partial, slab);
        }
        if (*slab).is_empty() {
            Self::list_remove(&mut self.partial, slab);
            // Keep one empty slab per cache, release further ones.
            if self.empty.is_null() {
                Self::list_push(&mut self.empty, slab);
            } else {
                let page = (*slab).page;
                let pages = self.pages_per_slab;
                if self.cache_type == CacheType::OffSlab {
                    let mut cursor = (*slab).free_nodes;
                    while !cursor.is_null() {
                        let next = (*cursor).next;
                        (*self.node_cache).free_obj(cursor as *mut u8);
                        cursor = next;
                    }
                    (*self.slab_cache).free_obj(slab as *mut u8);
                }
                self.slab_count -= 1;
                self.release_pages(page, pages);
            }
        }
    }

    /// Free an on-slab object by locating the descriptor on its page run.
    pub unsafe fn free_obj(&mut self, obj: *mut u8) {
        let slab = on_slab_descriptor(obj);
        self.free_to_slab(slab, obj);
    }

    /// Whether any slab of this cache contains `obj` (on-slab only).
    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    /// Release every slab and remembered page of the cache.
    unsafe fn destroy(&mut self) {
        for list in [self.full, self.partial, self.empty] {
            let mut cursor = list;
            while !cursor.is_null() {
                let next = (*cursor).next;
                let page = (*cursor).page;
                let pages = self.pages_per_slab;
                if self.cache_type == CacheType::OffSlab {
                    let mut node = (*cursor).free_nodes;
                    while !node.is_null() {
                        let node_next = (*node).next;
                        (*self.node_cache).free_obj(node as *mut u8);
                        node = node_next;
                    }
                    (*self.slab_cache).free_obj(cursor as *mut u8);
                }
                (*self.heap).release(page, pages);
                cursor = next;
            }
        }
        let mut node = self.free_pages;
        while !node.is_null() {
            let next = (*node).next;
            (*self.heap).release((*node).addr, (*node).pages);
            (*self.memory_node_cache).free_obj(node as *mut u8);
            node = next;
        }
        self.full = ptr::null_mut();
        self.partial = ptr::null_mut();
        self.empty = ptr::null_mut();
        self.free_pages = ptr::null_mut();
        self.slab_count = 0;
    }
}

/// Descriptor of the on-slab slab owning `obj`.
unsafe fn on_slab_descriptor(obj: *mut u8) -> *mut Slab {
    let page = (obj as u64) & !(PAGE_SIZE - 1);
    let meta_offset = (PAGE_SIZE as usize - size_of::<Slab>()) & !15;
    (page as usize + meta_offset) as *mut Slab
}

/// The heap window: a bump allocator over the mapped slab area.
#[repr(C)]
struct HeapWindow {
    base: u64,
    size: u64,
    limit: u64,
    ops: PageOps,
}

impl HeapWindow {
    /// Map and hand out `pages` fresh pages, or 0 on exhaustion.
    fn acquire(&mut self, pages: u64, flags: PageFlags) -> u64 {
        let bytes = pages * PAGE_SIZE;
        if self.limit + bytes > self.base + self.size {
            log::warn!("slab: heap window exhausted");
            return 0;
        }
        let addr = self.limit;
        if !(self.ops.map)(addr, pages, flags | PageFlags::PRESENT | PageFlags::WRITE_ALLOWED) {
            return 0;
        }
        self.limit += bytes;
        addr
    }

    fn release(&mut self, addr: u64, pages: u64) {
        (self.ops.unmap)(addr, pages);
    }
}

/// The slab allocator: bootstrap caches plus the general-purpose and DMA
/// cache families.
#[repr(C)]
pub struct SlabAllocator {
    window: HeapWindow,

    object_cache_cache: ObjectCache,
    slab_cache: ObjectCache,
    node_cache: ObjectCache,
    hash_map_cache: ObjectCache,
    hash_node_cache: ObjectCache,
    memory_node_cache: ObjectCache,

    hash: *mut PtrHashMap,
    general: [*mut ObjectCache; STATIC_CACHE_COUNT],
    dma: [*mut ObjectCache; STATIC_CACHE_COUNT],
    started: bool,
}

impl SlabAllocator {
    pub fn is_started(&self) -> bool {
        self.started
    }
}

unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    pub const fn empty() -> Self {
        Self {
            window: HeapWindow {
                base: 0,
                size: 0,
                limit: 0,
                ops: PageOps {
                    map: |_, _, _| false,
                    unmap: |_, _| {},
                },
            },
            object_cache_cache: ObjectCache::zeroed(),
            slab_cache: ObjectCache::zeroed(),
            node_cache: ObjectCache::zeroed(),
            hash_map_cache: ObjectCache::zeroed(),
            hash_node_cache: ObjectCache::zeroed(),
            memory_node_cache: ObjectCache::zeroed(),
            hash: ptr::null_mut(),
            general: [ptr::null_mut(); STATIC_CACHE_COUNT],
            dma: [ptr::null_mut(); STATIC_CACHE_COUNT],
            started: false,
        }
    }

    /// Smallest general cache object size.
    pub fn min_cache_size(&self) -> usize {
        MIN_OBJ_SIZE
    }

    /// Largest general cache object size.
    pub fn max_cache_size(&self) -> usize {
        MAX_OBJ_SIZE
    }

    /// Start the heap over the window `[heap_base, heap_base + heap_size)`.
    ///
    /// The instance must already sit at its final address; caches hold
    /// pointers into it afterwards.
    pub fn start(&mut self, heap_base: u64, heap_size: u64, ops: PageOps) -> Result<(), HeapStartError> {
        if heap_size == 0 {
            return Err(HeapStartError::HeapNotMapped);
        }
        self.window = HeapWindow {
            base: heap_base,
            size: heap_size,
            limit: heap_base,
            ops,
        };
        let heap = &mut self.window as *mut HeapWindow;
        let gp_flags = PageFlags::PRESENT | PageFlags::WRITE_ALLOWED;

        self.object_cache_cache.init(size_of::<ObjectCache>(), 16, gp_flags, heap);
        self.slab_cache.init(size_of::<Slab>(), 16, gp_flags, heap);
        self.node_cache.init(size_of::<ObjectBufNode>(), 16, gp_flags, heap);
        self.hash_map_cache.init(size_of::<PtrHashMap>(), 16, gp_flags, heap);
        self.hash_node_cache.init(size_of::<HashNode>(), 16, gp_flags, heap);
        self.memory_node_cache.init(size_of::<MemoryNode>(), 16, gp_flags, heap);

        // Prime every bootstrap cache so start-time failures are surfaced
        // here rather than on some later allocation.
        unsafe {
            if !self.object_cache_cache.grow() {
                return Err(HeapStartError::ObjectCacheCache);
            }
            if !self.slab_cache.grow() {
                return Err(HeapStartError::SlabCache);
            }
            if !self.node_cache.grow() {
                return Err(HeapStartError::ObjectNodeCache);
            }
            if !self.hash_map_cache.grow() {
                return Err(HeapStartError::HashMapCache);
            }
            if !self.hash_node_cache.grow() {
                return Err(HeapStartError::HashNodeCache);
            }
            if !self.memory_node_cache.grow() {
                return Err(HeapStartError::MemoryNodeCache);
            }

            let hash = self.hash_map_cache.alloc() as *mut PtrHashMap;
            if hash.is_null() {
                return Err(HeapStartError::HashMapCache);
            }
            (*hash).buckets = [ptr::null_mut(); BUCKET_COUNT];
            self.hash = hash;

            // Memory-node reuse for the bootstrap caches themselves.
            let memory_node_cache = &mut self.memory_node_cache as *mut ObjectCache;
            self.object_cache_cache.memory_node_cache = memory_node_cache;
            self.slab_cache.memory_node_cache = memory_node_cache;
            self.node_cache.memory_node_cache = memory_node_cache;
            self.hash_map_cache.memory_node_cache = memory_node_cache;
            self.hash_node_cache.memory_node_cache = memory_node_cache;

            let dma_flags = gp_flags | PageFlags::WRITE_THROUGH | PageFlags::CACHE_DISABLE;
            for i in 0..STATIC_CACHE_COUNT {
                let size = MIN_OBJ_SIZE << i;
                let gp = self.new_cache(size, 16, gp_flags);
                if gp.is_null() {
                    return Err(HeapStartError::GeneralCache);
                }
                self.general[i] = gp;
                let dma = self.new_cache(size, 16, dma_flags);
                if dma.is_null() {
                    return Err(HeapStartError::DmaCache);
                }
                self.dma[i] = dma;
            }
        }
        self.started = true;
        Ok(())
    }

    /// Allocate and wire a new cache descriptor.
    unsafe fn new_cache(&mut self, object_size: usize, align: usize, flags: PageFlags) -> *mut ObjectCache {
        let cache = self.object_cache_cache.alloc() as *mut ObjectCache;
        if cache.is_null() {
            return ptr::null_mut();
        }
        (*cache) = ObjectCache::zeroed();
        (*cache).init(object_size, align, flags, &mut self.window as *mut HeapWindow);
        (*cache).slab_cache = &mut self.slab_cache as *mut ObjectCache;
        (*cache).node_cache = &mut self.node_cache as *mut ObjectCache;
        (*cache).hash_node_cache = &mut self.hash_node_cache as *mut ObjectCache;
        (*cache).hash = self.hash;
        (*cache).memory_node_cache = &mut self.memory_node_cache as *mut ObjectCache;
        cache
    }

    fn cache_index(size: usize) -> Option<usize> {
        if size > MAX_OBJ_SIZE {
            return None;
        }
        let size = core::cmp::max(size, MIN_OBJ_SIZE).next_power_of_two();
        Some(size.trailing_zeros() as usize - MIN_OBJ_SIZE.trailing_zeros() as usize)
    }

    /// Allocate `size` bytes from the general-purpose caches. `size` is
    /// rounded up to the next power of two with a 16-byte floor; requests
    /// beyond 64 KiB are refused.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if !self.started {
            return ptr::null_mut();
        }
        match Self::cache_index(size) {
            Some(idx) => unsafe { (*self.general[idx]).alloc() },
            None => ptr::null_mut(),
        }
    }

    /// Allocate `size` bytes from the DMA caches (write-through, uncached
    /// pages). Same rounding rules as [`Self::allocate`].
    pub fn allocate_dma(&mut self, size: usize) -> *mut u8 {
        if !self.started {
            return ptr::null_mut();
        }
        match Self::cache_index(size) {
            Some(idx) => unsafe { (*self.dma[idx]).alloc() },
            None => ptr::null_mut(),
        }
    }

    /// Free an object previously returned by this allocator. The owning
    /// slab is resolved through the off-slab hash map first, then through
    /// the on-slab descriptor of the object's page. Passing a foreign
    /// pointer is undefined behavior.
    pub fn free(&mut self, obj: *mut u8) {
        if !self.started || obj.is_null() {
            return;
        }
        unsafe {
            let node = (*self.hash).get(obj);
            let slab = if node.is_null() {
                on_slab_descriptor(obj)
            } else {
                (*node).owner
            };
            let cache = (*slab).cache;
            (*cache).free_to_slab(slab, obj);
        }
    }

    /// Create a cache of custom-size objects.
    pub fn create_new_cache(&mut self, object_size: usize, align: usize, dma: bool) -> *mut ObjectCache {
        let flags = if dma {
            PageFlags::PRESENT
                | PageFlags::WRITE_ALLOWED
                | PageFlags::WRITE_THROUGH
                | PageFlags::CACHE_DISABLE
        } else {
            PageFlags::PRESENT | PageFlags::WRITE_ALLOWED
        };
        unsafe { self.new_cache(object_size, align, flags) }
    }

    /// Tear a custom cache down and release its descriptor.
    pub fn destroy_cache(&mut self, cache: *mut ObjectCache) {
        unsafe {
            (*cache).destroy();
            self.object_cache_cache.free_obj(cache as *mut u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn test_ops() -> PageOps {
        // The test window is plain mapped memory: backing is a no-op.
        PageOps {
            map: |_, _, _| true,
            unmap: |_, _| {},
        }
    }

    /// Leak a page-aligned arena and return its base address.
    fn leak_window(bytes: usize) -> u64 {
        let arena = vec![0u8; bytes + PAGE_SIZE as usize].leak();
        (arena.as_mut_ptr() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }

    fn started_allocator(bytes: usize) -> alloc::boxed::Box<SlabAllocator> {
        let base = leak_window(bytes);
        let mut slab = alloc::boxed::Box::new(SlabAllocator::empty());
        slab.start(base, bytes as u64, test_ops()).unwrap();
        slab
    }

    #[test]
    fn test_small_alloc_rounds_to_sixteen() {
        let mut slab = started_allocator(0x200000);
        let a = slab.allocate(1);
        let b = slab.allocate(8);
        assert!(!a.is_null() && !b.is_null());
        // Both come from the 16-byte cache: 16-byte spacing or distinct
        // slabs, but always 16-byte alignment.
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
        slab.free(a);
        slab.free(b);
    }

    #[test]
    fn test_free_then_reallocate_reuses_object() {
        let mut slab = started_allocator(0x200000);
        let a = slab.allocate(64);
        slab.free(a);
        let b = slab.allocate(64);
        // LIFO free chain hands the same object back.
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut slab = started_allocator(0x200000);
        assert!(slab.allocate(MAX_OBJ_SIZE + 1).is_null());
        assert!(!slab.allocate(MAX_OBJ_SIZE).is_null());
    }

    #[test]
    fn test_off_slab_allocation() {
        let mut slab = started_allocator(0x200000);
        // 4 KiB objects are far over the on-slab limit.
        let a = slab.allocate(4096);
        let b = slab.allocate(4096);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        slab.free(a);
        slab.free(b);
        let c = slab.allocate(4096);
        assert!(c == a || c == b);
    }

    #[test]
    fn test_dma_cache_is_distinct() {
        let mut slab = started_allocator(0x200000);
        let gp = slab.allocate(256);
        let dma = slab.allocate_dma(256);
        assert!(!gp.is_null() && !dma.is_null());
        // Different families, different slabs.
        assert_ne!((gp as u64) & !(PAGE_SIZE - 1), (dma as u64) & !(PAGE_SIZE - 1));
        slab.free(gp);
        slab.free(dma);
    }

    #[test]
    fn test_custom_cache() {
        let mut slab = started_allocator(0x200000);
        let cache = slab.create_new_cache(48, 16, false);
        assert!(!cache.is_null());
        let obj = unsafe { (*cache).alloc() };
        assert!(!obj.is_null());
        unsafe { (*cache).free_obj(obj) };
        slab.destroy_cache(cache);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        // A window of only 4 pages is exhausted quickly by 4 KiB objects.
        let base = leak_window(0x4000);
        let mut slab = alloc::boxed::Box::new(SlabAllocator::empty());
        // Bootstrap caches need one page each; this window cannot hold the
        // full general families, so start must fail cleanly rather than
        // wander off the window.
        assert!(slab.start(base, 0x4000, test_ops()).is_err());
    }

    #[test]
    fn test_many_allocations_cross_slabs() {
        let mut slab = started_allocator(0x200000);
        let mut ptrs = vec![];
        for _ in 0..600 {
            let p = slab.allocate(16);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        // 600 objects at 16 B exceed one slab (~250 objects/page): at least
        // three slabs exist.
        for p in &ptrs {
            unsafe { p.write_bytes(0xAB, 16) };
        }
        for p in ptrs {
            slab.free(p);
        }
        let again = slab.allocate(16);
        assert!(!again.is_null());
    }
}
