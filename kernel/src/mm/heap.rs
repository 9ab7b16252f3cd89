//! Slab kernel heap.
//!
//! Small-object allocator layered above the PMM: eight power-of-two size
//! classes from 16 to 2048 bytes, each keeping a LIFO free list of cells
//! carved out of whole frames. Every live object is preceded by a
//! 16-byte header whose magic word tags it as slab-owned; `kfree` of
//! anything without the magic is rejected with a diagnostic.
//!
//! Requests above 2048 bytes take whole pages straight from the PMM and
//! are recorded in a fixed-capacity sidecar table keyed by base address,
//! so their size can be recovered at free time (large blocks carry no
//! in-band header). A single heap lock serializes allocator state;
//! per-CPU magazines are a non-goal.

use core::ptr::{self, NonNull};

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use super::{phys_to_virt, virt_to_phys, FrameSource, PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Largest size served from the slab caches.
pub const KMALLOC_MAX_SIZE: usize = 2048;

/// Number of size classes.
const NUM_CLASSES: usize = 8;

/// The size classes: 16, 32, 64, 128, 256, 512, 1024, 2048.
const CLASS_SIZES: [usize; NUM_CLASSES] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Header magic while an object is live.
pub const SLAB_MAGIC: u32 = 0xDEAD_BEEF;

/// Maximum concurrently live large (> 2048 byte) allocations.
const MAX_LARGE_ALLOCS: usize = 128;

/// Header preceding every slab object. 16 bytes, so payloads stay
/// 16-aligned within the frame.
#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
    magic: u32,
    size: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<SlabHeader>();

/// One size class: a LIFO free list of cells plus counters.
struct SlabCache {
    size: u32,
    free_list: *mut SlabHeader,
    allocations: u64,
    frees: u64,
}

impl SlabCache {
    const fn new(size: usize) -> Self {
        Self {
            size: size as u32,
            free_list: ptr::null_mut(),
            allocations: 0,
            frees: 0,
        }
    }

    /// Cell stride in the backing frame: header plus payload.
    fn cell_size(&self) -> usize {
        self.size as usize + HEADER_SIZE
    }

    /// Carve one fresh frame into cells and chain them onto the free
    /// list.
    fn refill(&mut self, frame: VirtualAddress) {
        let cells = PAGE_SIZE / self.cell_size();
        let base = frame.as_mut_ptr::<u8>();
        let mut head = self.free_list;
        // Chain back to front so the first cell ends up at the head.
        for i in (0..cells).rev() {
            // SAFETY: `i * cell_size + HEADER_SIZE <= PAGE_SIZE`, so the
            // header lies entirely within the freshly allocated frame.
            let header = unsafe { base.add(i * self.cell_size()) } as *mut SlabHeader;
            // SAFETY: The frame is exclusively ours and properly aligned
            // (frame base is page aligned, cell stride is a multiple of
            // 16).
            unsafe {
                (*header).next = head;
                (*header).magic = 0;
                (*header).size = 0;
            }
            head = header;
        }
        self.free_list = head;
    }

    /// Pop a cell, stamp its header, return the payload pointer.
    fn pop(&mut self) -> Option<NonNull<u8>> {
        let header = self.free_list;
        if header.is_null() {
            return None;
        }
        // SAFETY: Non-null entries of the free list are valid headers
        // chained by `refill`/`push`.
        unsafe {
            self.free_list = (*header).next;
            (*header).next = ptr::null_mut();
            (*header).magic = SLAB_MAGIC;
            (*header).size = self.size;
            self.allocations += 1;
            NonNull::new((header as *mut u8).add(HEADER_SIZE))
        }
    }

    /// Push a live object back onto the free list.
    ///
    /// # Safety
    ///
    /// `header` must point at a header previously handed out by this
    /// cache's `pop`.
    unsafe fn push(&mut self, header: *mut SlabHeader) {
        // SAFETY: Per the function contract the header belongs to this
        // cache and is no longer referenced by its previous owner.
        unsafe {
            (*header).magic = 0;
            (*header).size = 0;
            (*header).next = self.free_list;
        }
        self.free_list = header;
        self.frees += 1;
    }
}

/// Sidecar record for one large allocation.
#[derive(Clone, Copy)]
struct LargeAlloc {
    base: PhysicalAddress,
    pages: usize,
}

/// The kernel heap: slab caches plus the large-allocation sidecar.
pub struct Heap {
    caches: [SlabCache; NUM_CLASSES],
    large: [Option<LargeAlloc>; MAX_LARGE_ALLOCS],
}

// SAFETY: The raw free-list pointers reference frames owned by the heap;
// all access is serialized by the enclosing SpinLock.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            caches: [
                SlabCache::new(16),
                SlabCache::new(32),
                SlabCache::new(64),
                SlabCache::new(128),
                SlabCache::new(256),
                SlabCache::new(512),
                SlabCache::new(1024),
                SlabCache::new(2048),
            ],
            large: [None; MAX_LARGE_ALLOCS],
        }
    }

    fn class_index(size: usize) -> Option<usize> {
        CLASS_SIZES.iter().position(|&c| size <= c)
    }

    /// Allocate `size` bytes.
    pub fn allocate(
        &mut self,
        size: usize,
        frames: &mut impl FrameSource,
    ) -> KernelResult<NonNull<u8>> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero-byte allocation",
            });
        }

        if size > KMALLOC_MAX_SIZE {
            return self.allocate_large(size, frames);
        }

        let idx = Self::class_index(size).expect("size fits a class");
        if self.caches[idx].free_list.is_null() {
            let frame = frames.allocate_frames(1)?;
            self.caches[idx].refill(phys_to_virt(frame));
        }
        // A refilled cache always has at least one cell.
        Ok(self.caches[idx].pop().expect("refilled cache is non-empty"))
    }

    fn allocate_large(
        &mut self,
        size: usize,
        frames: &mut impl FrameSource,
    ) -> KernelResult<NonNull<u8>> {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let slot = self
            .large
            .iter()
            .position(|e| e.is_none())
            .ok_or(KernelError::ResourceExhausted {
                resource: "large-allocation table",
            })?;
        let base = frames.allocate_frames(pages)?;
        self.large[slot] = Some(LargeAlloc { base, pages });
        Ok(NonNull::new(phys_to_virt(base).as_mut_ptr()).expect("direct map is non-null"))
    }

    /// Free a pointer previously returned by [`Heap::allocate`].
    ///
    /// Large blocks are page aligned and identified through the sidecar;
    /// slab payloads are never page aligned and are identified by the
    /// magic in the header immediately preceding them. A pointer that
    /// matches neither is a diagnostics-only event.
    pub fn free(&mut self, ptr: NonNull<u8>, frames: &mut impl FrameSource) {
        let addr = ptr.as_ptr() as u64;

        if addr % PAGE_SIZE as u64 == 0 {
            let phys = virt_to_phys(VirtualAddress::new(addr));
            if let Some(slot) = self
                .large
                .iter()
                .position(|e| e.map(|l| l.base == phys).unwrap_or(false))
            {
                let entry = self.large[slot].take().expect("slot just matched");
                frames.free_frames(entry.base, entry.pages);
                return;
            }
            log::warn!("kfree: untracked page-aligned block at {:#x}", addr);
            return;
        }

        // SAFETY: Slab payloads always sit HEADER_SIZE bytes into a cell,
        // so the header read stays within the same frame.
        let header = unsafe { (ptr.as_ptr()).sub(HEADER_SIZE) } as *mut SlabHeader;
        // SAFETY: As above; the header is within bounds even if the
        // pointer turns out not to be heap-owned (the magic check rejects
        // it before anything else is trusted).
        let (magic, size) = unsafe { ((*header).magic, (*header).size) };
        if magic != SLAB_MAGIC {
            log::warn!("kfree: bad header magic {:#x} at {:#x}", magic, addr);
            return;
        }
        match Self::class_index(size as usize) {
            Some(idx) if CLASS_SIZES[idx] == size as usize => {
                // SAFETY: Magic and class both check out, so this header
                // came from `pop` on this cache.
                unsafe { self.caches[idx].push(header) };
            }
            _ => log::warn!("kfree: corrupt size class {} at {:#x}", size, addr),
        }
    }

    /// (allocations, frees) counters for one class -- test and stats
    /// visibility.
    pub fn class_counters(&self, class: usize) -> (u64, u64) {
        (self.caches[class].allocations, self.caches[class].frees)
    }

    /// Length of one class's free list.
    pub fn free_cells(&self, class: usize) -> usize {
        let mut n = 0;
        let mut cell = self.caches[class].free_list;
        while !cell.is_null() {
            n += 1;
            // SAFETY: Free-list cells are valid headers; the list is
            // NULL-terminated.
            cell = unsafe { (*cell).next };
        }
        n
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

static HEAP: SpinLock<Heap> = SpinLock::new(Heap::new());

/// Allocate `size` bytes from the kernel heap.
pub fn kmalloc(size: usize) -> KernelResult<NonNull<u8>> {
    HEAP.lock().allocate(size, &mut super::pmm::global())
}

/// Allocate `size` zeroed bytes from the kernel heap.
pub fn kzalloc(size: usize) -> KernelResult<NonNull<u8>> {
    let ptr = kmalloc(size)?;
    // SAFETY: `ptr` was just allocated with at least `size` usable bytes.
    unsafe {
        ptr::write_bytes(ptr.as_ptr(), 0, size);
    }
    Ok(ptr)
}

/// Free a pointer previously returned by [`kmalloc`] / [`kzalloc`].
pub fn kfree(ptr: NonNull<u8>) {
    HEAP.lock().free(ptr, &mut super::pmm::global());
}

/// `GlobalAlloc` adapter so `alloc::{Box, Vec, BTreeMap}` are backed by
/// the slab heap on bare metal.
pub struct KernelAllocator;

// SAFETY: alloc/dealloc delegate to the spinlocked kernel heap, which
// hands out unique, properly sized blocks and accepts them back exactly
// once; alignment above 16 is satisfied by routing to the page-granular
// large path.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // Slab payloads are 16-aligned; anything stricter (or larger
        // than the biggest class) takes whole pages.
        let size = if layout.align() > HEADER_SIZE {
            layout.size().max(KMALLOC_MAX_SIZE + 1)
        } else {
            layout.size()
        };
        match kmalloc(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            kfree(ptr);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{early::EarlyAllocator, pmm::Pmm, testmem, MemoryRegion};

    fn test_pmm(pages: u64) -> Pmm {
        let (base, _) = testmem::claim((pages + 16) * PAGE_SIZE as u64);
        let region_base = base.as_u64() + 16 * PAGE_SIZE as u64;
        let pmm = Pmm::new();
        let mut early = EarlyAllocator::with_base(base);
        pmm.init(
            &[MemoryRegion::usable(region_base, pages * PAGE_SIZE as u64)],
            &mut early,
        );
        pmm
    }

    #[test]
    fn test_live_object_header_magic() {
        let pmm = test_pmm(16);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        let ptr = heap.allocate(100, &mut frames).unwrap();
        // SAFETY: Slab payloads are preceded by their header.
        let header = unsafe { &*(ptr.as_ptr().sub(HEADER_SIZE) as *const SlabHeader) };
        assert_eq!(header.magic, SLAB_MAGIC);
        assert_eq!(header.size, 128);
        heap.free(ptr, &mut frames);
    }

    #[test]
    fn test_lifo_reuse_returns_same_pointers() {
        let pmm = test_pmm(16);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        let first: std::vec::Vec<_> = (0..10)
            .map(|_| heap.allocate(64, &mut frames).unwrap())
            .collect();
        let unique: std::collections::HashSet<_> = first.iter().map(|p| p.as_ptr()).collect();
        assert_eq!(unique.len(), 10);

        for &ptr in &first {
            heap.free(ptr, &mut frames);
        }
        // Reallocation pops in LIFO order: the reverse of the frees.
        for &expected in first.iter().rev() {
            let again = heap.allocate(64, &mut frames).unwrap();
            assert_eq!(again, expected);
        }
        for &ptr in &first {
            heap.free(ptr, &mut frames);
        }
    }

    #[test]
    fn test_repeated_alloc_free_is_idempotent_on_cache_state() {
        let pmm = test_pmm(16);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        // Prime the cache so the first allocation isn't special.
        let warm = heap.allocate(256, &mut frames).unwrap();
        heap.free(warm, &mut frames);
        let cells_before = heap.free_cells(4);

        for _ in 0..50 {
            let p = heap.allocate(256, &mut frames).unwrap();
            heap.free(p, &mut frames);
        }
        assert_eq!(heap.free_cells(4), cells_before);
    }

    #[test]
    fn test_class_boundary_at_2048() {
        let pmm = test_pmm(32);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        // 2048 takes the largest class: not page aligned, header present.
        let slab = heap.allocate(2048, &mut frames).unwrap();
        assert_ne!(slab.as_ptr() as usize % PAGE_SIZE, 0);
        let (allocs, _) = heap.class_counters(7);
        assert_eq!(allocs, 1);

        // 2049 takes the page path: page aligned, sidecar tracked.
        let big = heap.allocate(2049, &mut frames).unwrap();
        assert_eq!(big.as_ptr() as usize % PAGE_SIZE, 0);

        let before = pmm.free_bytes();
        heap.free(big, &mut frames);
        assert_eq!(pmm.free_bytes(), before + PAGE_SIZE as u64);
        heap.free(slab, &mut frames);
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let pmm = test_pmm(4);
        let mut frames = &pmm;
        let mut heap = Heap::new();
        assert!(heap.allocate(0, &mut frames).is_err());
    }

    #[test]
    fn test_large_allocation_spans_pages_and_frees_fully() {
        let pmm = test_pmm(32);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        let before = pmm.free_bytes();
        let big = heap.allocate(3 * PAGE_SIZE + 7, &mut frames).unwrap();
        assert_eq!(pmm.free_bytes(), before - 4 * PAGE_SIZE as u64);
        heap.free(big, &mut frames);
        assert_eq!(pmm.free_bytes(), before);
    }

    #[test]
    fn test_free_with_bad_magic_is_rejected() {
        let pmm = test_pmm(16);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        let ptr = heap.allocate(64, &mut frames).unwrap();
        // Clobber the magic; the free must not touch the cache.
        // SAFETY: We own the object and are deliberately corrupting our
        // own header to exercise the reject path.
        unsafe {
            (*(ptr.as_ptr().sub(HEADER_SIZE) as *mut SlabHeader)).magic = 0xBAD0_BAD0;
        }
        let (_, frees_before) = heap.class_counters(2);
        heap.free(ptr, &mut frames);
        let (_, frees_after) = heap.class_counters(2);
        assert_eq!(frees_before, frees_after);
    }

    #[test]
    fn test_slab_recycles_cells_without_scrubbing() {
        let pmm = test_pmm(16);
        let mut frames = &pmm;
        let mut heap = Heap::new();

        let p = heap.allocate(64, &mut frames).unwrap();
        // SAFETY: 64 usable bytes were just allocated.
        unsafe { ptr::write_bytes(p.as_ptr(), 0xEE, 64) };
        heap.free(p, &mut frames);

        // The raw slab path recycles the dirty cell as-is...
        let q = heap.allocate(64, &mut frames).unwrap();
        assert_eq!(q, p);
        // SAFETY: Same cell, reallocated to us.
        let byte = unsafe { *q.as_ptr() };
        assert_eq!(byte, 0xEE);
        heap.free(q, &mut frames);
    }
}
