//! Physical memory manager.
//!
//! Page-granular allocation from the bootloader memory map, partitioned
//! into three zones by DMA reach: DMA (< 16 MiB), DMA32 (< 4 GiB) and
//! NORMAL (everything above). Each zone tracks its frames in a bitmap
//! (bit set = allocated or reserved) guarded by an interrupt-safe
//! spinlock. Allocation is linear first-fit; a buddy structure can slot
//! in behind the same interface later.
//!
//! Pages are zero-filled on allocation, not on free: the cost is paid on
//! the path that hands memory to a new owner, and stale data never leaks
//! between owners.

use core::ptr::NonNull;

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use super::{
    early::EarlyAllocator, phys_to_virt, virt_to_phys, zero_frames, FrameSource, MemoryRegion,
    PhysicalAddress, RegionKind, VirtualAddress, HUGE_PAGE_FRAMES, PAGE_SIZE,
};

/// Number of memory zones.
pub const ZONE_COUNT: usize = 3;

/// Upper bound of the DMA zone (ISA DMA reach).
const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// Upper bound of the DMA32 zone (32-bit device reach).
const DMA32_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Everything below 1 MiB belongs to the BIOS and legacy MMIO.
const LOW_MEMORY_LIMIT: u64 = 0x100000;

/// PFNs below this are reserved for the kernel image and early boot data.
const KERNEL_RESERVE_PFN: u64 = 0x1000; // 16 MiB

/// Memory zone classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// < 16 MiB, reachable by ISA DMA.
    Dma = 0,
    /// < 4 GiB, reachable by 32-bit devices.
    Dma32 = 1,
    /// Everything above 4 GiB.
    Normal = 2,
}

impl ZoneKind {
    /// Classify a memory-map range by its end address. A range is owned
    /// by exactly one zone.
    pub fn for_range_end(end: PhysicalAddress) -> Self {
        if end.as_u64() <= DMA_LIMIT {
            ZoneKind::Dma
        } else if end.as_u64() <= DMA32_LIMIT {
            ZoneKind::Dma32
        } else {
            ZoneKind::Normal
        }
    }
}

/// Outcome of returning one frame to a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeOutcome {
    Freed,
    DoubleFree,
    OutOfRange,
}

/// One memory zone: a PFN range, its allocation bitmap, and counters.
pub struct Zone {
    kind: ZoneKind,
    /// First PFN of the zone's bounding box (inclusive).
    base_pfn: u64,
    /// One past the last PFN (exclusive).
    end_pfn: u64,
    /// Frames contributed by usable memory-map ranges.
    total_pages: u64,
    /// Currently free frames.
    free_pages: u64,
    /// `bitmap[i] = 1` iff frame `base_pfn + i` is allocated or reserved.
    bitmap: Option<NonNull<u64>>,
}

// SAFETY: The bitmap storage is carved out of the early allocator window
// during init and is owned exclusively by this zone for the lifetime of
// the kernel; all access goes through the enclosing SpinLock.
unsafe impl Send for Zone {}

impl Zone {
    const fn empty(kind: ZoneKind) -> Self {
        Self {
            kind,
            base_pfn: u64::MAX,
            end_pfn: 0,
            total_pages: 0,
            free_pages: 0,
            bitmap: None,
        }
    }

    /// Width of the zone's bounding box in frames.
    fn span(&self) -> u64 {
        if self.base_pfn == u64::MAX {
            0
        } else {
            self.end_pfn - self.base_pfn
        }
    }

    fn contains(&self, pfn: u64) -> bool {
        self.bitmap.is_some() && pfn >= self.base_pfn && pfn < self.end_pfn
    }

    fn words(&self) -> usize {
        (self.span() as usize + 63) / 64
    }

    fn bit_test(&self, idx: u64) -> bool {
        debug_assert!(idx < self.span());
        let bitmap = self.bitmap.expect("zone bitmap not allocated");
        // SAFETY: `idx < span` and the bitmap was sized to cover the span.
        unsafe { *bitmap.as_ptr().add(idx as usize / 64) >> (idx % 64) & 1 != 0 }
    }

    fn bit_set(&mut self, idx: u64) {
        debug_assert!(idx < self.span());
        let bitmap = self.bitmap.expect("zone bitmap not allocated");
        // SAFETY: As in `bit_test`; the zone lock gives exclusive access.
        unsafe { *bitmap.as_ptr().add(idx as usize / 64) |= 1 << (idx % 64) }
    }

    fn bit_clear(&mut self, idx: u64) {
        debug_assert!(idx < self.span());
        let bitmap = self.bitmap.expect("zone bitmap not allocated");
        // SAFETY: As in `bit_test`; the zone lock gives exclusive access.
        unsafe { *bitmap.as_ptr().add(idx as usize / 64) &= !(1 << (idx % 64)) }
    }

    /// Extend the bounding box to cover `[start, end)` and account the
    /// frames as belonging to this zone.
    fn grow(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let start_pfn = start.pfn();
        let end_pfn = end.pfn();
        if start_pfn < self.base_pfn {
            self.base_pfn = start_pfn;
        }
        if end_pfn > self.end_pfn {
            self.end_pfn = end_pfn;
        }
        self.total_pages += end_pfn - start_pfn;
    }

    /// Attach an all-ones bitmap covering the bounding box.
    fn attach_bitmap(&mut self, storage: PhysicalAddress) {
        let ptr = phys_to_virt(storage).as_mut_ptr::<u64>();
        // SAFETY: `storage` was just handed out by the early allocator and
        // sized for `words()` u64s; nothing else references it.
        unsafe {
            core::ptr::write_bytes(ptr, 0xFF, self.words() * 8);
        }
        self.bitmap = NonNull::new(ptr);
    }

    /// Mark one frame available (second init pass).
    fn mark_available(&mut self, pfn: u64) {
        if !self.contains(pfn) {
            return;
        }
        let idx = pfn - self.base_pfn;
        if self.bit_test(idx) {
            self.bit_clear(idx);
            self.free_pages += 1;
        }
    }

    /// Mark one frame reserved (kernel image / early data), never to be
    /// handed out.
    fn reserve(&mut self, pfn: u64) {
        if !self.contains(pfn) {
            return;
        }
        let idx = pfn - self.base_pfn;
        if !self.bit_test(idx) {
            self.bit_set(idx);
            self.free_pages -= 1;
        }
    }

    /// First-fit allocation of `count` contiguous frames, optionally
    /// aligned to `align` frames. Returns the first PFN.
    fn alloc_frames(&mut self, count: u64, align: u64) -> Option<u64> {
        if self.free_pages < count || self.bitmap.is_none() {
            return None;
        }

        let mut run = 0u64;
        let mut start = 0u64;
        for idx in 0..self.span() {
            if run == 0 && (self.base_pfn + idx) % align != 0 {
                continue;
            }
            if self.bit_test(idx) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = idx;
            }
            run += 1;
            if run == count {
                for j in start..start + count {
                    self.bit_set(j);
                }
                self.free_pages -= count;
                return Some(self.base_pfn + start);
            }
        }
        None
    }

    /// Return one frame to the zone.
    fn free_frame(&mut self, pfn: u64) -> FreeOutcome {
        if !self.contains(pfn) {
            return FreeOutcome::OutOfRange;
        }
        let idx = pfn - self.base_pfn;
        if !self.bit_test(idx) {
            return FreeOutcome::DoubleFree;
        }
        self.bit_clear(idx);
        self.free_pages += 1;
        FreeOutcome::Freed
    }

    /// Free frames in this zone.
    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    /// Count of clear bits within the bounding box. Together with
    /// `free_pages` this checks the zone's core invariant:
    /// `popcount(bitmap) + free_pages == span`.
    pub fn bitmap_free_bits(&self) -> u64 {
        let Some(bitmap) = self.bitmap else { return 0 };
        let span = self.span();
        let mut clear = 0u64;
        for w in 0..self.words() {
            // SAFETY: `w < words()`, within the bitmap allocation.
            let mut word = unsafe { *bitmap.as_ptr().add(w) };
            let base = w as u64 * 64;
            if base + 64 > span {
                // Mask off the tail bits beyond the span.
                word |= !0u64 << (span - base);
            }
            clear += word.count_zeros() as u64;
        }
        clear
    }
}

/// The zoned physical allocator. One instance serves the whole machine;
/// hosted tests build private instances over claimed windows.
pub struct Pmm {
    zones: [SpinLock<Zone>; ZONE_COUNT],
}

impl Pmm {
    pub const fn new() -> Self {
        Self {
            zones: [
                SpinLock::new(Zone::empty(ZoneKind::Dma)),
                SpinLock::new(Zone::empty(ZoneKind::Dma32)),
                SpinLock::new(Zone::empty(ZoneKind::Normal)),
            ],
        }
    }

    /// Build the zones from the bootloader memory map.
    ///
    /// Usable ranges are page-aligned inward and clipped below 1 MiB;
    /// each surviving range is classified into exactly one zone by its
    /// end address. Bitmaps (initially all-ones) come from the early
    /// allocator; a second pass clears the bits of frames that are
    /// actually available; finally the first 16 MiB of physical memory
    /// is reserved for the kernel image and early data.
    pub fn init(&self, regions: &[MemoryRegion], early: &mut EarlyAllocator) {
        // First pass: zone bounding boxes.
        for (start, end) in usable_ranges(regions) {
            let kind = ZoneKind::for_range_end(end);
            let mut zone = self.zones[kind as usize].lock();
            zone.grow(start, end);
            println!(
                "[PMM] zone {:?}: {:#x} - {:#x} ({} MiB)",
                kind,
                start.as_u64(),
                end.as_u64(),
                (end.as_u64() - start.as_u64()) / (1024 * 1024)
            );
        }

        // Allocate all-ones bitmaps for the populated zones.
        for lock in &self.zones {
            let mut zone = lock.lock();
            if zone.total_pages == 0 {
                continue;
            }
            let bitmap_bytes = zone.words() * 8;
            let storage = early.alloc((bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE);
            zone.attach_bitmap(storage);
        }

        // Second pass: clear the bits of frames that are actually there.
        for (start, end) in usable_ranges(regions) {
            let kind = ZoneKind::for_range_end(end);
            let mut zone = self.zones[kind as usize].lock();
            for pfn in start.pfn()..end.pfn() {
                zone.mark_available(pfn);
            }
        }

        // Reserve the kernel image and early boot data (first 16 MiB).
        for lock in &self.zones {
            let mut zone = lock.lock();
            if zone.bitmap.is_none() {
                continue;
            }
            let top = KERNEL_RESERVE_PFN.min(zone.end_pfn);
            for pfn in zone.base_pfn..top {
                zone.reserve(pfn);
            }
        }

        let stats = self.stats();
        println!(
            "[PMM] {} MiB total, {} MiB free",
            stats.total_bytes / (1024 * 1024),
            stats.free_bytes / (1024 * 1024)
        );
    }

    /// Allocate one zeroed page, preferring high zones so DMA-capable
    /// memory stays available for drivers that need it.
    pub fn alloc_page(&self) -> KernelResult<VirtualAddress> {
        self.alloc_pages(1)
    }

    /// Allocate `count` zeroed, physically contiguous pages.
    pub fn alloc_pages(&self, count: usize) -> KernelResult<VirtualAddress> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "zero pages",
            });
        }
        self.alloc_in_zones(count as u64, 1)
    }

    /// Allocate a 2 MiB-aligned run of 512 zeroed frames.
    pub fn alloc_huge_page(&self) -> KernelResult<VirtualAddress> {
        self.alloc_in_zones(HUGE_PAGE_FRAMES, HUGE_PAGE_FRAMES)
    }

    fn alloc_in_zones(&self, count: u64, align: u64) -> KernelResult<VirtualAddress> {
        for kind in [ZoneKind::Normal, ZoneKind::Dma32, ZoneKind::Dma] {
            let pfn = {
                let mut zone = self.zones[kind as usize].lock();
                zone.alloc_frames(count, align)
            };
            if let Some(pfn) = pfn {
                let phys = PhysicalAddress::new(pfn * PAGE_SIZE as u64);
                zero_frames(phys, count as usize);
                return Ok(phys_to_virt(phys));
            }
        }
        Err(KernelError::OutOfMemory {
            requested: count as usize * PAGE_SIZE,
        })
    }

    /// Return one page. Double frees and out-of-range addresses are
    /// diagnostics-only: logged, state untouched.
    pub fn free_page(&self, virt: VirtualAddress) {
        let pfn = virt_to_phys(virt).pfn();
        for lock in &self.zones {
            let outcome = {
                let mut zone = lock.lock();
                zone.free_frame(pfn)
            };
            match outcome {
                FreeOutcome::Freed => return,
                FreeOutcome::DoubleFree => {
                    log::warn!("PMM: double free of frame {:#x}", pfn * PAGE_SIZE as u64);
                    return;
                }
                FreeOutcome::OutOfRange => continue,
            }
        }
        log::warn!("PMM: free of invalid address {:#x}", virt.as_u64());
    }

    /// Return `count` pages starting at `virt`.
    pub fn free_pages(&self, virt: VirtualAddress, count: usize) {
        for i in 0..count {
            self.free_page(virt.offset((i * PAGE_SIZE) as u64));
        }
    }

    /// Total free bytes across all zones.
    pub fn free_bytes(&self) -> u64 {
        self.zones
            .iter()
            .map(|z| z.lock().free_pages() * PAGE_SIZE as u64)
            .sum()
    }

    /// Snapshot of the allocator counters.
    pub fn stats(&self) -> PmmStats {
        let mut total = 0;
        let mut free = 0;
        for lock in &self.zones {
            let zone = lock.lock();
            total += zone.total_pages * PAGE_SIZE as u64;
            free += zone.free_pages * PAGE_SIZE as u64;
        }
        PmmStats {
            total_bytes: total,
            used_bytes: total - free,
            free_bytes: free,
        }
    }

    /// Free frames in one zone.
    pub fn zone_free_pages(&self, kind: ZoneKind) -> u64 {
        self.zones[kind as usize].lock().free_pages()
    }

    /// Check `popcount(bitmap) + free_pages == span` for every populated
    /// zone.
    pub fn zones_consistent(&self) -> bool {
        self.zones.iter().all(|lock| {
            let zone = lock.lock();
            zone.bitmap.is_none() || zone.bitmap_free_bits() == zone.free_pages
        })
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for &Pmm {
    fn allocate_frames(&mut self, count: usize) -> KernelResult<PhysicalAddress> {
        self.alloc_pages(count).map(virt_to_phys)
    }

    fn free_frames(&mut self, frame: PhysicalAddress, count: usize) {
        self.free_pages(phys_to_virt(frame), count);
    }
}

/// Usable regions of the memory map, page-aligned inward and clipped
/// below 1 MiB. Yields `(start, end)` pairs.
fn usable_ranges(
    regions: &[MemoryRegion],
) -> impl Iterator<Item = (PhysicalAddress, PhysicalAddress)> + '_ {
    regions.iter().filter_map(|r| {
        if r.kind != RegionKind::Usable {
            return None;
        }
        let mut start = (r.start.as_u64() + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let end = r.end().as_u64() & !(PAGE_SIZE as u64 - 1);
        if end <= LOW_MEMORY_LIMIT {
            return None;
        }
        if start < LOW_MEMORY_LIMIT {
            start = LOW_MEMORY_LIMIT;
        }
        if start >= end {
            return None;
        }
        Some((PhysicalAddress::new(start), PhysicalAddress::new(end)))
    })
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

/// The machine-wide physical allocator.
static PMM: Pmm = Pmm::new();

/// The machine-wide early allocator (zone bitmaps only).
static EARLY: SpinLock<EarlyAllocator> = SpinLock::new(EarlyAllocator::new());

/// Initialize the global PMM from the bootloader memory map.
pub fn init(regions: &[MemoryRegion]) {
    let mut early = EARLY.lock();
    PMM.init(regions, &mut early);
}

/// Allocate one zeroed page from the global PMM.
pub fn alloc_page() -> KernelResult<VirtualAddress> {
    PMM.alloc_page()
}

/// Allocate `count` zeroed contiguous pages from the global PMM.
pub fn alloc_pages(count: usize) -> KernelResult<VirtualAddress> {
    PMM.alloc_pages(count)
}

/// Allocate a 2 MiB huge page from the global PMM.
pub fn alloc_huge_page() -> KernelResult<VirtualAddress> {
    PMM.alloc_huge_page()
}

/// Free one page through the global PMM.
pub fn free_page(virt: VirtualAddress) {
    PMM.free_page(virt)
}

/// Free `count` pages through the global PMM.
pub fn free_pages(virt: VirtualAddress, count: usize) {
    PMM.free_pages(virt, count)
}

/// Free bytes remaining in the global PMM.
pub fn free_bytes() -> u64 {
    PMM.free_bytes()
}

/// Borrow the global PMM (frame source for the VMM and heap).
pub fn global() -> &'static Pmm {
    &PMM
}

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}
