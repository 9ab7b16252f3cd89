//! Virtual memory manager: 4-level paging on x86-64.
//!
//! Every address space shares the kernel's upper half (PML4 indices
//! 256..512) by copying those entries at creation -- they point at the
//! same physical tables, so kernel mappings are uniformly visible from
//! every process without per-process maintenance. A recursive self-map
//! sits at PML4 index 510. Page-table pages themselves are read and
//! edited through the higher-half direct map.
//!
//! Teardown of intermediate tables is deliberately not implemented:
//! address spaces live until shutdown in this kernel.

use bitflags::bitflags;

use crate::error::KernelResult;

use super::{
    phys_to_virt, FrameSource, PhysicalAddress, VirtualAddress, HUGE_PAGE_SIZE, PAGE_SIZE,
};

/// Entries per page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// PML4 slot of the recursive self-mapping.
pub const RECURSIVE_INDEX: usize = 510;

/// First PML4 slot of the shared kernel half.
const KERNEL_HALF_START: usize = 256;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 2 MiB leaf when set on a PD entry.
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical-address bits of an entry (bits 12..52).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One 64-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }

    /// Physical address this entry points to.
    pub const fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ENTRY_ADDR_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        self.0 = (addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// A 4 KiB page of 512 entries; one level of the paging trie.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// 9-bit slices of a canonical virtual address.
const fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

const fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

const fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

const fn pt_index(virt: u64) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

/// Borrow a page-table page through the direct map.
fn table_mut<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: `phys` names a page-table frame owned by the address space
    // being edited, and the direct map covers all of physical memory.
    // Mutation is serialized by the per-address-space usage pattern (one
    // editor at a time during init and process creation).
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

/// Invalidate one TLB entry on the current CPU. A store to a page table
/// followed by this guarantees the next access on this CPU sees the new
/// mapping; cross-CPU shootdown is out of scope.
fn flush_tlb(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// An address space: the physical address of its root PML4, loadable into
/// CR3 as-is.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Wrap an existing root table.
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// The CR3 value for this address space.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Allocate a fresh root with only the recursive self-map installed.
    pub fn allocate_root(frames: &mut impl FrameSource) -> KernelResult<Self> {
        let root = frames.alloc_frame()?;
        let table = table_mut(root);
        table[RECURSIVE_INDEX].set(root, PageFlags::PRESENT | PageFlags::WRITABLE);
        Ok(Self { root })
    }

    /// Create a new address space sharing the kernel's upper half.
    ///
    /// The upper 256 PML4 entries are copied verbatim: they reference the
    /// same physical tables, so any later change to a shared kernel
    /// mapping propagates to every address space.
    pub fn new(kernel: &AddressSpace, frames: &mut impl FrameSource) -> KernelResult<Self> {
        let space = Self::allocate_root(frames)?;
        let src = table_mut(kernel.root);
        let dst = table_mut(space.root);
        for i in KERNEL_HALF_START..PAGE_TABLE_ENTRIES {
            if i != RECURSIVE_INDEX && src[i].is_present() {
                dst[i] = src[i];
            }
        }
        Ok(space)
    }

    /// Walk to the table at `level` below the root for `virt`, creating
    /// missing intermediate tables along the way.
    fn walk_create(
        &self,
        virt: u64,
        levels: &[usize],
        frames: &mut impl FrameSource,
    ) -> KernelResult<&mut PageTable> {
        let mut table = table_mut(self.root);
        for &index_of in levels {
            let index = match index_of {
                4 => pml4_index(virt),
                3 => pdpt_index(virt),
                2 => pd_index(virt),
                _ => unreachable!(),
            };
            let entry = &mut table[index];
            if !entry.is_present() {
                let frame = frames.alloc_frame()?;
                entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
            }
            table = table_mut(entry.addr());
        }
        Ok(table)
    }

    /// Map one 4 KiB page. An already-present leaf is cleared and
    /// invalidated before the new entry is written.
    pub fn map_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let v = virt.as_u64();
        let pt = self.walk_create(v, &[4, 3, 2], frames)?;
        let entry = &mut pt[pt_index(v)];
        if entry.is_present() {
            entry.clear();
            flush_tlb(virt);
        }
        entry.set(phys, flags | PageFlags::PRESENT);
        flush_tlb(virt);
        Ok(())
    }

    /// Map one 2 MiB huge page (PD-level leaf).
    pub fn map_huge_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let v = virt.as_u64();
        let pd = self.walk_create(v, &[4, 3], frames)?;
        let entry = &mut pd[pd_index(v)];
        if entry.is_present() {
            entry.clear();
            flush_tlb(virt);
        }
        let base = PhysicalAddress::new(phys.as_u64() & !(HUGE_PAGE_SIZE as u64 - 1));
        entry.set(base, flags | PageFlags::PRESENT | PageFlags::HUGE);
        flush_tlb(virt);
        Ok(())
    }

    /// Allocate `count` fresh frames and map them contiguously at `virt`.
    /// On any intermediate failure all prior mappings in the batch are
    /// rolled back and their frames returned.
    pub fn map_pages(
        &self,
        virt: VirtualAddress,
        count: usize,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        for i in 0..count {
            let page = virt.offset((i * PAGE_SIZE) as u64);
            let outcome = match frames.alloc_frame() {
                Ok(frame) => self.map_page(page, frame, flags, frames),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                for j in 0..i {
                    let mapped = virt.offset((j * PAGE_SIZE) as u64);
                    if let Some(frame) = self.get_phys(mapped) {
                        self.unmap_page(mapped);
                        frames.free_frame(PhysicalAddress::new(
                            frame.as_u64() & !(PAGE_SIZE as u64 - 1),
                        ));
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down the leaf mapping for `virt`. Intermediate tables are
    /// left in place.
    pub fn unmap_page(&self, virt: VirtualAddress) {
        let v = virt.as_u64();
        let pml4 = table_mut(self.root);
        let pml4e = pml4[pml4_index(v)];
        if !pml4e.is_present() {
            return;
        }
        let pdpt = table_mut(pml4e.addr());
        let pdpte = pdpt[pdpt_index(v)];
        if !pdpte.is_present() {
            return;
        }
        let pd = table_mut(pdpte.addr());
        let pde = &mut pd[pd_index(v)];
        if !pde.is_present() {
            return;
        }
        if pde.is_huge() {
            pde.clear();
            flush_tlb(virt);
            return;
        }
        let pt = table_mut(pde.addr());
        pt[pt_index(v)].clear();
        flush_tlb(virt);
    }

    /// Translate `virt` through this address space's tables. Honours the
    /// HUGE bit at PD level; `None` when any level is non-present.
    pub fn get_phys(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let v = virt.as_u64();
        let pml4 = table_mut(self.root);
        let pml4e = pml4[pml4_index(v)];
        if !pml4e.is_present() {
            return None;
        }
        let pdpt = table_mut(pml4e.addr());
        let pdpte = pdpt[pdpt_index(v)];
        if !pdpte.is_present() {
            return None;
        }
        let pd = table_mut(pdpte.addr());
        let pde = pd[pd_index(v)];
        if !pde.is_present() {
            return None;
        }
        if pde.is_huge() {
            let base = pde.addr().as_u64() & !(HUGE_PAGE_SIZE as u64 - 1);
            return Some(PhysicalAddress::new(base | (v & (HUGE_PAGE_SIZE as u64 - 1))));
        }
        let pt = table_mut(pde.addr());
        let pte = pt[pt_index(v)];
        if !pte.is_present() {
            return None;
        }
        Some(PhysicalAddress::new(
            pte.addr().as_u64() | (v & (PAGE_SIZE as u64 - 1)),
        ))
    }
}

// ---------------------------------------------------------------------------
// Kernel address space
// ---------------------------------------------------------------------------

use crate::sync::SpinLock;

/// The kernel's address space, established by [`init`].
static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

/// Amount of physical memory covered by the higher-half direct map.
#[cfg(target_os = "none")]
const DIRECT_MAP_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Build the kernel address space and switch to it.
///
/// Identity-maps the first 1 GiB with huge pages (low MMIO stays
/// reachable during bring-up), establishes the 16 GiB direct map in the
/// higher half, maps the VGA text buffer at its canonical higher-half
/// address, installs the recursive entry and loads CR3.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    use super::KERNEL_HIGHER_HALF;

    let mut frames = super::pmm::global();
    // Root-table allocation failure at init is unrecoverable.
    let space = AddressSpace::allocate_root(&mut frames)
        .unwrap_or_else(|_| panic!("VMM: failed to allocate kernel PML4"));

    let rw = PageFlags::WRITABLE;
    let rw_global = PageFlags::WRITABLE | PageFlags::GLOBAL;

    // Identity map the first 1 GiB with 2 MiB pages.
    let mut addr: u64 = 0;
    while addr < 0x4000_0000 {
        space.map_huge_page(
            VirtualAddress::new(addr),
            PhysicalAddress::new(addr),
            rw,
            &mut frames,
        )?;
        addr += HUGE_PAGE_SIZE as u64;
    }

    // Higher-half direct map of physical memory (kernel image included).
    let mut off: u64 = 0;
    while off < DIRECT_MAP_BYTES {
        space.map_huge_page(
            VirtualAddress::new(KERNEL_HIGHER_HALF + off),
            PhysicalAddress::new(off),
            rw_global,
            &mut frames,
        )?;
        off += HUGE_PAGE_SIZE as u64;
    }

    // Legacy VGA text buffer at its canonical higher-half alias.
    space.map_page(
        VirtualAddress::new(0xFFFF_FFFF_800B_8000),
        PhysicalAddress::new(0xB8000),
        rw_global,
        &mut frames,
    )?;

    // SAFETY: The tables above map the kernel image, the direct map and
    // the identity region; switching CR3 to them keeps all live code and
    // data addressable.
    unsafe {
        crate::arch::x86_64::mmu::write_cr3(space.root());
    }

    *KERNEL_SPACE.lock() = Some(space);
    println!(
        "[VMM] kernel PML4 at {:#x}, 4-level paging active",
        space.root().as_u64()
    );
    Ok(())
}

/// The kernel address space. Panics before [`init`].
pub fn kernel_space() -> AddressSpace {
    KERNEL_SPACE
        .lock()
        .as_ref()
        .copied()
        .expect("VMM not initialized")
}

/// Create a process address space sharing the kernel upper half, backed
/// by the global PMM. Returns the CR3-loadable root.
pub fn create_address_space() -> KernelResult<AddressSpace> {
    let kernel = kernel_space();
    AddressSpace::new(&kernel, &mut super::pmm::global())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{early::EarlyAllocator, pmm::Pmm, testmem, MemoryRegion};

    fn test_frames(pages: u64) -> Pmm {
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
    fn test_map_then_translate() {
        let pmm = test_frames(32);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let virt = VirtualAddress::new(0xFFFF_FFFF_C000_0000);
        let phys = frames.alloc_frame().unwrap();
        space
            .map_page(virt, phys, PageFlags::WRITABLE, &mut frames)
            .unwrap();

        let got = space.get_phys(VirtualAddress::new(virt.as_u64() + 0x234)).unwrap();
        assert_eq!(got.as_u64(), phys.as_u64() + 0x234);
    }

    #[test]
    fn test_two_adjacent_pages_translate_contiguously() {
        let pmm = test_frames(32);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let virt = VirtualAddress::new(0xFFFF_FFFF_C000_0000);
        let p0 = frames.alloc_frame().unwrap();
        let p1 = PhysicalAddress::new(p0.as_u64() + PAGE_SIZE as u64);
        space.map_page(virt, p0, PageFlags::WRITABLE, &mut frames).unwrap();
        space
            .map_page(
                virt.offset(PAGE_SIZE as u64),
                p1,
                PageFlags::WRITABLE,
                &mut frames,
            )
            .unwrap();

        // An offset that crosses into the second page still lands at the
        // contiguous physical byte.
        let got = space.get_phys(VirtualAddress::new(virt.as_u64() + 0x1234)).unwrap();
        assert_eq!(got.as_u64(), p0.as_u64() + 0x1234);
    }

    #[test]
    fn test_unmap_round_trip() {
        let pmm = test_frames(32);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let virt = VirtualAddress::new(0x4000_0000);
        let phys = frames.alloc_frame().unwrap();
        space.map_page(virt, phys, PageFlags::WRITABLE, &mut frames).unwrap();
        assert!(space.get_phys(virt).is_some());

        space.unmap_page(virt);
        assert!(space.get_phys(virt).is_none());
    }

    #[test]
    fn test_remap_replaces_existing_leaf() {
        let pmm = test_frames(32);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let virt = VirtualAddress::new(0x4000_0000);
        let p0 = frames.alloc_frame().unwrap();
        let p1 = frames.alloc_frame().unwrap();
        space.map_page(virt, p0, PageFlags::WRITABLE, &mut frames).unwrap();
        space.map_page(virt, p1, PageFlags::WRITABLE, &mut frames).unwrap();
        assert_eq!(space.get_phys(virt).unwrap(), p1);
    }

    #[test]
    fn test_huge_page_offset_preserved() {
        let pmm = test_frames(32);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let virt = VirtualAddress::new(0x8000_0000);
        let phys = PhysicalAddress::new(0x20_0000);
        space
            .map_huge_page(virt, phys, PageFlags::WRITABLE, &mut frames)
            .unwrap();

        let probe = VirtualAddress::new(virt.as_u64() + 0x12_3456);
        let got = space.get_phys(probe).unwrap();
        assert_eq!(got.as_u64(), 0x20_0000 + 0x12_3456);
    }

    #[test]
    fn test_map_pages_rollback_restores_frames() {
        // Enough frames for the tables but not for the whole batch.
        let pmm = test_frames(8);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();

        let before = pmm.free_bytes();
        let virt = VirtualAddress::new(0x4000_0000);
        let result = space.map_pages(virt, 64, PageFlags::WRITABLE, &mut frames);
        assert!(result.is_err());
        // Every mapping in the failed batch was unwound.
        for i in 0..64u64 {
            assert!(space
                .get_phys(virt.offset(i * PAGE_SIZE as u64))
                .is_none());
        }
        // The intermediate tables stay allocated (teardown is a
        // non-goal), but every data frame came back.
        let tables = 3 * PAGE_SIZE as u64; // PDPT + PD + PT
        assert_eq!(pmm.free_bytes(), before - tables);
    }

    #[test]
    fn test_address_space_shares_kernel_upper_half() {
        let pmm = test_frames(48);
        let mut frames = &pmm;
        let kernel = AddressSpace::allocate_root(&mut frames).unwrap();

        // A kernel-half mapping made before the child exists...
        let kvirt = VirtualAddress::new(0xFFFF_8000_1000_0000);
        let kphys = frames.alloc_frame().unwrap();
        kernel
            .map_page(kvirt, kphys, PageFlags::WRITABLE | PageFlags::GLOBAL, &mut frames)
            .unwrap();

        let child = AddressSpace::new(&kernel, &mut frames).unwrap();
        // ...is visible through the child (same physical tables).
        assert_eq!(child.get_phys(kvirt).unwrap(), kphys);

        // And a kernel-half mapping made afterwards propagates too,
        // because the shared PML4 entry points at the same PDPT.
        let kvirt2 = VirtualAddress::new(0xFFFF_8000_1040_0000);
        let kphys2 = frames.alloc_frame().unwrap();
        kernel
            .map_page(kvirt2, kphys2, PageFlags::WRITABLE, &mut frames)
            .unwrap();
        assert_eq!(child.get_phys(kvirt2).unwrap(), kphys2);

        // Lower halves stay independent.
        let uvirt = VirtualAddress::new(0x40_0000);
        let uphys = frames.alloc_frame().unwrap();
        child.map_page(uvirt, uphys, PageFlags::USER, &mut frames).unwrap();
        assert!(kernel.get_phys(uvirt).is_none());
    }

    #[test]
    fn test_recursive_entry_points_at_root() {
        let pmm = test_frames(16);
        let mut frames = &pmm;
        let space = AddressSpace::allocate_root(&mut frames).unwrap();
        let root = table_mut(space.root());
        assert!(root[RECURSIVE_INDEX].is_present());
        assert_eq!(root[RECURSIVE_INDEX].addr(), space.root());
    }
}
