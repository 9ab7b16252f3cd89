//! Control-register and MSR access for the memory manager.

use x86_64::registers::{
    control::{Cr2, Cr3, Cr3Flags},
    model_specific::Msr,
};

use crate::mm::PhysicalAddress;

/// Physical address of the active root page table (CR3).
pub fn read_cr3() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64())
}

/// Load a new root page table.
///
/// # Safety
///
/// `root` must point at a valid PML4 that maps all code and data the CPU
/// touches from the instant of the write onward.
pub unsafe fn write_cr3(root: PhysicalAddress) {
    let frame = x86_64::structures::paging::PhysFrame::containing_address(
        x86_64::PhysAddr::new(root.as_u64()),
    );
    // SAFETY: Forwarded contract -- see function doc.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Faulting linear address of the most recent page fault (CR2).
pub fn read_fault_address() -> u64 {
    Cr2::read_raw()
}

/// Read a model-specific register.
pub fn rdmsr(msr: u32) -> u64 {
    // SAFETY: Reading an architectural MSR has no memory-safety impact;
    // callers pass well-known register numbers.
    unsafe { Msr::new(msr).read() }
}

/// Write a model-specific register.
///
/// # Safety
///
/// Writing MSRs changes processor behavior; the caller must know the
/// register and value are architecturally valid.
pub unsafe fn wrmsr(msr: u32, value: u64) {
    // SAFETY: Forwarded contract -- see function doc.
    unsafe {
        Msr::new(msr).write(value);
    }
}
