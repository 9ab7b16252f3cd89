//! Ferrite Kernel Library
//!
//! Core of a small x86-64 long-mode kernel for laptop-class machines
//! (up to 16 GiB of RAM, up to 8 logical processors). This library holds
//! the physical and virtual memory managers, the slab kernel heap, the
//! CFS-style scheduler, interrupt dispatch, and the TCP/IP stack core.
//!
//! The crate is `no_std` on bare metal. When compiled for a hosted target
//! (coverage and unit testing) it links `std`, uses the system allocator,
//! and drives the allocators through a simulated physical-memory window so
//! the same code paths run under `cargo test`.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can allocate and print normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// On bare metal the slab heap backs Rust's `alloc` directly.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod net;
pub mod sched;
pub mod sync;

// Re-export the most commonly used memory types at the crate root.
pub use mm::{PhysicalAddress, VirtualAddress, MemoryRegion, PAGE_SIZE};

/// Heap allocation error handler.
///
/// Allocation failure in the kernel heap is unrecoverable; the
/// alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
