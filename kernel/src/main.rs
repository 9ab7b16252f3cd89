//! Ferrite kernel entry point and boot sequence.
//!
//! The boot glue (out of tree) drops us in long mode with paging on a
//! provisional higher-half mapping and hands over the physical address
//! of the Multiboot2 information structure. Initialization is a strict
//! linear sequence; each stage depends on everything before it:
//! console -> PMM -> VMM -> heap -> GDT/TSS -> IDT -> ACPI -> APIC ->
//! scheduler -> PCI -> network.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use ferrite_kernel::*;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[PANIC] {}", info);
    arch::halt();
}

/// LAPIC timer period in milliseconds.
#[cfg(target_os = "none")]
const TICK_MS: u32 = 10;

/// Periodic tick: scheduler accounting plus the TCP TIME_WAIT
/// countdown. The reschedule itself happens after EOI, in the IRQ
/// dispatcher.
#[cfg(target_os = "none")]
fn timer_irq(_context: usize) {
    sched::timer_tick();
    net::tcp::timer_tick();
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main(mb_info_phys: u64) -> ! {
    logger::init();
    println!();
    println!("Ferrite {} -- x86-64 long mode", env!("CARGO_PKG_VERSION"));

    // SAFETY: The boot glue passes the untouched Multiboot2 hand-off
    // address; nothing has reused those pages yet.
    let boot_info = unsafe {
        arch::x86_64::multiboot::BootInfo::from_phys(mm::PhysicalAddress::new(mb_info_phys))
    }
    .expect("bootloader hand-off is unreadable");

    let mut regions = [mm::MemoryRegion::usable(0, 0); 32];
    let region_count = boot_info.memory_map(&mut regions);
    if region_count == 0 {
        panic!("no memory map from bootloader");
    }

    mm::pmm::init(&regions[..region_count]);
    mm::vmm::init().expect("kernel address space construction failed");
    println!("[HEAP] slab allocator ready (16..2048 byte classes)");

    arch::x86_64::gdt::init();
    arch::x86_64::idt::init();

    match boot_info.rsdp() {
        Some(rsdp) => {
            if let Err(e) = arch::x86_64::acpi::init(rsdp) {
                println!("[ACPI] discovery failed ({}), single CPU assumed", e);
            }
        }
        None => println!("[ACPI] no RSDP from bootloader, single CPU assumed"),
    }

    arch::x86_64::apic::init().expect("APIC bring-up failed");
    x86_64::instructions::interrupts::enable();

    sched::init();
    irq::register_handler(0, timer_irq, 0);
    arch::x86_64::apic::start_timer(irq::IRQ_VECTOR_BASE, TICK_MS)
        .expect("LAPIC timer start failed");

    arch::x86_64::pci::init();
    net::init();

    println!(
        "[OK] ferrite up: {} CPUs, {} MiB free",
        arch::x86_64::acpi::cpu_count(),
        mm::pmm::free_bytes() / (1024 * 1024)
    );

    // The boot context is CPU 0's idle thread: reap dead sockets and
    // halt until the next interrupt.
    loop {
        net::tcp::cleanup();
        x86_64::instructions::hlt();
    }
}

/// Hosted builds only compile the kernel as a library for `cargo test`;
/// this stub keeps the binary target buildable.
#[cfg(not(target_os = "none"))]
fn main() {
    println!(
        "ferrite-kernel {} builds for bare metal; run `cargo test` here",
        env!("CARGO_PKG_VERSION")
    );
}
