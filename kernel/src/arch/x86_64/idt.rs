//! Interrupt descriptor table.
//!
//! Vectors 0..32 are the architectural exceptions: report and panic
//! (the page fault additionally decodes CR2 and the error bits).
//! Vectors 32..48 carry the legacy IRQs remapped through the APIC; they
//! run the registered handler, signal EOI, and then take any reschedule
//! the timer requested -- after EOI, so the switch never leaves the
//! controller waiting. Vector 0x80 stays reserved for a future syscall
//! gate.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::apic;
use crate::irq;

/// Exception mnemonics, indexed by vector (from the Intel SDM).
const EXCEPTION_NAMES: [&str; 32] = [
    "Division Error",
    "Debug",
    "NMI",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD FP",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Security Exception",
    "Reserved",
];

/// Report an exception and halt. Unrecoverable by design: the kernel
/// does not run user code, so any fault is a kernel bug.
fn exception_panic(vector: usize, error_code: Option<u64>, frame: &InterruptStackFrame) -> ! {
    println!("EXCEPTION {}: {}", vector, EXCEPTION_NAMES[vector]);
    if let Some(code) = error_code {
        println!("  error code: {:#x}", code);
    }
    println!("  rip: {:#x}", frame.instruction_pointer.as_u64());
    panic!("unhandled exception");
}

macro_rules! exception_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            exception_panic($vector, None, &frame);
        }
    };
    ($name:ident, $vector:expr, with_error) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            exception_panic($vector, Some(error_code), &frame);
        }
    };
}

exception_handler!(divide_error_handler, 0);
exception_handler!(debug_handler, 1);
exception_handler!(nmi_handler, 2);
exception_handler!(breakpoint_handler, 3);
exception_handler!(overflow_handler, 4);
exception_handler!(bound_range_handler, 5);
exception_handler!(invalid_opcode_handler, 6);
exception_handler!(device_not_available_handler, 7);
exception_handler!(invalid_tss_handler, 10, with_error);
exception_handler!(segment_not_present_handler, 11, with_error);
exception_handler!(stack_fault_handler, 12, with_error);
exception_handler!(general_protection_handler, 13, with_error);

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    println!("EXCEPTION 8: Double Fault (error code {:#x})", error_code);
    println!("  rip: {:#x}", frame.instruction_pointer.as_u64());
    panic!("double fault");
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let raw = error_code.bits();
    println!("EXCEPTION 14: Page Fault");
    println!("  linear address: {:#x}", super::mmu::read_fault_address());
    println!(
        "  present: {}, write: {}, user: {}",
        raw & 1 != 0,
        raw & 2 != 0,
        raw & 4 != 0
    );
    println!("  rip: {:#x}", frame.instruction_pointer.as_u64());
    panic!("page fault");
}

/// IRQ entry: run the registered handler, signal end-of-interrupt, then
/// honor a pending reschedule request.
fn irq_common(irq: u8) {
    irq::dispatch(irq);
    apic::send_eoi();
    if crate::sched::scheduler::take_need_resched() {
        crate::sched::schedule();
    }
}

macro_rules! irq_entry {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            irq_common($irq);
        }
    };
}

irq_entry!(irq0_entry, 0);
irq_entry!(irq1_entry, 1);
irq_entry!(irq2_entry, 2);
irq_entry!(irq3_entry, 3);
irq_entry!(irq4_entry, 4);
irq_entry!(irq5_entry, 5);
irq_entry!(irq6_entry, 6);
irq_entry!(irq7_entry, 7);
irq_entry!(irq8_entry, 8);
irq_entry!(irq9_entry, 9);
irq_entry!(irq10_entry, 10);
irq_entry!(irq11_entry, 11);
irq_entry!(irq12_entry, 12);
irq_entry!(irq13_entry, 13);
irq_entry!(irq14_entry, 14);
irq_entry!(irq15_entry, 15);

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {
    // Spurious LAPIC vector: no EOI, nothing to do.
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: The IST index names the emergency stack the GDT set up.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[32].set_handler_fn(irq0_entry);
        idt[33].set_handler_fn(irq1_entry);
        idt[34].set_handler_fn(irq2_entry);
        idt[35].set_handler_fn(irq3_entry);
        idt[36].set_handler_fn(irq4_entry);
        idt[37].set_handler_fn(irq5_entry);
        idt[38].set_handler_fn(irq6_entry);
        idt[39].set_handler_fn(irq7_entry);
        idt[40].set_handler_fn(irq8_entry);
        idt[41].set_handler_fn(irq9_entry);
        idt[42].set_handler_fn(irq10_entry);
        idt[43].set_handler_fn(irq11_entry);
        idt[44].set_handler_fn(irq12_entry);
        idt[45].set_handler_fn(irq13_entry);
        idt[46].set_handler_fn(irq14_entry);
        idt[47].set_handler_fn(irq15_entry);

        // 0x80 stays unset: reserved for a future syscall gate.

        idt[0xFF].set_handler_fn(spurious_handler);

        idt
    };
}

/// Load the IDT.
pub fn init() {
    IDT.load();
    println!("[IDT] 256 vectors installed");
}
