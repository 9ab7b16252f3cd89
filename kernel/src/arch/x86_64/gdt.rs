//! Global descriptor table and TSS.
//!
//! Long mode still needs a GDT for the code/data selectors and the TSS
//! that holds the kernel stack pointer loaded on privilege transitions,
//! plus the IST slot the double-fault handler runs on.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST index reserved for the double-fault handler's emergency stack.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const EMERGENCY_STACK_SIZE: usize = 4096 * 5;

/// Stack for the double-fault handler; a corrupted kernel stack must not
/// take the fault handler down with it.
static mut EMERGENCY_STACK: [u8; EMERGENCY_STACK_SIZE] = [0; EMERGENCY_STACK_SIZE];

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::new());

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());

        {
            let mut tss = TSS.lock();
            // SAFETY: EMERGENCY_STACK is only ever referenced here, once,
            // to compute the IST top-of-stack.
            let stack_top = unsafe {
                VirtAddr::from_ptr(core::ptr::addr_of!(EMERGENCY_STACK)) + EMERGENCY_STACK_SIZE as u64
            };
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_top;
        }

        // The TSS descriptor needs a 'static reference; the Mutex guard
        // cannot provide one, so leak a pointer read under the lock.
        // SAFETY: TSS is a static; the reference lives forever and later
        // RSP0 updates go through the same static.
        let tss_ref: &'static TaskStateSegment =
            unsafe { &*(core::ptr::addr_of!(*TSS.lock()) as *const TaskStateSegment) };
        let tss_sel = gdt.append(Descriptor::tss_segment(tss_ref));

        (
            gdt,
            Selectors {
                code,
                data,
                tss: tss_sel,
            },
        )
    };
}

/// Load the GDT, reload the segment registers and load the TSS.
pub fn init() {
    GDT.0.load();
    // SAFETY: The selectors reference descriptors in the GDT that was
    // just loaded.
    unsafe {
        CS::set_reg(GDT.1.code);
        DS::set_reg(GDT.1.data);
        ES::set_reg(GDT.1.data);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
    println!("[GDT] descriptor tables loaded, double-fault IST ready");
}

/// Point TSS RSP0 at a thread's kernel stack. Called on every context
/// switch so ring transitions land on the right stack.
pub fn set_kernel_stack(stack_top: u64) {
    TSS.lock().privilege_stack_table[0] = VirtAddr::new(stack_top);
}
