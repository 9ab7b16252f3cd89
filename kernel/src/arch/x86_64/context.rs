//! Low-level context switch.
//!
//! Saves the callee-saved register set on the outgoing stack, stores the
//! outgoing stack pointer, optionally reloads CR3, then restores the
//! incoming stack and registers. Returning from the final `ret` resumes
//! the incoming thread exactly where it left off -- or, for a brand-new
//! thread, enters [`thread_entry_trampoline`] with the entry point in
//! `rbx` (see the initial-frame layout in the scheduler).

use core::arch::naked_asm;

/// Switch stacks (and address space) to another thread.
///
/// * `old_rsp` -- where to store the outgoing stack pointer; null when
///   the outgoing context is being abandoned.
/// * `new_rsp` -- the incoming thread's saved stack pointer.
/// * `new_cr3` -- the incoming thread's root table, or 0 to keep the
///   current one. Only written when it differs, to spare the TLB.
///
/// # Safety
///
/// `new_rsp` must point at a frame laid down by a previous switch or by
/// the scheduler's initial-frame builder, and `new_cr3` (when non-zero)
/// must map all kernel code and data. The caller must hold the run-queue
/// lock whose ownership travels with the CPU (released by the incoming
/// side).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old_rsp: *mut u64, new_rsp: u64, new_cr3: u64) {
    naked_asm!(
        // Callee-saved register set of the System V ABI.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish the outgoing stack pointer, if there is a thread to
        // resume later.
        "test rdi, rdi",
        "jz 2f",
        "mov [rdi], rsp",
        "2:",
        // Reload CR3 only when the address space actually changes.
        "test rdx, rdx",
        "jz 3f",
        "mov rax, cr3",
        "cmp rax, rdx",
        "je 3f",
        "mov cr3, rdx",
        "3:",
        // Adopt the incoming stack and restore its register set.
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First code a brand-new thread executes.
///
/// The initial frame parks the thread's entry point in `rbx`; move it
/// into the first-argument register and finish the switch in Rust.
#[unsafe(naked)]
pub extern "C" fn thread_entry_trampoline() {
    naked_asm!("mov rdi, rbx", "jmp {bootstrap}", bootstrap = sym thread_bootstrap);
}

/// Release the handed-off run-queue lock, run the thread, and idle if it
/// ever returns.
extern "C" fn thread_bootstrap(entry: extern "C" fn()) -> ! {
    crate::sched::scheduler::finish_switch();
    entry();
    // Thread exit is not implemented; a returning entry point just
    // yields forever.
    loop {
        crate::sched::yield_now();
        x86_64::instructions::hlt();
    }
}
