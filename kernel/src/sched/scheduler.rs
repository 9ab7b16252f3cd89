//! The schedule step, thread creation, and preemption accounting.
//!
//! `schedule()` is entered from two places: an explicit `yield_now`, and
//! the LAPIC periodic timer (via the IRQ dispatcher's deferred-reschedule
//! flag). The run-queue lock is handed off across the context switch:
//! the outgoing side leaks its guard, and the lock is released only once
//! the incoming thread is demonstrably the one executing -- either just
//! after `context_switch` returns on its stack, or in the entry
//! trampoline of a brand-new thread.

use alloc::boxed::Box;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
};

use crate::{error::KernelResult, mm::VirtualAddress};

use super::{
    task::{Process, Thread},
    MAX_CPUS,
};

/// Timer ticks since boot (one per LAPIC timer interrupt, nominally
/// every 10 ms).
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Set from interrupt context when the timer wants a reschedule; the IRQ
/// dispatcher consumes it after EOI so the switch never blocks the
/// controller.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// The thread currently executing on each CPU. Null before the CPU
/// adopts its boot context. The current thread is never in a run queue.
static CURRENT: [AtomicPtr<Thread>; MAX_CPUS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

/// Logical index of the executing CPU.
///
/// The LAPIC id is looked up in the table ACPI discovery filled in;
/// before the APIC is up (or on hosted builds) everything is CPU 0.
pub fn current_cpu() -> usize {
    #[cfg(target_os = "none")]
    {
        if let Some(apic_id) = crate::arch::x86_64::apic::read_id() {
            return crate::arch::x86_64::acpi::logical_cpu_index(apic_id).unwrap_or(0);
        }
    }
    0
}

/// Timer ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called once per LAPIC timer interrupt: advance the tick counter and
/// request a reschedule.
pub fn timer_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    NEED_RESCHED.store(true, Ordering::Release);
}

/// Consume the deferred-reschedule flag (IRQ dispatcher, after EOI).
pub fn take_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::Acquire)
}

/// Initialize the scheduler: adopt the boot context as CPU 0's idle
/// thread so the first preemption has something to switch away from.
pub fn init() {
    let boot = Box::leak(Box::new(Thread::bare(0)));
    CURRENT[0].store(boot, Ordering::Release);
    println!("[SCHED] CFS scheduler initialized ({} run queues)", MAX_CPUS);
}

/// Adopt the boot context of an application processor as its idle
/// thread. SMP bring-up beyond run-queue initialization is out of scope;
/// this is the hook an AP entry path calls.
pub fn init_cpu(cpu: usize) {
    if cpu == 0 || cpu >= MAX_CPUS {
        return;
    }
    let idle = Box::leak(Box::new(Thread::bare(0)));
    CURRENT[cpu].store(idle, Ordering::Release);
}

/// Pick the next thread and switch to it.
///
/// 1. Lock this CPU's run queue.
/// 2. Charge the outgoing thread's vruntime; if it is still `Running`,
///    append it at the tail.
/// 3. Dequeue the head. If the queue is empty, return -- the CPU halts
///    in its idle loop until the next interrupt.
/// 4. Publish the pick as current, point TSS RSP0 at its kernel stack,
///    and context-switch with the queue lock handed off.
#[cfg(target_os = "none")]
pub fn schedule() {
    use super::{queue::RUN_QUEUES, task::ThreadState};

    let cpu = current_cpu();
    let mut rq = RUN_QUEUES[cpu].lock();

    let now = ticks();
    let prev_ptr = CURRENT[cpu].load(Ordering::Acquire);
    if let Some(mut prev) = NonNull::new(prev_ptr) {
        // SAFETY: The current thread is owned by this CPU and not linked
        // into any queue; we hold the queue lock.
        let prev_ref = unsafe { prev.as_mut() };
        prev_ref.charge_vruntime(now.saturating_sub(prev_ref.exec_start));
        if prev_ref.state == ThreadState::Running {
            rq.enqueue(prev);
        }
    }

    let Some(mut next) = rq.dequeue() else {
        // Nothing runnable; the guard drops and the caller halts.
        return;
    };

    // SAFETY: Dequeued threads are exclusively ours under the queue lock.
    let next_ref = unsafe { next.as_mut() };
    next_ref.exec_start = now;
    CURRENT[cpu].store(next.as_ptr(), Ordering::Release);

    if core::ptr::eq(next.as_ptr(), prev_ptr) {
        // Sole runnable thread re-picked itself; nothing to switch.
        return;
    }

    let new_cr3 = next_ref
        .address_space_root()
        .map(|p| p.as_u64())
        .unwrap_or(0);
    let next_rsp = next_ref.rsp;
    if next_ref.kernel_stack_top != 0 {
        crate::arch::x86_64::gdt::set_kernel_stack(next_ref.kernel_stack_top);
    }

    let old_rsp = if prev_ptr.is_null() {
        core::ptr::null_mut()
    } else {
        // SAFETY: `prev_ptr` is a leaked thread; storing its saved rsp in
        // place is the context-switch contract.
        unsafe { &mut (*prev_ptr).rsp as *mut u64 }
    };

    // Hand the queue lock across the switch: leak the guard here, release
    // on the incoming side.
    core::mem::forget(rq);
    // SAFETY: `next_rsp` was either saved by a previous switch on a live
    // kernel stack or built by `build_initial_frame`; `new_cr3` is a
    // valid root (or 0 to keep the current one).
    unsafe {
        crate::arch::x86_64::context::context_switch(old_rsp, next_rsp, new_cr3);
    }
    // Back on this stack: whoever switched us in leaked a guard for this
    // CPU's queue. Release it and let interrupts back in.
    finish_switch();
}

/// Release the handed-off run-queue lock on the incoming side of a
/// context switch. Also the first thing a brand-new thread runs.
#[cfg(target_os = "none")]
pub fn finish_switch() {
    // SAFETY: The outgoing side of the switch leaked exactly one guard
    // for this CPU's run queue; ownership travelled with the CPU.
    unsafe {
        super::queue::RUN_QUEUES[current_cpu()].force_unlock();
    }
    x86_64::instructions::interrupts::enable();
}

/// Cooperatively give up the CPU.
#[cfg(target_os = "none")]
pub fn yield_now() {
    schedule();
}

/// Sleep for `ms` milliseconds. Timer-based wakeups are not implemented;
/// this degenerates to a yield.
#[cfg(target_os = "none")]
pub fn sleep(_ms: u64) {
    yield_now();
}

// Hosted stand-ins: scheduling needs a real context switch.
#[cfg(not(target_os = "none"))]
pub fn schedule() {}

#[cfg(not(target_os = "none"))]
pub fn yield_now() {}

#[cfg(not(target_os = "none"))]
pub fn sleep(_ms: u64) {}

/// Build the initial stack frame for a new thread.
///
/// Laid out so that the context switch's register pops and `ret` land in
/// the entry trampoline with the thread's entry point in `rbx`:
/// from the top of the stack downward -- guard word (0), trampoline
/// return address, rbp, rbx = entry, r12, r13, r14, r15. Returns the
/// initial saved stack pointer.
pub fn build_initial_frame(stack_top: VirtualAddress, entry: u64, trampoline: u64) -> u64 {
    let mut sp = stack_top.as_u64();
    let mut push = |value: u64| {
        sp -= 8;
        // SAFETY: The stack pages were just allocated for this thread and
        // the eight pushes stay well inside the topmost page.
        unsafe { *(sp as *mut u64) = value };
    };
    push(0); // guard: a trampoline that returns has nowhere to go
    push(trampoline);
    push(0); // rbp
    push(entry); // rbx -> trampoline hands it to the bootstrap
    push(0); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15
    sp
}

/// Create a process with one thread and enqueue it on CPU 0.
///
/// Allocates the process and thread from the kernel heap, a fresh
/// address space sharing the kernel upper half, and a 4-page kernel
/// stack whose initial call frame `ret`s into `entry` via the entry
/// trampoline.
#[cfg(target_os = "none")]
pub fn process_create(name: &str, entry: extern "C" fn()) -> KernelResult<NonNull<Process>> {
    use super::{
        queue::RUN_QUEUES,
        task::{alloc_pid, alloc_tid, clamp_name},
    };
    use crate::mm::{pmm, vmm, KERNEL_STACK_PAGES, PAGE_SIZE};

    let space = vmm::create_address_space()?;
    let stack = pmm::alloc_pages(KERNEL_STACK_PAGES)?;
    let stack_top = stack.as_u64() + (KERNEL_STACK_PAGES * PAGE_SIZE) as u64;

    let mut thread = Box::new(Thread::bare(alloc_tid()));
    thread.kernel_stack_top = stack_top;
    thread.rsp = build_initial_frame(
        VirtualAddress::new(stack_top),
        entry as usize as u64,
        crate::arch::x86_64::context::thread_entry_trampoline as usize as u64,
    );
    let mut thread = NonNull::from(Box::leak(thread));

    let process = NonNull::from(Box::leak(Box::new(Process {
        pid: alloc_pid(),
        name: clamp_name(name),
        cr3: space.root(),
        main_thread: thread,
    })));

    // SAFETY: The thread was just leaked and is not yet visible to any
    // queue or CPU.
    unsafe {
        thread.as_mut().process = Some(process);
    }

    RUN_QUEUES[0].lock().enqueue(thread);

    // SAFETY: Just-leaked process allocation.
    let pid = unsafe { process.as_ref() }.pid;
    println!("[SCHED] process '{}' created (pid {})", clamp_name(name), pid);
    Ok(process)
}

#[cfg(not(target_os = "none"))]
pub fn process_create(_name: &str, _entry: extern "C" fn()) -> KernelResult<NonNull<Process>> {
    Err(crate::error::KernelError::NotInitialized {
        subsystem: "scheduler (bare metal only)",
    })
}
