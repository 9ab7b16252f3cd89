//! Threads, processes, and the virtual-runtime accounting behind CFS.

use alloc::string::String;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::mm::PhysicalAddress;

use super::{ProcessId, ThreadId};

/// CFS load weight of a nice-0 task. Every task here runs at nice 0, so
/// vruntime degenerates to wall time; the field and the weighting exist
/// so an RB-tree ordering can replace FIFO without interface changes.
pub const NICE_0_LOAD: u64 = 1024;

/// Default thread priority (mid-scale).
pub const DEFAULT_PRIO: u8 = 128;

/// Thread run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable or currently executing.
    Running,
    /// Waiting on a timer.
    Sleeping,
    /// Waiting on a resource.
    Blocked,
}

/// A kernel thread.
///
/// Threads are allocated once and never move: run queues link them
/// through the intrusive `next` pointer, and the context switch saves
/// and restores `rsp` in place.
pub struct Thread {
    pub tid: ThreadId,
    pub state: ThreadState,
    pub prio: u8,
    /// Virtual runtime in timer ticks (wall time at uniform weight).
    pub vruntime: u64,
    /// Tick at which this thread last started executing.
    pub exec_start: u64,
    /// Saved stack pointer while not running.
    pub rsp: u64,
    /// Top of the thread's kernel stack (for TSS RSP0).
    pub kernel_stack_top: u64,
    /// Owning process; `None` for per-CPU idle threads.
    pub process: Option<NonNull<Process>>,
    /// Intrusive run-queue link.
    pub next: Option<NonNull<Thread>>,
}

// SAFETY: Threads are only manipulated under the owning run queue's lock
// (or before they are first enqueued); the raw process/next pointers
// reference leaked, never-freed allocations.
unsafe impl Send for Thread {}

impl Thread {
    /// A thread with no stack or process attached yet.
    pub fn bare(tid: ThreadId) -> Self {
        Self {
            tid,
            state: ThreadState::Running,
            prio: DEFAULT_PRIO,
            vruntime: 0,
            exec_start: 0,
            rsp: 0,
            kernel_stack_top: 0,
            process: None,
            next: None,
        }
    }

    /// Weight-scaled vruntime charge for `delta` ticks of execution.
    /// All tasks carry `NICE_0_LOAD`, so the charge equals the delta.
    pub fn charge_vruntime(&mut self, delta: u64) {
        self.vruntime += delta * NICE_0_LOAD / Self::weight(self.prio);
    }

    fn weight(_prio: u8) -> u64 {
        NICE_0_LOAD
    }

    /// CR3 value for this thread, if it belongs to a process.
    pub fn address_space_root(&self) -> Option<PhysicalAddress> {
        // SAFETY: The process pointer, when present, references a leaked
        // Process that outlives every thread of it.
        self.process.map(|p| unsafe { p.as_ref() }.cr3)
    }
}

/// A process: an address space plus (for now) exactly one thread.
pub struct Process {
    pub pid: ProcessId,
    /// Display name, truncated to 31 bytes.
    pub name: String,
    /// Physical address of the root PML4 (CR3 value).
    pub cr3: PhysicalAddress,
    /// The process's main thread.
    pub main_thread: NonNull<Thread>,
}

// SAFETY: See Thread -- processes are leaked allocations manipulated
// under scheduler locks.
unsafe impl Send for Process {}

/// Maximum process-name length (31 bytes plus implicit terminator in the
/// on-screen form).
pub const PROCESS_NAME_MAX: usize = 31;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh thread id.
pub fn alloc_tid() -> ThreadId {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Allocate a fresh process id.
pub fn alloc_pid() -> ProcessId {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Truncate a process name to [`PROCESS_NAME_MAX`] bytes.
pub fn clamp_name(name: &str) -> String {
    let mut end = name.len().min(PROCESS_NAME_MAX);
    // Back off to a char boundary so truncation can't split a code point.
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}
