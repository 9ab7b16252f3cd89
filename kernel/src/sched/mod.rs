//! CFS-style scheduler: per-CPU run queues, thread and process lifecycle,
//! cooperative yield and timer-driven preemption.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{init, process_create, schedule, sleep, timer_tick, yield_now};
pub use task::{Process, Thread, ThreadState};

/// Process identifier.
pub type ProcessId = u32;

/// Thread identifier.
pub type ThreadId = u32;

/// Logical processors supported (laptop-class: up to 8 hardware threads).
pub const MAX_CPUS: usize = 8;
