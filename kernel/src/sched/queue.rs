//! Per-CPU run queues.
//!
//! FIFO order through an intrusive singly-linked list: enqueue at the
//! tail, dequeue at the head. `min_vruntime` is tracked so an RB-tree
//! ordering can replace the FIFO without changing the interface.
//!
//! Invariants: a thread is linked into at most one run queue at a time,
//! and the currently-executing thread is not in any queue.

use core::ptr::NonNull;

use crate::sync::SpinLock;

use super::{
    task::{Thread, ThreadState},
    MAX_CPUS,
};

/// One CPU's queue of runnable threads.
pub struct RunQueue {
    head: Option<NonNull<Thread>>,
    tail: Option<NonNull<Thread>>,
    nr_running: u32,
    min_vruntime: u64,
}

// SAFETY: The queue owns its links exclusively; all mutation happens
// under the enclosing SpinLock.
unsafe impl Send for RunQueue {}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            nr_running: 0,
            min_vruntime: 0,
        }
    }

    /// Append a thread at the tail and mark it runnable.
    pub fn enqueue(&mut self, mut thread: NonNull<Thread>) {
        // SAFETY: Caller hands over the sole reference to this thread;
        // the queue lock serializes link updates.
        let t = unsafe { thread.as_mut() };
        debug_assert!(t.next.is_none(), "thread already linked into a queue");
        t.state = ThreadState::Running;
        t.next = None;
        if t.vruntime < self.min_vruntime {
            t.vruntime = self.min_vruntime;
        }
        match self.tail {
            // SAFETY: `tail` is a valid queue member while linked.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(thread) },
            None => self.head = Some(thread),
        }
        self.tail = Some(thread);
        self.nr_running += 1;
    }

    /// Remove and return the head of the queue.
    pub fn dequeue(&mut self) -> Option<NonNull<Thread>> {
        let mut head = self.head?;
        // SAFETY: `head` is a valid queue member while linked.
        let t = unsafe { head.as_mut() };
        self.head = t.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.nr_running -= 1;
        if t.vruntime > self.min_vruntime {
            self.min_vruntime = t.vruntime;
        }
        Some(head)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> u32 {
        self.nr_running
    }

    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    /// Walk the list counting nodes -- the check behind the
    /// `nr_running == length(list)` invariant.
    pub fn linked_len(&self) -> u32 {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            n += 1;
            // SAFETY: Linked nodes are valid until dequeued.
            cursor = unsafe { node.as_ref() }.next;
        }
        n
    }

    /// Whether `thread` is linked into this queue.
    pub fn contains(&self, thread: NonNull<Thread>) -> bool {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if node == thread {
                return true;
            }
            // SAFETY: Linked nodes are valid until dequeued.
            cursor = unsafe { node.as_ref() }.next;
        }
        false
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-CPU run queues, indexed by logical CPU number.
pub static RUN_QUEUES: [SpinLock<RunQueue>; MAX_CPUS] =
    [const { SpinLock::new(RunQueue::new()) }; MAX_CPUS];

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::sched::task::Thread;

    fn leaked(tid: u32) -> NonNull<Thread> {
        NonNull::from(Box::leak(Box::new(Thread::bare(tid))))
    }

    #[test]
    fn test_fifo_order() {
        let mut rq = RunQueue::new();
        let t1 = leaked(1);
        let t2 = leaked(2);
        let t3 = leaked(3);
        rq.enqueue(t1);
        rq.enqueue(t2);
        rq.enqueue(t3);

        assert_eq!(rq.len(), 3);
        assert_eq!(rq.dequeue(), Some(t1));
        assert_eq!(rq.dequeue(), Some(t2));
        assert_eq!(rq.dequeue(), Some(t3));
        assert_eq!(rq.dequeue(), None);
        assert_eq!(rq.len(), 0);
    }

    #[test]
    fn test_round_robin_rotation() {
        // Three same-priority threads plus an initial caller: after each
        // "yield" the caller's slot rotates through enqueue order, then
        // the set round-robins.
        let mut rq = RunQueue::new();
        let t1 = leaked(11);
        let t2 = leaked(12);
        let t3 = leaked(13);
        rq.enqueue(t1);
        rq.enqueue(t2);
        rq.enqueue(t3);

        let mut current = leaked(10); // the initial caller
        let mut order = alloc::vec::Vec::new();
        for _ in 0..6 {
            rq.enqueue(current);
            let next = rq.dequeue().unwrap();
            // SAFETY: Leaked test thread, never freed.
            order.push(unsafe { next.as_ref() }.tid);
            current = next;
        }
        assert_eq!(order, [11, 12, 13, 10, 11, 12]);
    }

    #[test]
    fn test_nr_running_matches_linked_length() {
        let mut rq = RunQueue::new();
        for tid in 0..5 {
            rq.enqueue(leaked(100 + tid));
        }
        assert_eq!(rq.len(), rq.linked_len());
        rq.dequeue();
        rq.dequeue();
        assert_eq!(rq.len(), 3);
        assert_eq!(rq.len(), rq.linked_len());
    }

    #[test]
    fn test_dequeued_thread_is_unlinked() {
        let mut rq = RunQueue::new();
        let t = leaked(42);
        rq.enqueue(t);
        let got = rq.dequeue().unwrap();
        assert_eq!(got, t);
        // SAFETY: Leaked test thread.
        assert!(unsafe { got.as_ref() }.next.is_none());
        assert!(!rq.contains(t));
    }

    #[test]
    fn test_min_vruntime_floor_on_enqueue() {
        let mut rq = RunQueue::new();
        let mut t1 = leaked(1);
        // SAFETY: Leaked test thread, not yet shared.
        unsafe { t1.as_mut() }.vruntime = 50;
        rq.enqueue(t1);
        rq.dequeue();
        assert_eq!(rq.min_vruntime(), 50);

        // A newly woken thread can't undercut the queue's floor.
        let t2 = leaked(2);
        rq.enqueue(t2);
        // SAFETY: Leaked test thread.
        assert_eq!(unsafe { t2.as_ref() }.vruntime, 50);
    }
}
