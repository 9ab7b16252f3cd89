//! IRQ handler registry.
//!
//! Legacy IRQs 0..15 arrive on vectors 32..47 and are dispatched through
//! this table. One slot per IRQ: a handler function plus an opaque
//! context word handed back on every invocation. Registration replaces
//! any previous handler for the line.

use crate::sync::SpinLock;

/// Number of legacy IRQ lines.
pub const NUM_IRQS: usize = 16;

/// First IDT vector carrying an IRQ.
pub const IRQ_VECTOR_BASE: u8 = 32;

/// An IRQ handler: called with the opaque context word it was registered
/// with.
pub type IrqHandler = fn(context: usize);

#[derive(Clone, Copy)]
struct Registration {
    handler: IrqHandler,
    context: usize,
}

static HANDLERS: SpinLock<[Option<Registration>; NUM_IRQS]> = SpinLock::new([None; NUM_IRQS]);

/// Register `handler` for `irq`, replacing any previous registration.
/// Out-of-range lines are ignored with a diagnostic.
pub fn register_handler(irq: u8, handler: IrqHandler, context: usize) {
    if irq as usize >= NUM_IRQS {
        log::warn!("IRQ: registration for out-of-range line {}", irq);
        return;
    }
    HANDLERS.lock()[irq as usize] = Some(Registration { handler, context });
}

/// Remove the handler for `irq`.
pub fn unregister_handler(irq: u8) {
    if (irq as usize) < NUM_IRQS {
        HANDLERS.lock()[irq as usize] = None;
    }
}

/// Dispatch one IRQ to its registered handler. Unhandled lines are
/// spurious and silently ignored.
pub fn dispatch(irq: u8) {
    let registration = {
        let table = HANDLERS.lock();
        if irq as usize >= NUM_IRQS {
            None
        } else {
            table[irq as usize]
        }
    };
    if let Some(r) = registration {
        (r.handler)(r.context);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static LAST_CONTEXT: AtomicUsize = AtomicUsize::new(0);

    fn record_context(context: usize) {
        LAST_CONTEXT.store(context, Ordering::SeqCst);
    }

    fn other_handler(context: usize) {
        LAST_CONTEXT.store(context + 1, Ordering::SeqCst);
    }

    #[test]
    fn test_dispatch_passes_context_and_replacement_wins() {
        register_handler(9, record_context, 0x55);
        dispatch(9);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 0x55);

        // Registration replaces the previous handler for the line.
        register_handler(9, other_handler, 0x70);
        dispatch(9);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 0x71);

        unregister_handler(9);
        LAST_CONTEXT.store(0, Ordering::SeqCst);
        dispatch(9);
        assert_eq!(LAST_CONTEXT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_out_of_range_lines_are_ignored() {
        register_handler(200, record_context, 1);
        dispatch(200);
    }
}
